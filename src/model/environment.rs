/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use super::{cluster_name, PortList, Protocol, Proxy, Service, ServiceInstance, TrafficDirection};
use crate::{
    model::Port,
    xds::{Filter, Route, RouteConfiguration, VirtualHost},
};

/// Arguments for [`Environment::outbound_tcp_filter_chains`].
#[derive(Clone, Copy, Debug)]
pub struct OutboundTcpParams<'a> {
    pub proxy: &'a Proxy,
    pub service: &'a Service,
    pub port: &'a Port,
    /// Set when the service address is a CIDR range and the listener was
    /// moved to the wildcard bind.
    pub destination_cidr: Option<&'a str>,
    /// The wildcard address of the proxy's IP family.
    pub wildcard: &'a str,
}

/// One outbound TCP filter chain, before assembly.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TcpChain {
    pub sni_hosts: Vec<String>,
    pub destination_cidrs: Vec<String>,
    pub filters: Vec<Filter>,
}

/// The collaborators listener synthesis consults: the service registry's
/// management ports, and the generators of network filters and routes.
///
/// Every method has a default producing a plain `tcp_proxy` or single-route
/// configuration, so implementors override only what they generate
/// themselves.
pub trait Environment: Send + Sync {
    /// Operational ports (health checks, admin) served on `address`.
    fn management_ports(&self, _address: &str) -> PortList {
        PortList::default()
    }

    /// The network filters terminating inbound TCP traffic for `instance`.
    fn inbound_network_filters(&self, _proxy: &Proxy, instance: &ServiceInstance) -> Vec<Filter> {
        let cluster = inbound_cluster(instance);
        vec![Filter::tcp_proxy(&cluster, &cluster)]
    }

    /// The static route table of an inbound HTTP listener.
    fn inbound_route_config(
        &self,
        _proxy: &Proxy,
        instance: &ServiceInstance,
    ) -> RouteConfiguration {
        let cluster = inbound_cluster(instance);
        RouteConfiguration {
            name: cluster.clone(),
            virtual_hosts: vec![VirtualHost {
                name: format!("inbound|http|{}", instance.endpoint.service_port.port),
                domains: vec!["*".into()],
                routes: vec![Route {
                    prefix: "/".into(),
                    cluster,
                }],
            }],
        }
    }

    /// The filter chains of an outbound TCP listener for one service port.
    fn outbound_tcp_filter_chains(&self, params: OutboundTcpParams<'_>) -> Vec<TcpChain> {
        let OutboundTcpParams {
            proxy,
            service,
            port,
            destination_cidr,
            wildcard,
        } = params;

        let cluster = cluster_name(TrafficDirection::Outbound, "", &service.hostname, port.port);
        let address = service.address_for_proxy(proxy);
        let address = (!address.contains('/')).then_some(address);

        let mut chain = TcpChain {
            filters: vec![Filter::tcp_proxy(&cluster, &cluster)],
            ..<_>::default()
        };

        match destination_cidr {
            Some(cidr) => chain.destination_cidrs.push(cidr.into()),
            None => {
                if let Some(address) = address.filter(|a| !a.is_empty() && *a != wildcard) {
                    chain.destination_cidrs.push(address.into());
                }
            }
        }

        // Without a dedicated address the hostname is the only way to tell
        // TLS destinations apart.
        let shared_address = destination_cidr.is_some()
            || address.map_or(true, |a| a.is_empty() || a == wildcard);
        if matches!(port.protocol, Protocol::Https | Protocol::Tls) && shared_address {
            chain.sni_hosts.push(service.hostname.to_string());
        }

        vec![chain]
    }
}

fn inbound_cluster(instance: &ServiceInstance) -> String {
    let port = &instance.endpoint.service_port;
    cluster_name(
        TrafficDirection::Inbound,
        &port.name,
        &instance.service.hostname,
        port.port,
    )
}

/// An [`Environment`] using every default, serving a fixed list of
/// management ports on each proxy address.
#[derive(Clone, Debug, Default)]
pub struct DefaultEnvironment {
    pub management_ports: PortList,
}

impl Environment for DefaultEnvironment {
    fn management_ports(&self, _address: &str) -> PortList {
        self.management_ports.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::NetworkEndpoint;

    fn service(address: &str, protocol: Protocol) -> Service {
        Service {
            hostname: "db.default.svc.cluster.local".into(),
            address: address.into(),
            ports: vec![Port::new("tcp", 3306, protocol)].into(),
            ..<_>::default()
        }
    }

    fn default_chains(service: &Service, destination_cidr: Option<&str>) -> Vec<TcpChain> {
        DefaultEnvironment::default().outbound_tcp_filter_chains(OutboundTcpParams {
            proxy: &Proxy::default(),
            service,
            port: service.ports.iter().next().unwrap(),
            destination_cidr,
            wildcard: "0.0.0.0",
        })
    }

    #[test]
    fn outbound_vip_matches_destination() {
        let chains = default_chains(&service("10.0.0.7", Protocol::Tcp), None);
        assert_eq!(1, chains.len());
        assert_eq!(vec!["10.0.0.7".to_owned()], chains[0].destination_cidrs);
        assert!(chains[0].sni_hosts.is_empty());
        assert_eq!(
            vec![Filter::tcp_proxy(
                "outbound|3306||db.default.svc.cluster.local",
                "outbound|3306||db.default.svc.cluster.local"
            )],
            chains[0].filters
        );
    }

    #[test]
    fn outbound_cidr_range() {
        let chains = default_chains(&service("10.0.0.0/16", Protocol::Tcp), Some("10.0.0.0/16"));
        assert_eq!(vec!["10.0.0.0/16".to_owned()], chains[0].destination_cidrs);
    }

    #[test]
    fn outbound_headless_has_no_match() {
        let chains = default_chains(&service("0.0.0.0", Protocol::Tcp), None);
        assert!(chains[0].destination_cidrs.is_empty());
        assert!(chains[0].sni_hosts.is_empty());
    }

    #[test]
    fn outbound_tls_without_vip_matches_sni() {
        let chains = default_chains(&service("0.0.0.0", Protocol::Tls), None);
        assert_eq!(
            vec!["db.default.svc.cluster.local".to_owned()],
            chains[0].sni_hosts
        );

        let chains = default_chains(&service("10.0.0.7", Protocol::Https), None);
        assert!(chains[0].sni_hosts.is_empty());
    }

    #[test]
    fn inbound_defaults() {
        let service = Arc::new(service("10.0.0.7", Protocol::Tcp));
        let instance = ServiceInstance {
            endpoint: NetworkEndpoint {
                address: "10.4.0.1".into(),
                port: 3306,
                service_port: Port::new("tcp", 3306, Protocol::Tcp),
                ..<_>::default()
            },
            service,
            labels: <_>::default(),
            service_account: String::new(),
        };
        let env = DefaultEnvironment::default();
        let proxy = Proxy::default();

        assert_eq!(
            vec![Filter::tcp_proxy(
                "inbound|3306|tcp|db.default.svc.cluster.local",
                "inbound|3306|tcp|db.default.svc.cluster.local"
            )],
            env.inbound_network_filters(&proxy, &instance)
        );

        let routes = env.inbound_route_config(&proxy, &instance);
        assert_eq!("inbound|http|3306", routes.virtual_hosts[0].name);
        assert_eq!(
            "inbound|3306|tcp|db.default.svc.cluster.local",
            routes.virtual_hosts[0].routes[0].cluster
        );
    }
}
