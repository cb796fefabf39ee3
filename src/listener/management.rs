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

//! Inbound listeners for operational ports such as health checks.

use std::{net::IpAddr, sync::Arc};

use super::{
    chain::{self, FilterChainOpts, ListenerOpts},
    metrics, BuildContext, Stage,
};
use crate::{
    model::{
        AddressFamily, NetworkEndpoint, PortList, Protocol, Service, ServiceInstance,
        TrafficDirection,
    },
    net,
    plugin::MutableObjects,
    xds::Listener,
};

/// Hostname of the synthetic service management ports belong to.
pub const MANAGEMENT_CLUSTER_HOSTNAME: &str = "mgmtCluster";

/// Builds the management listeners of every proxy address, leaving out any
/// whose address is already taken by a listener in `existing`.
pub(crate) fn build(ctx: &BuildContext<'_>, existing: &[Listener]) -> Vec<Listener> {
    if ctx.proxy.sidecar_scope.has_custom_ingress_listeners() || ctx.proxy.is_none_mode() {
        return Vec::new();
    }

    let built = ctx
        .proxy
        .ip_addresses
        .iter()
        .flat_map(|ip| build_for_ip(ctx, &ctx.push.env.management_ports(ip), ip));

    let mut listeners: Vec<Listener> = Vec::new();
    for management in built {
        let collision = existing
            .iter()
            .chain(&listeners)
            .find(|listener| listener.address == management.address)
            .map(|listener| listener.name.clone());

        if let Some(service_listener) = collision {
            tracing::warn!(
                proxy = %ctx.proxy.id,
                management = %management.name,
                listener = %service_listener,
                "omitting management listener, its address collides with a service listener"
            );
            metrics::dropped_listeners(Stage::Management).inc();
            continue;
        }

        listeners.push(management);
    }

    listeners
}

fn build_for_ip(ctx: &BuildContext<'_>, ports: &PortList, ip: &str) -> Vec<Listener> {
    let address = if ip.is_empty() {
        let first_is_v6 = ctx
            .proxy
            .ip_addresses
            .first()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .is_some_and(|ip| ip.is_ipv6());
        if first_is_v6 {
            net::LOCALHOST_IPV6
        } else {
            net::LOCALHOST_IPV4
        }
    } else if ip.parse::<IpAddr>().is_ok() {
        ip
    } else {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            %ip,
            "skipping management listeners for an unparseable proxy address"
        );
        return Vec::new();
    };

    let service = Arc::new(Service {
        hostname: MANAGEMENT_CLUSTER_HOSTNAME.into(),
        ..<_>::default()
    });

    let mut listeners = Vec::with_capacity(ports.len());
    for port in ports {
        if !is_supported(port.protocol) {
            tracing::warn!(
                proxy = %ctx.proxy.id,
                port = port.port,
                protocol = %port.protocol,
                "unsupported protocol for management port"
            );
            continue;
        }

        let instance = ServiceInstance {
            endpoint: NetworkEndpoint {
                family: AddressFamily::Tcp,
                address: address.into(),
                port: port.port,
                service_port: port.clone(),
            },
            service: service.clone(),
            labels: <_>::default(),
            service_account: String::new(),
        };

        let opts = ListenerOpts {
            bind: address.into(),
            port: port.port,
            bind_to_port: false,
            filter_chains: vec![FilterChainOpts::network(
                ctx.push.env.inbound_network_filters(ctx.proxy, &instance),
            )],
        };

        let mut listener = chain::build_listener(&opts);
        listener.traffic_direction = Some(TrafficDirection::Inbound);
        let mut mutable = MutableObjects::new(listener);

        match chain::build_complete_filter_chain(ctx.mesh(), ctx.proxy, &mut mutable, &opts) {
            Ok(()) => listeners.push(mutable.listener),
            Err(error) => {
                tracing::warn!(
                    proxy = %ctx.proxy.id,
                    port = port.port,
                    %error,
                    "dropping management listener"
                );
                metrics::dropped_listeners(Stage::Management).inc();
            }
        }
    }

    listeners
}

/// Management ports are always proxied as TCP, whatever they speak.
fn is_supported(protocol: Protocol) -> bool {
    matches!(
        protocol,
        Protocol::Http
            | Protocol::Http2
            | Protocol::Grpc
            | Protocol::GrpcWeb
            | Protocol::Tcp
            | Protocol::Https
            | Protocol::Tls
            | Protocol::Mongo
            | Protocol::Redis
            | Protocol::Mysql
    )
}
