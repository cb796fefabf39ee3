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

use std::{collections::BTreeMap, fmt, net::IpAddr, path::Path, sync::Arc};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{Protocol, Proxy, TrafficDirection, ValidationError, ValidationErrors};

/// Prefix marking a bind or endpoint address as a unix domain socket.
pub const UNIX_ADDRESS_PREFIX: &str = "unix://";

const DNS1123_LABEL_MAX_LENGTH: usize = 63;
const LABEL_VALUE_MAX_LENGTH: usize = 63;

static DNS1123_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());
static QUALIFIED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").unwrap());

pub(crate) fn is_dns1123_label(value: &str) -> bool {
    value.len() <= DNS1123_LABEL_MAX_LENGTH && DNS1123_LABEL.is_match(value)
}

/// Fully qualified name of a service, e.g. `reviews.default.svc.cluster.local`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[serde(transparent)]
pub struct Hostname(String);

impl Hostname {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Hostname {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Hostname {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A named, numbered port with its application protocol.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, Hash, PartialEq)]
pub struct Port {
    #[serde(default)]
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

impl Port {
    pub fn new(name: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            name: name.into(),
            port,
            protocol,
        }
    }
}

/// Ordered list of service ports.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct PortList(Vec<Port>);

impl PortList {
    pub fn new(ports: Vec<Port>) -> Self {
        Self(ports)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Port> {
        self.0.iter().find(|port| port.name == name)
    }

    pub fn get_by_port(&self, number: u16) -> Option<&Port> {
        self.0.iter().find(|port| port.port == number)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Port> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Port>> for PortList {
    fn from(ports: Vec<Port>) -> Self {
        Self(ports)
    }
}

impl<'a> IntoIterator for &'a PortList {
    type Item = &'a Port;
    type IntoIter = std::slice::Iter<'a, Port>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// How a service's address is turned into endpoints by the proxy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    /// The proxy load balances across the endpoints it is told about.
    #[default]
    ClientSideLb,
    /// The proxy resolves the hostname through DNS.
    DnsLb,
    /// Connections are forwarded to their original destination.
    Passthrough,
}

/// A catalog service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct Service {
    pub hostname: Hostname,
    /// A single VIP, a CIDR range, or the unspecified address for services
    /// without a VIP.
    #[serde(default)]
    pub address: String,
    /// VIPs assigned to this service in particular clusters, keyed by
    /// cluster id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cluster_vips: BTreeMap<String, String>,
    pub ports: PortList,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default)]
    pub mesh_external: bool,
}

impl Service {
    /// The address `proxy` should use to reach this service, preferring a
    /// VIP assigned in the proxy's own cluster.
    pub fn address_for_proxy(&self, proxy: &Proxy) -> &str {
        proxy
            .cluster_id
            .as_ref()
            .and_then(|cluster| self.cluster_vips.get(cluster))
            .map(String::as_str)
            .unwrap_or(&self.address)
    }

    /// Checks the hostname and declared ports, collecting every problem.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if self.hostname.is_empty() {
            errors.push(ValidationError::EmptyHostname);
        }
        for part in self.hostname.as_str().split('.') {
            if !is_dns1123_label(part) {
                errors.push(ValidationError::InvalidHostnamePart(part.into()));
            }
        }

        if self.ports.is_empty() {
            errors.push(ValidationError::NoPorts);
        }

        let mut seen = std::collections::HashSet::new();
        for port in &self.ports {
            if port.name.is_empty() {
                if self.ports.len() > 1 {
                    errors.push(ValidationError::EmptyPortName);
                }
            } else if !is_dns1123_label(&port.name) {
                errors.push(ValidationError::InvalidPortName(port.name.clone()));
            } else if !seen.insert(&port.name) {
                errors.push(ValidationError::DuplicatePortName(port.name.clone()));
            }

            if port.port == 0 {
                errors.push(ValidationError::InvalidPort {
                    name: port.name.clone(),
                    port: port.port,
                });
            }
        }

        ValidationErrors::into_result(errors)
    }
}

/// Name of the cluster serving `hostname` on `port`, e.g.
/// `outbound|9080||reviews.default.svc.cluster.local`.
pub fn cluster_name(
    direction: TrafficDirection,
    subset: &str,
    hostname: &Hostname,
    port: u16,
) -> String {
    format!("{direction}|{port}|{subset}|{hostname}")
}

/// Address family of a [`NetworkEndpoint`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Tcp,
    Unix,
}

/// A concrete address serving one port of a service.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct NetworkEndpoint {
    #[serde(default)]
    pub family: AddressFamily,
    pub address: String,
    #[serde(default)]
    pub port: u16,
    pub service_port: Port,
}

/// Checks that the endpoint address fits its family: an IP or FQDN for TCP,
/// an absolute socket path for unix domain sockets.
pub fn validate_network_endpoint_address(
    endpoint: &NetworkEndpoint,
) -> Result<(), ValidationError> {
    match endpoint.family {
        AddressFamily::Tcp => {
            if endpoint.address.parse::<IpAddr>().is_err() && !is_fqdn(&endpoint.address) {
                return Err(ValidationError::InvalidAddress(endpoint.address.clone()));
            }
        }
        AddressFamily::Unix => {
            let path = endpoint
                .address
                .strip_prefix(UNIX_ADDRESS_PREFIX)
                .unwrap_or(&endpoint.address);
            if path.is_empty() || !Path::new(path).is_absolute() {
                return Err(ValidationError::NotAbsolutePath(endpoint.address.clone()));
            }
        }
    }

    Ok(())
}

fn is_fqdn(value: &str) -> bool {
    let value = value.strip_suffix('.').unwrap_or(value);
    !value.is_empty() && value.len() <= 255 && value.split('.').all(is_dns1123_label)
}

/// Workload labels.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct Labels(pub BTreeMap<String, String>);

impl Labels {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();
        for (key, value) in &self.0 {
            if !is_label_key(key) {
                errors.push(ValidationError::InvalidLabelKey(key.clone()));
            }
            if !value.is_empty()
                && (value.len() > LABEL_VALUE_MAX_LENGTH || !QUALIFIED_NAME.is_match(value))
            {
                errors.push(ValidationError::InvalidLabelValue {
                    key: key.clone(),
                    value: value.clone(),
                });
            }
        }
        ValidationErrors::into_result(errors)
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Labels {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
        )
    }
}

fn is_label_key(key: &str) -> bool {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    let prefix_ok = prefix.map_or(true, |prefix| {
        prefix.len() <= 253 && prefix.split('.').all(is_dns1123_label)
    });

    prefix_ok && name.len() <= DNS1123_LABEL_MAX_LENGTH && QUALIFIED_NAME.is_match(name)
}

/// One endpoint of a service, as seen by the proxy co-located with it.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq)]
pub struct ServiceInstance {
    pub endpoint: NetworkEndpoint,
    pub service: Arc<Service>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub service_account: String,
}

impl ServiceInstance {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        if let Err(error) = self.service.validate() {
            errors.extend(error.0);
        }
        if let Err(error) = self.labels.validate() {
            errors.extend(error.0);
        }
        if let Err(error) = validate_network_endpoint_address(&self.endpoint) {
            errors.push(error);
        }
        if self.endpoint.family == AddressFamily::Tcp && self.endpoint.port == 0 {
            errors.push(ValidationError::InvalidPort {
                name: self.endpoint.service_port.name.clone(),
                port: self.endpoint.port,
            });
        }

        let port = &self.endpoint.service_port;
        match self.service.ports.get_by_name(&port.name) {
            None => errors.push(ValidationError::MissingServicePort(port.name.clone())),
            Some(expected) => {
                if expected.port != port.port {
                    errors.push(ValidationError::UnexpectedServicePort {
                        actual: port.port,
                        expected: expected.port,
                    });
                }
                if expected.protocol != port.protocol {
                    errors.push(ValidationError::UnexpectedServiceProtocol {
                        actual: port.protocol,
                        expected: expected.protocol,
                    });
                }
            }
        }

        ValidationErrors::into_result(errors)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn service() -> Service {
        Service {
            hostname: "reviews.default.svc.cluster.local".into(),
            address: "10.0.0.5".into(),
            ports: vec![
                Port::new("http", 9080, Protocol::Http),
                Port::new("grpc", 9090, Protocol::Grpc),
            ]
            .into(),
            ..<_>::default()
        }
    }

    #[test]
    fn valid_service() {
        assert_eq!(Ok(()), service().validate());
    }

    #[test]
    fn invalid_service_collects_every_error() {
        let service = Service {
            hostname: "Bad_Host.default".into(),
            ports: vec![
                Port::new("", 80, Protocol::Http),
                Port::new("http", 0, Protocol::Http),
                Port::new("http", 81, Protocol::Http),
            ]
            .into(),
            ..<_>::default()
        };

        let errors = service.validate().unwrap_err();
        assert_eq!(
            vec![
                ValidationError::InvalidHostnamePart("Bad_Host".into()),
                ValidationError::EmptyPortName,
                ValidationError::InvalidPort {
                    name: "http".into(),
                    port: 0
                },
                ValidationError::DuplicatePortName("http".into()),
            ],
            errors.0
        );
    }

    #[test]
    fn empty_service() {
        let errors = Service::default().validate().unwrap_err();
        assert_eq!(
            vec![
                ValidationError::EmptyHostname,
                ValidationError::InvalidHostnamePart(String::new()),
                ValidationError::NoPorts,
            ],
            errors.0
        );
    }

    #[test]
    fn single_unnamed_port_is_allowed() {
        let service = Service {
            hostname: "db".into(),
            ports: vec![Port::new("", 5432, Protocol::Tcp)].into(),
            ..<_>::default()
        };
        assert!(service.validate().is_ok());
    }

    #[test]
    fn cluster_vip_preferred() {
        let mut service = service();
        service
            .cluster_vips
            .insert("east".into(), "10.1.0.5".into());

        let mut proxy = Proxy::default();
        assert_eq!("10.0.0.5", service.address_for_proxy(&proxy));
        proxy.cluster_id = Some("east".into());
        assert_eq!("10.1.0.5", service.address_for_proxy(&proxy));
        proxy.cluster_id = Some("west".into());
        assert_eq!("10.0.0.5", service.address_for_proxy(&proxy));
    }

    #[test]
    fn endpoint_addresses() {
        let mut endpoint = NetworkEndpoint {
            address: "10.4.4.4".into(),
            port: 80,
            ..<_>::default()
        };
        assert!(validate_network_endpoint_address(&endpoint).is_ok());

        endpoint.address = "db.example.com".into();
        assert!(validate_network_endpoint_address(&endpoint).is_ok());

        endpoint.address = "not an address".into();
        assert_eq!(
            Err(ValidationError::InvalidAddress("not an address".into())),
            validate_network_endpoint_address(&endpoint)
        );

        endpoint.family = AddressFamily::Unix;
        endpoint.address = "/var/run/app.sock".into();
        assert!(validate_network_endpoint_address(&endpoint).is_ok());

        endpoint.address = "unix:///var/run/app.sock".into();
        assert!(validate_network_endpoint_address(&endpoint).is_ok());

        endpoint.address = "app.sock".into();
        assert!(validate_network_endpoint_address(&endpoint).is_err());
    }

    #[test]
    fn labels() {
        assert!(Labels::from([("app", "reviews"), ("example.com/tier", "")])
            .validate()
            .is_ok());

        let errors = Labels::from([("-app", "reviews"), ("version", "v 1")])
            .validate()
            .unwrap_err();
        assert_eq!(2, errors.0.len());
    }

    #[test]
    fn instance_service_port_must_match() {
        let service = Arc::new(service());
        let mut instance = ServiceInstance {
            endpoint: NetworkEndpoint {
                address: "10.4.4.4".into(),
                port: 9080,
                service_port: Port::new("http", 9080, Protocol::Http),
                ..<_>::default()
            },
            service,
            labels: Labels::from([("app", "reviews")]),
            service_account: "default".into(),
        };
        assert_eq!(Ok(()), instance.validate());

        instance.endpoint.service_port = Port::new("http", 9081, Protocol::Http2);
        assert_eq!(
            vec![
                ValidationError::UnexpectedServicePort {
                    actual: 9081,
                    expected: 9080
                },
                ValidationError::UnexpectedServiceProtocol {
                    actual: Protocol::Http2,
                    expected: Protocol::Http
                },
            ],
            instance.validate().unwrap_err().0
        );

        instance.endpoint.service_port = Port::new("tcp", 9080, Protocol::Tcp);
        assert_eq!(
            vec![ValidationError::MissingServicePort("tcp".into())],
            instance.validate().unwrap_err().0
        );
    }

    #[test]
    fn cluster_names() {
        assert_eq!(
            "inbound|9080|http|reviews",
            cluster_name(TrafficDirection::Inbound, "http", &"reviews".into(), 9080)
        );
        assert_eq!(
            "outbound|80||db",
            cluster_name(TrafficDirection::Outbound, "", &"db".into(), 80)
        );
    }
}
