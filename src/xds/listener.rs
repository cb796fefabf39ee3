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

use std::collections::BTreeMap;

use serde::Serialize;

use super::{names, HttpConnectionManager, TcpProxy, ValidationError};

pub use crate::model::TrafficDirection;

/// Opaque per-chain metadata, keyed by filter namespace.
pub type Metadata = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Address {
    Socket { address: String, port_value: u16 },
    Pipe { path: String },
}

impl Address {
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Socket { port_value, .. } => Some(*port_value),
            Self::Pipe { .. } => None,
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct CidrRange {
    pub address_prefix: String,
    pub prefix_len: u8,
}

/// Conditions a connection must meet to be handled by a filter chain.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FilterChainMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prefix_ranges: Vec<CidrRange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub server_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_protocol: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub application_protocols: Vec<String>,
}

impl FilterChainMatch {
    /// Matches every connection.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Downstream TLS settings of a filter chain.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct TlsContext {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn_protocols: Vec<String>,
    pub require_client_certificate: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterConfig {
    TcpProxy(TcpProxy),
    HttpConnectionManager(Box<HttpConnectionManager>),
    Opaque(serde_json::Value),
}

/// A network filter.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Filter {
    pub name: String,
    #[serde(rename = "typed_config")]
    pub config: FilterConfig,
}

impl Filter {
    pub fn new(name: impl Into<String>, config: FilterConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn tcp_proxy(stat_prefix: &str, cluster: &str) -> Self {
        Self::new(
            names::TCP_PROXY,
            FilterConfig::TcpProxy(TcpProxy {
                stat_prefix: stat_prefix.into(),
                cluster: cluster.into(),
            }),
        )
    }

    pub fn http_connection_manager(manager: HttpConnectionManager) -> Self {
        Self::new(
            names::HTTP_CONNECTION_MANAGER,
            FilterConfig::HttpConnectionManager(Box::new(manager)),
        )
    }
}

/// A filter inspecting a connection before a filter chain is chosen.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ListenerFilter {
    pub name: String,
}

impl ListenerFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FilterChain {
    /// `None` matches every connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_chain_match: Option<FilterChainMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_context: Option<TlsContext>,
    pub filters: Vec<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl FilterChain {
    pub fn is_catch_all(&self) -> bool {
        self.filter_chain_match
            .as_ref()
            .map_or(true, FilterChainMatch::is_empty)
    }
}

/// A listener resource.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_direction: Option<TrafficDirection>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listener_filters: Vec<ListenerFilter>,
    pub filter_chains: Vec<FilterChain>,
    pub bind_to_port: bool,
    pub use_original_dst: bool,
    pub transparent: bool,
}

impl Listener {
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
            traffic_direction: None,
            listener_filters: Vec::new(),
            filter_chains: Vec::new(),
            bind_to_port: true,
            use_original_dst: false,
            transparent: false,
        }
    }

    /// Checks the listener would be accepted by the proxy: it has a name,
    /// chains with filters, distinct matches, and one catch-all at most.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::MissingName);
        }
        if self.filter_chains.is_empty() {
            return Err(ValidationError::NoFilterChains(self.name.clone()));
        }

        let catch_alls = self
            .filter_chains
            .iter()
            .filter(|chain| chain.is_catch_all())
            .count();
        if catch_alls > 1 {
            return Err(ValidationError::MultipleCatchAll {
                listener: self.name.clone(),
                count: catch_alls,
            });
        }

        for (index, chain) in self.filter_chains.iter().enumerate() {
            if chain.filters.is_empty() {
                return Err(ValidationError::EmptyFilterChain {
                    listener: self.name.clone(),
                    index,
                });
            }

            let duplicate = !chain.is_catch_all()
                && self.filter_chains[..index]
                    .iter()
                    .any(|earlier| earlier.filter_chain_match == chain.filter_chain_match);
            if duplicate {
                return Err(ValidationError::DuplicateMatch {
                    listener: self.name.clone(),
                    index,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn chain(server_names: &[&str]) -> FilterChain {
        FilterChain {
            filter_chain_match: (!server_names.is_empty()).then(|| FilterChainMatch {
                server_names: server_names.iter().map(|s| (*s).to_owned()).collect(),
                ..<_>::default()
            }),
            filters: vec![Filter::tcp_proxy("a", "a")],
            ..<_>::default()
        }
    }

    fn listener(chains: Vec<FilterChain>) -> Listener {
        let mut listener = Listener::new(
            "0.0.0.0_443",
            Address::Socket {
                address: "0.0.0.0".into(),
                port_value: 443,
            },
        );
        listener.filter_chains = chains;
        listener
    }

    #[test]
    fn valid() {
        assert_eq!(
            Ok(()),
            listener(vec![chain(&["a.com"]), chain(&["b.com"]), chain(&[])]).validate()
        );
    }

    #[test]
    fn empty_match_is_catch_all() {
        let mut explicit_empty = chain(&[]);
        explicit_empty.filter_chain_match = Some(FilterChainMatch::default());
        assert!(explicit_empty.is_catch_all());

        assert_eq!(
            Err(ValidationError::MultipleCatchAll {
                listener: "0.0.0.0_443".into(),
                count: 2
            }),
            listener(vec![chain(&[]), explicit_empty]).validate()
        );
    }

    #[test]
    fn invalid() {
        assert_eq!(
            Err(ValidationError::NoFilterChains("0.0.0.0_443".into())),
            listener(Vec::new()).validate()
        );

        assert_eq!(
            Err(ValidationError::DuplicateMatch {
                listener: "0.0.0.0_443".into(),
                index: 1
            }),
            listener(vec![chain(&["a.com"]), chain(&["a.com"])]).validate()
        );

        let mut empty = chain(&["a.com"]);
        empty.filters.clear();
        assert_eq!(
            Err(ValidationError::EmptyFilterChain {
                listener: "0.0.0.0_443".into(),
                index: 0
            }),
            listener(vec![empty]).validate()
        );
    }

    #[test]
    fn serializes_like_the_resource() {
        let json = serde_json::to_value(listener(vec![chain(&["a.com"])])).unwrap();
        assert_eq!(
            serde_json::json!({
                "name": "0.0.0.0_443",
                "address": { "socket": { "address": "0.0.0.0", "port_value": 443 } },
                "filter_chains": [{
                    "filter_chain_match": { "server_names": ["a.com"] },
                    "filters": [{
                        "name": "envoy.tcp_proxy",
                        "typed_config": { "stat_prefix": "a", "cluster": "a" }
                    }]
                }],
                "bind_to_port": true,
                "use_original_dst": false,
                "transparent": false
            }),
            json
        );
    }
}
