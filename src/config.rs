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

//! Mesh-wide settings that shape every proxy's listeners.

use std::io;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

mod error;

pub use self::error::{Field, ValidationError, ValueInvalidArgs};

/// Port on which all outbound traffic of a captured proxy arrives.
pub const DEFAULT_PROXY_LISTEN_PORT: u16 = 15001;
/// Port on which all inbound traffic of a captured proxy arrives.
pub const DEFAULT_PROXY_INBOUND_LISTEN_PORT: u16 = 15006;
/// HTTP proxy port used for proxies that are not capturing traffic.
pub const DEFAULT_HTTP_PROXY_PORT: u16 = 15002;
pub const DEFAULT_SERVER_NAME: &str = "meshgen-envoy";

/// How traffic to destinations unknown to the catalog is handled.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq, JsonSchema)]
pub enum OutboundTrafficPolicy {
    /// Unknown destinations are passed through to their original address.
    #[default]
    #[serde(rename = "ALLOW_ANY")]
    AllowAny,
    /// Only destinations present in the catalog are reachable.
    #[serde(rename = "REGISTRY_ONLY")]
    RegistryOnly,
}

/// Toggles for individual synthesis behaviours.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq, JsonSchema)]
#[serde(default)]
pub struct Features {
    /// Accept HTTP/1.0 requests on every HTTP listener.
    pub http10: bool,
    /// Outbound HTTP listeners use the downstream remote address.
    pub use_remote_address: bool,
    /// Add a pass-through chain to wildcard outbound listeners.
    pub enable_fallthrough_route: bool,
    /// Black-hole traffic addressed to the proxy's own IPs on wildcard
    /// outbound listeners.
    pub restrict_pod_ip_traffic_loops: bool,
    /// Build the `virtualInbound` capture listener.
    pub enable_virtual_inbound: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            http10: false,
            use_remote_address: false,
            enable_fallthrough_route: true,
            restrict_pod_ip_traffic_loops: true,
            enable_virtual_inbound: true,
        }
    }
}

/// Mesh-wide configuration consulted by every synthesis stage.
#[derive(Clone, Debug, Deserialize, Serialize, Eq, PartialEq, JsonSchema)]
#[serde(default)]
pub struct MeshConfig {
    /// Capture port for outbound traffic. `0` disables sidecar listener
    /// generation entirely.
    pub proxy_listen_port: u16,
    /// Capture port for inbound traffic. `0` disables `virtualInbound`.
    pub proxy_inbound_listen_port: u16,
    /// Explicit HTTP proxy port. `0` disables the HTTP proxy listener unless
    /// the proxy is not capturing traffic.
    pub proxy_http_port: u16,
    /// Server name advertised by inbound HTTP listeners.
    pub server_name: String,
    pub outbound_traffic_policy: OutboundTrafficPolicy,
    pub features: Features,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            proxy_listen_port: DEFAULT_PROXY_LISTEN_PORT,
            proxy_inbound_listen_port: DEFAULT_PROXY_INBOUND_LISTEN_PORT,
            proxy_http_port: 0,
            server_name: DEFAULT_SERVER_NAME.into(),
            outbound_traffic_policy: <_>::default(),
            features: <_>::default(),
        }
    }
}

impl MeshConfig {
    /// Reads a YAML mesh configuration, then validates it.
    pub fn from_reader<R: io::Read>(input: R) -> crate::Result<Self> {
        let config: Self = serde_yaml::from_reader(input)?;
        config.validate()?;
        Ok(config)
    }

    /// The JSON schema of the configuration file.
    pub fn schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(MeshConfig)
    }

    /// Validates the current config.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.server_name.is_empty() {
            return Err(ValueInvalidArgs {
                field: Field::ServerName,
                reason: Some("cannot be empty".into()),
                example: Some(DEFAULT_SERVER_NAME.into()),
            }
            .into());
        }

        let ports = [
            (Field::ProxyListenPort, self.proxy_listen_port),
            (Field::ProxyInboundListenPort, self.proxy_inbound_listen_port),
            (Field::ProxyHttpPort, self.proxy_http_port),
        ];
        let configured: Vec<_> = ports.into_iter().filter(|(_, port)| *port != 0).collect();
        for (i, (first, port)) in configured.iter().enumerate() {
            if let Some((second, _)) = configured[i + 1..].iter().find(|(_, other)| other == port) {
                return Err(ValidationError::PortClash {
                    first: *first,
                    second: *second,
                    port: *port,
                });
            }
        }

        Ok(())
    }

    /// The HTTP proxy port for a proxy, if one should be generated.
    pub fn http_proxy_port(&self, capturing: bool) -> Option<u16> {
        match self.proxy_http_port {
            0 if capturing => None,
            0 => Some(DEFAULT_HTTP_PROXY_PORT),
            port => Some(port),
        }
    }

    pub fn is_allow_any(&self) -> bool {
        self.outbound_traffic_policy == OutboundTrafficPolicy::AllowAny
    }
}
