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

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{Labels, ServiceInstance, SidecarScope};
use crate::config::OutboundTrafficPolicy;

/// Metadata key which, when `"1"`, makes HTTP listeners accept HTTP/1.0.
pub const METADATA_HTTP10: &str = "HTTP10";
/// Metadata key holding the uid the proxy process runs as.
pub const METADATA_SIDECAR_UID: &str = "SIDECAR_UID";

/// How traffic reaches the proxy.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum InterceptionMode {
    /// Traffic is captured with a NAT redirect.
    #[default]
    Redirect,
    /// Traffic is captured transparently, keeping the original source.
    Tproxy,
    /// Nothing is captured, the proxy binds each listener to its port.
    None,
}

/// A sidecar proxy, together with everything resolved for it upstream.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct Proxy {
    pub id: String,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub interception_mode: InterceptionMode,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: Labels,
    /// Instances of catalog services co-located with this proxy.
    #[serde(default)]
    pub service_instances: Vec<ServiceInstance>,
    #[serde(default)]
    pub sidecar_scope: Arc<SidecarScope>,
}

impl Proxy {
    pub fn is_none_mode(&self) -> bool {
        self.interception_mode == InterceptionMode::None
    }

    pub fn http10(&self) -> bool {
        self.metadata.get(METADATA_HTTP10).is_some_and(|v| v == "1")
    }

    pub fn sidecar_uid(&self) -> Option<&str> {
        self.metadata.get(METADATA_SIDECAR_UID).map(String::as_str)
    }

    /// Whether the proxy may bind `port` itself. Ports up to 1024 are
    /// privileged and need the proxy to run as root.
    pub fn can_bind(&self, port: u16, bind_to_port: bool) -> bool {
        !bind_to_port || port > 1024 || self.sidecar_uid() == Some("0")
    }

    pub fn is_allow_any_outbound(&self) -> bool {
        self.sidecar_scope.outbound_traffic_policy == OutboundTrafficPolicy::AllowAny
    }
}
