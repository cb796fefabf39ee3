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

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};

use super::{Port, Service, ValidationError, ValidationErrors};
use crate::config::OutboundTrafficPolicy;

/// Per-listener override of the proxy's interception mode.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CaptureMode {
    /// Inherit the proxy's interception mode.
    #[default]
    Default,
    Iptables,
    /// The listener binds its port directly.
    None,
}

/// A user-declared inbound port.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct IngressListener {
    pub port: Port,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub capture_mode: CaptureMode,
    #[serde(default)]
    pub default_endpoint: String,
}

/// A user-declared egress rule. A rule without a port is the catch-all.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct EgressListener {
    #[serde(default)]
    pub port: Option<Port>,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub capture_mode: CaptureMode,
    /// Services visible through this rule, in catalog order.
    #[serde(default)]
    pub services: Vec<Arc<Service>>,
}

impl EgressListener {
    pub fn is_catch_all(&self) -> bool {
        self.port.is_none()
    }
}

/// Routing intent resolved for one proxy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, Eq, PartialEq)]
pub struct SidecarScope {
    #[serde(default)]
    pub ingress: Vec<IngressListener>,
    #[serde(default)]
    pub egress: Vec<EgressListener>,
    #[serde(default)]
    pub outbound_traffic_policy: OutboundTrafficPolicy,
}

impl SidecarScope {
    /// The scope of a proxy without user overrides: every service through a
    /// single catch-all egress rule.
    pub fn with_services(
        services: Vec<Arc<Service>>,
        outbound_traffic_policy: OutboundTrafficPolicy,
    ) -> Self {
        Self {
            ingress: Vec::new(),
            egress: vec![EgressListener {
                services,
                ..<_>::default()
            }],
            outbound_traffic_policy,
        }
    }

    pub fn has_custom_ingress_listeners(&self) -> bool {
        !self.ingress.is_empty()
    }

    /// At most one catch-all egress rule, in last position, and unique
    /// ingress ports.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = Vec::new();

        let catch_alls = self.egress.iter().filter(|e| e.is_catch_all()).count();
        if catch_alls > 1 {
            errors.push(ValidationError::MultipleCatchAllEgress);
        }
        if catch_alls > 0 && !self.egress.last().is_some_and(EgressListener::is_catch_all) {
            errors.push(ValidationError::CatchAllEgressNotLast);
        }

        let mut ports = HashSet::new();
        for ingress in &self.ingress {
            if !ports.insert(ingress.port.port) {
                errors.push(ValidationError::DuplicateIngressPort(ingress.port.port));
            }
        }

        ValidationErrors::into_result(errors)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::Protocol;

    fn explicit(port: u16) -> EgressListener {
        EgressListener {
            port: Some(Port::new("tcp", port, Protocol::Tcp)),
            ..<_>::default()
        }
    }

    #[test]
    fn default_scope_is_catch_all() {
        let scope = SidecarScope::with_services(Vec::new(), OutboundTrafficPolicy::AllowAny);
        assert_eq!(1, scope.egress.len());
        assert!(scope.egress[0].is_catch_all());
        assert!(!scope.has_custom_ingress_listeners());
        assert!(scope.validate().is_ok());
    }

    #[test]
    fn catch_all_must_be_last_and_unique() {
        let scope = SidecarScope {
            egress: vec![
                EgressListener::default(),
                explicit(80),
                EgressListener::default(),
            ],
            ..<_>::default()
        };
        assert_eq!(
            vec![ValidationError::MultipleCatchAllEgress],
            scope.validate().unwrap_err().0
        );

        let scope = SidecarScope {
            egress: vec![EgressListener::default(), explicit(80)],
            ..<_>::default()
        };
        assert_eq!(
            vec![ValidationError::CatchAllEgressNotLast],
            scope.validate().unwrap_err().0
        );
    }

    #[test]
    fn ingress_ports_unique() {
        let ingress = IngressListener {
            port: Port::new("http", 8080, Protocol::Http),
            ..<_>::default()
        };
        let scope = SidecarScope {
            ingress: vec![ingress.clone(), ingress],
            ..<_>::default()
        };
        assert_eq!(
            vec![ValidationError::DuplicateIngressPort(8080)],
            scope.validate().unwrap_err().0
        );
    }
}
