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

//! The read-only snapshot listeners are synthesised from: the service
//! catalog, the proxies, and each proxy's resolved sidecar scope.

mod environment;
mod protocol;
mod proxy;
mod service;
mod sidecar;

use serde::{Deserialize, Serialize};

pub use self::{
    environment::{DefaultEnvironment, Environment, OutboundTcpParams, TcpChain},
    protocol::{ListenerProtocol, Protocol},
    proxy::{InterceptionMode, Proxy, METADATA_HTTP10, METADATA_SIDECAR_UID},
    service::{
        cluster_name, validate_network_endpoint_address, AddressFamily, Hostname, Labels,
        NetworkEndpoint, Port, PortList, Resolution, Service, ServiceInstance,
        UNIX_ADDRESS_PREFIX,
    },
    sidecar::{CaptureMode, EgressListener, IngressListener, SidecarScope},
};

/// Direction of traffic relative to the proxy's workload.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, Eq, Hash, PartialEq, strum_macros::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "lowercase")]
pub enum TrafficDirection {
    Inbound,
    Outbound,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid empty hostname")]
    EmptyHostname,
    #[error("invalid hostname part: {0:?}")]
    InvalidHostnamePart(String),
    #[error("service must have at least one declared port")]
    NoPorts,
    #[error("empty port names are not allowed for services with multiple ports")]
    EmptyPortName,
    #[error("invalid port name: {0:?}")]
    InvalidPortName(String),
    #[error("duplicate port name: {0:?}")]
    DuplicatePortName(String),
    #[error("invalid port value {port} for {name:?}")]
    InvalidPort { name: String, port: u16 },
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("{0} is not an absolute path")]
    NotAbsolutePath(String),
    #[error("missing service port {0:?}")]
    MissingServicePort(String),
    #[error("unexpected service port value {actual}, expected {expected}")]
    UnexpectedServicePort { actual: u16, expected: u16 },
    #[error("unexpected service protocol {actual}, expected {expected}")]
    UnexpectedServiceProtocol { actual: Protocol, expected: Protocol },
    #[error("invalid label key: {0:?}")]
    InvalidLabelKey(String),
    #[error("invalid label value {value:?} for key {key:?}")]
    InvalidLabelValue { key: String, value: String },
    #[error("only one catch-all egress listener is allowed")]
    MultipleCatchAllEgress,
    #[error("the catch-all egress listener must be the last egress listener")]
    CatchAllEgressNotLast,
    #[error("ingress listener port {0} is declared more than once")]
    DuplicateIngressPort(u16),
}

/// Every problem found while validating one object.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub(crate) fn into_result(errors: Vec<ValidationError>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self(errors))
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            std::fmt::Display::fmt(error, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_joined() {
        let errors = ValidationErrors(vec![
            ValidationError::EmptyHostname,
            ValidationError::NoPorts,
        ]);
        assert_eq!(
            "invalid empty hostname; service must have at least one declared port",
            errors.to_string()
        );
    }
}
