/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *       http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

/// The [`MeshConfig`][super::MeshConfig] settings checked by validation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Field {
    ProxyListenPort,
    ProxyInboundListenPort,
    ProxyHttpPort,
    ServerName,
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
#[error("{field} has invalid value{reason}{example}",
    reason = reason
                    .as_ref()
                    .map(|v| format!(": {v}"))
                    .unwrap_or_default(),
    example = example
                    .as_ref()
                    .map(|v| format!(" (e.g. {v})"))
                    .unwrap_or_default(),
    )]
pub struct ValueInvalidArgs {
    pub field: Field,
    pub reason: Option<String>,
    pub example: Option<String>,
}

/// Validation failure for a [`MeshConfig`][super::MeshConfig].
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// Two capture or proxy listeners would share an address.
    #[error("{first} and {second} are both set to port {port}")]
    PortClash { first: Field, second: Field, port: u16 },
    #[error(transparent)]
    ValueInvalid(#[from] ValueInvalidArgs),
}
