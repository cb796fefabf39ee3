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

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CodecType {
    #[default]
    Auto,
    Http1,
    Http2,
}

/// Tracing operation name, from the point of view of the proxy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationName {
    Ingress,
    Egress,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Tracing {
    pub operation_name: OperationName,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForwardClientCertDetails {
    Sanitize,
    ForwardOnly,
    AppendForward,
    SanitizeSet,
    AlwaysForwardOnly,
}

/// Which parts of the client certificate are added to the forwarded header.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ClientCertDetails {
    pub subject: bool,
    pub uri: bool,
    pub dns: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Http1ProtocolOptions {
    pub accept_http_10: bool,
    pub allow_absolute_url: bool,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Http2ProtocolOptions {}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct UpgradeConfig {
    pub upgrade_type: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HttpFilter {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl HttpFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Route {
    pub prefix: String,
    pub cluster: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
}

/// A route table delivered inline with the listener.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
}

/// Where the connection manager gets its routes from.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteSpecifier {
    /// Discovered by name over the aggregated stream.
    Rds { route_config_name: String },
    RouteConfig(RouteConfiguration),
}

impl Default for RouteSpecifier {
    fn default() -> Self {
        Self::RouteConfig(RouteConfiguration::default())
    }
}

/// Configuration of the terminal filter of an HTTP filter chain.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct HttpConnectionManager {
    pub codec_type: CodecType,
    pub stat_prefix: String,
    pub route_specifier: RouteSpecifier,
    pub http_filters: Vec<HttpFilter>,
    pub normalize_path: bool,
    pub use_remote_address: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub upgrade_configs: Vec<UpgradeConfig>,
    /// Zero disables the timeout.
    pub stream_idle_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracing: Option<Tracing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_client_cert_details: Option<ForwardClientCertDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_current_client_cert_details: Option<ClientCertDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_protocol_options: Option<Http1ProtocolOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http2_protocol_options: Option<Http2ProtocolOptions>,
}

impl HttpConnectionManager {
    pub fn rds_name(&self) -> Option<&str> {
        match &self.route_specifier {
            RouteSpecifier::Rds { route_config_name } => Some(route_config_name),
            RouteSpecifier::RouteConfig(_) => None,
        }
    }

    pub fn http_filter_names(&self) -> impl Iterator<Item = &str> {
        self.http_filters.iter().map(|filter| filter.name.as_str())
    }
}
