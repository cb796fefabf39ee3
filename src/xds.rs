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

//! Listener resources as handed to the transport layer.
//!
//! The types mirror the shape of the proxy's listener discovery resources and
//! serialize to their JSON representation. Encoding them into the
//! distribution protocol's framing happens elsewhere.

mod http;
mod listener;
mod tcp;

pub use self::{
    http::{
        ClientCertDetails, CodecType, ForwardClientCertDetails, Http1ProtocolOptions,
        Http2ProtocolOptions, HttpConnectionManager, HttpFilter, OperationName, Route,
        RouteConfiguration, RouteSpecifier, Tracing, UpgradeConfig, VirtualHost,
    },
    listener::{
        Address, CidrRange, Filter, FilterChain, FilterChainMatch, FilterConfig, Listener,
        ListenerFilter, Metadata, TlsContext, TrafficDirection,
    },
    tcp::TcpProxy,
};

/// Well-known filter names.
pub mod names {
    pub const TCP_PROXY: &str = "envoy.tcp_proxy";
    pub const HTTP_CONNECTION_MANAGER: &str = "envoy.http_connection_manager";
    pub const TLS_INSPECTOR: &str = "envoy.listener.tls_inspector";
    pub const ORIGINAL_DST: &str = "envoy.listener.original_dst";
    pub const GRPC_WEB: &str = "envoy.grpc_web";
    pub const CORS: &str = "envoy.cors";
    pub const FAULT: &str = "envoy.fault";
    pub const ROUTER: &str = "envoy.router";
}

/// Clusters every proxy knows without discovery.
pub mod clusters {
    /// Drops every connection.
    pub const BLACK_HOLE: &str = "BlackHoleCluster";
    /// Forwards to the connection's original destination.
    pub const PASSTHROUGH: &str = "PassthroughCluster";
    pub const INBOUND_PASSTHROUGH_IPV4: &str = "InboundPassthroughClusterIpv4";
    pub const INBOUND_PASSTHROUGH_IPV6: &str = "InboundPassthroughClusterIpv6";
}

/// A listener the proxy would reject.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener has no name")]
    MissingName,
    #[error("listener {0} has no filter chains")]
    NoFilterChains(String),
    #[error("listener {listener} has {count} catch-all filter chains")]
    MultipleCatchAll { listener: String, count: usize },
    #[error("listener {listener} filter chain {index} duplicates an earlier match")]
    DuplicateMatch { listener: String, index: usize },
    #[error("listener {listener} filter chain {index} has no filters")]
    EmptyFilterChain { listener: String, index: usize },
}
