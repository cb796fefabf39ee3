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

//! Assembly of listener options into listener resources.

use std::{collections::HashSet, net::IpAddr};

use super::BuildError;
use crate::{
    config::MeshConfig,
    model::Proxy,
    net,
    plugin::{ChainFilters, MutableObjects},
    xds::{
        clusters, names, CodecType, Filter, FilterChain, FilterChainMatch, HttpConnectionManager,
        HttpFilter, Listener, ListenerFilter, Metadata, OperationName, RouteConfiguration,
        RouteSpecifier, TlsContext, Tracing, UpgradeConfig,
    },
};

/// Where an HTTP filter chain's routes come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteSource {
    /// Route table discovered by name.
    Rds(String),
    /// Route table shipped with the listener.
    Inline(RouteConfiguration),
}

/// How an HTTP filter chain's connection manager is configured.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpListenerOpts {
    pub route: RouteSource,
    /// Base settings. Codec, filters, routes and timeouts are always
    /// overwritten during assembly.
    pub connection_manager: Option<HttpConnectionManager>,
    pub direction: OperationName,
    pub add_grpc_web_filter: bool,
    pub use_remote_address: bool,
}

/// Options for one filter chain.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FilterChainOpts {
    pub sni_hosts: Vec<String>,
    pub destination_cidrs: Vec<String>,
    /// Used as the base of the match. When set, the chain keeps a match even
    /// if it ends up empty.
    pub match_override: Option<FilterChainMatch>,
    pub metadata: Option<Metadata>,
    pub tls_context: Option<TlsContext>,
    /// Set for HTTP chains; `network_filters` is then ignored.
    pub http: Option<HttpListenerOpts>,
    pub listener_filters: Vec<ListenerFilter>,
    pub network_filters: Vec<Filter>,
}

impl FilterChainOpts {
    pub fn network(filters: Vec<Filter>) -> Self {
        Self {
            network_filters: filters,
            ..<_>::default()
        }
    }

    pub fn http(opts: HttpListenerOpts) -> Self {
        Self {
            http: Some(opts),
            ..<_>::default()
        }
    }

    /// SNI or ALPN has to be read from the connection to pick this chain.
    pub fn needs_tls_inspector(&self) -> bool {
        let needs_alpn = self
            .tls_context
            .as_ref()
            .is_some_and(|tls| !tls.alpn_protocols.is_empty());
        !self.sni_hosts.is_empty() || needs_alpn
    }

    /// The normalized match of this chain, `None` when it matches every
    /// connection.
    ///
    /// Hosts are sorted and CIDRs are sorted by parsed address, so equal
    /// sets compare equal whatever order or spelling they were given in. A
    /// `*` host drops the SNI condition and the unspecified address drops
    /// out of the CIDR condition.
    pub fn build_match(&self) -> Option<FilterChainMatch> {
        let mut chain_match = self.match_override.clone().unwrap_or_default();

        if !self.sni_hosts.is_empty() {
            let mut hosts = self.sni_hosts.clone();
            hosts.sort();
            hosts.dedup();
            if !hosts.iter().any(|host| host == "*") {
                chain_match.server_names = hosts;
            }
        }

        if !self.destination_cidrs.is_empty() {
            let ranges = &mut chain_match.prefix_ranges;
            ranges.extend(
                self.destination_cidrs
                    .iter()
                    .filter(|cidr| !cidr.is_empty())
                    .filter_map(|cidr| net::convert_address_to_cidr(cidr))
                    .filter(|cidr| !net::is_unspecified(&cidr.address_prefix)),
            );
            ranges.sort_by_cached_key(|cidr| {
                (cidr.address_prefix.parse::<IpAddr>().ok(), cidr.prefix_len)
            });
            ranges.dedup();
        }

        if self.match_override.is_none() && chain_match.is_empty() {
            None
        } else {
            Some(chain_match)
        }
    }
}

/// Options for one listener.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ListenerOpts {
    pub bind: String,
    pub port: u16,
    pub bind_to_port: bool,
    pub filter_chains: Vec<FilterChainOpts>,
}

impl ListenerOpts {
    pub fn name(&self) -> String {
        format!("{}_{}", self.bind, self.port)
    }

    pub fn key(&self) -> String {
        net::listener_key(&self.bind, self.port)
    }
}

/// Builds the listener skeleton: address, listener filters, and one filter
/// chain per options entry with its match and TLS context, but no filters yet.
pub fn build_listener(opts: &ListenerOpts) -> Listener {
    let mut listener = Listener::new(opts.name(), net::build_address(&opts.bind, opts.port));
    listener.bind_to_port = opts.bind_to_port;

    let mut seen = HashSet::new();
    if opts.filter_chains.iter().any(FilterChainOpts::needs_tls_inspector) {
        seen.insert(names::TLS_INSPECTOR.to_owned());
        listener
            .listener_filters
            .push(ListenerFilter::new(names::TLS_INSPECTOR));
    }

    for chain in &opts.filter_chains {
        for filter in &chain.listener_filters {
            if seen.insert(filter.name.clone()) {
                listener.listener_filters.push(filter.clone());
            }
        }

        listener.filter_chains.push(FilterChain {
            filter_chain_match: chain.build_match(),
            tls_context: chain.tls_context.clone(),
            ..<_>::default()
        });
    }

    listener
}

/// Fills in the filters of every chain of `mutable.listener`, merging in the
/// filters plugins added to `mutable.filter_chains`.
///
/// Network chains get their own filters with plugin filters placed ahead of
/// the terminal one. HTTP chains get plugin network filters followed by the
/// connection manager.
pub fn build_complete_filter_chain(
    mesh: &MeshConfig,
    proxy: &Proxy,
    mutable: &mut MutableObjects,
    opts: &ListenerOpts,
) -> Result<(), BuildError> {
    if opts.filter_chains.is_empty() {
        return Err(BuildError::NoFilterChains(mutable.listener.name.clone()));
    }

    let name = mutable.listener.name.clone();
    let no_additions = ChainFilters::default();

    for (index, (chain, opt)) in mutable
        .listener
        .filter_chains
        .iter_mut()
        .zip(&opts.filter_chains)
        .enumerate()
    {
        let additions = mutable.filter_chains.get(index).unwrap_or(&no_additions);
        chain.metadata = opt.metadata.clone();

        match &opt.http {
            None => {
                match opt.network_filters.split_last() {
                    Some((terminal, leading)) => {
                        chain.filters.extend(leading.iter().cloned());
                        chain.filters.extend(additions.tcp.iter().cloned());
                        chain.filters.push(terminal.clone());
                    }
                    None => chain.filters.extend(additions.tcp.iter().cloned()),
                }
                tracing::trace!(
                    listener = %name,
                    chain = index,
                    filters = chain.filters.len(),
                    "attached network filters"
                );
            }
            Some(http) => {
                chain.filters.extend(additions.tcp.iter().cloned());
                let manager =
                    build_http_connection_manager(mesh, proxy, http, &name, &additions.http);
                tracing::trace!(
                    listener = %name,
                    chain = index,
                    http_filters = manager.http_filters.len(),
                    "attached http connection manager"
                );
                chain.filters.push(Filter::http_connection_manager(manager));
            }
        }

        if chain.filters.is_empty() {
            return Err(BuildError::EmptyFilterChain {
                listener: name,
                index,
            });
        }
    }

    Ok(())
}

/// The connection manager terminating an HTTP filter chain: plugin HTTP
/// filters, then gRPC-Web when asked for, then CORS, fault and the router.
pub fn build_http_connection_manager(
    mesh: &MeshConfig,
    proxy: &Proxy,
    opts: &HttpListenerOpts,
    stat_prefix: &str,
    http_filters: &[HttpFilter],
) -> HttpConnectionManager {
    let mut filters = http_filters.to_vec();
    if opts.add_grpc_web_filter {
        filters.push(HttpFilter::new(names::GRPC_WEB));
    }
    filters.extend([
        HttpFilter::new(names::CORS),
        HttpFilter::new(names::FAULT),
        HttpFilter::new(names::ROUTER),
    ]);

    let mut manager = opts.connection_manager.clone().unwrap_or_default();
    manager.codec_type = CodecType::Auto;
    manager.stat_prefix = stat_prefix.into();
    manager.http_filters = filters;
    manager.normalize_path = true;
    manager.use_remote_address = opts.use_remote_address;
    manager.upgrade_configs = vec![UpgradeConfig {
        upgrade_type: "websocket".into(),
    }];
    manager.stream_idle_timeout_secs = 0;
    manager.tracing = Some(Tracing {
        operation_name: opts.direction,
    });
    manager.route_specifier = match &opts.route {
        RouteSource::Rds(name) => RouteSpecifier::Rds {
            route_config_name: name.clone(),
        },
        RouteSource::Inline(routes) => RouteSpecifier::RouteConfig(routes.clone()),
    };

    if mesh.features.http10 || proxy.http10() {
        manager
            .http_protocol_options
            .get_or_insert_with(<_>::default)
            .accept_http_10 = true;
    }

    manager
}

/// Drops traffic addressed to the proxy's own IPs.
pub(crate) fn blackhole_chain(proxy: &Proxy) -> FilterChainOpts {
    FilterChainOpts {
        destination_cidrs: proxy.ip_addresses.clone(),
        network_filters: vec![Filter::tcp_proxy(clusters::BLACK_HOLE, clusters::BLACK_HOLE)],
        ..<_>::default()
    }
}

/// Forwards anything unmatched to its original destination.
pub(crate) fn passthrough_chain() -> FilterChainOpts {
    FilterChainOpts::network(vec![Filter::tcp_proxy(
        clusters::PASSTHROUGH,
        clusters::PASSTHROUGH,
    )])
}

/// Protects a wildcard-bound outbound listener under the allow-any policy:
/// traffic to the proxy's own IPs is dropped instead of looping back through
/// the listener, and unmatched traffic passes through when no chain already
/// matches everything.
pub(crate) fn apply_wildcard_safety_net(
    opts: &mut ListenerOpts,
    proxy: &Proxy,
    mesh: &MeshConfig,
) {
    if !proxy.is_allow_any_outbound() {
        return;
    }

    if mesh.features.restrict_pod_ip_traffic_loops {
        let blackhole = blackhole_chain(proxy);
        if blackhole.build_match().is_some() {
            opts.filter_chains.insert(0, blackhole);
        }
    }

    let has_catch_all = opts
        .filter_chains
        .iter()
        .any(|chain| chain.build_match().map_or(true, |m| m.is_empty()));
    if mesh.features.enable_fallthrough_route && !has_catch_all {
        opts.filter_chains.push(passthrough_chain());
    }
}
