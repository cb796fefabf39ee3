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

//! The listeners captured traffic first arrives on. They hand connections
//! over to the listener owning the original destination, or handle them
//! directly when none does.

use std::collections::HashSet;

use super::{
    chain::{self, FilterChainOpts, ListenerOpts},
    metrics, BuildContext, BuildError, Stage,
};
use crate::{
    model::{
        InterceptionMode, ListenerProtocol, Port, PortList, Protocol, Service, TrafficDirection,
    },
    net,
    plugin::{self, Hook, MutableObjects},
    xds::{clusters, names, Address, Filter, FilterChain, Listener, ListenerFilter},
};

pub const VIRTUAL_OUTBOUND_LISTENER_NAME: &str = "virtualOutbound";
pub const VIRTUAL_INBOUND_LISTENER_NAME: &str = "virtualInbound";

/// The listener all outbound traffic is redirected to. Unmatched traffic
/// passes through under the allow-any policy and is dropped otherwise.
pub(crate) fn virtual_outbound(ctx: &BuildContext<'_>) -> Option<Listener> {
    if ctx.proxy.is_none_mode() {
        return None;
    }

    let port = ctx.mesh().proxy_listen_port;
    let terminal = if ctx.proxy.is_allow_any_outbound() {
        clusters::PASSTHROUGH
    } else {
        clusters::BLACK_HOLE
    };

    let mut filter_chains = Vec::with_capacity(2);
    if ctx.mesh().features.restrict_pod_ip_traffic_loops {
        let blackhole = chain::blackhole_chain(ctx.proxy);
        if blackhole.build_match().is_some() {
            filter_chains.push(blackhole);
        }
    }
    filter_chains.push(FilterChainOpts::network(vec![Filter::tcp_proxy(
        terminal, terminal,
    )]));

    let opts = ListenerOpts {
        bind: ctx.wildcard.into(),
        port,
        bind_to_port: true,
        filter_chains,
    };

    let mut listener = chain::build_listener(&opts);
    listener.name = VIRTUAL_OUTBOUND_LISTENER_NAME.into();
    listener.use_original_dst = true;
    listener.transparent = ctx.proxy.interception_mode == InterceptionMode::Tproxy;
    listener.traffic_direction = Some(TrafficDirection::Outbound);

    let capture_port = Port::new("", port, Protocol::Tcp);
    let service = Service {
        hostname: terminal.into(),
        ports: PortList::from(vec![capture_port.clone()]),
        ..<_>::default()
    };
    let params = ctx.params(
        ListenerProtocol::Tcp,
        "",
        Some(&capture_port),
        Some(&service),
        None,
    );

    let mut mutable = MutableObjects::new(listener);
    let result = plugin::run_hook(ctx.plugins, Hook::CaptureListener, &params, &mut mutable)
        .map_err(BuildError::from)
        .and_then(|_| {
            chain::build_complete_filter_chain(ctx.mesh(), ctx.proxy, &mut mutable, &opts)
        });

    match result {
        Ok(()) => Some(mutable.listener),
        Err(error) => {
            tracing::warn!(
                proxy = %ctx.proxy.id,
                listener = VIRTUAL_OUTBOUND_LISTENER_NAME,
                %error,
                "dropping capture listener"
            );
            metrics::dropped_listeners(Stage::Capture).inc();
            None
        }
    }
}

/// The listener all inbound traffic is redirected to. It carries the chains
/// of every inbound listener, matched on the destination they were bound
/// to, and passes anything else through to the original destination.
pub(crate) fn virtual_inbound(ctx: &BuildContext<'_>, inbound: &[Listener]) -> Option<Listener> {
    let port = ctx.mesh().proxy_inbound_listen_port;
    if !ctx.mesh().features.enable_virtual_inbound || port == 0 || ctx.proxy.is_none_mode() {
        return None;
    }

    let mut listener = Listener::new(
        VIRTUAL_INBOUND_LISTENER_NAME,
        net::build_address(ctx.wildcard, port),
    );
    listener.use_original_dst = true;
    listener.transparent = ctx.proxy.interception_mode == InterceptionMode::Tproxy;
    listener.traffic_direction = Some(TrafficDirection::Inbound);

    let mut seen = HashSet::from([names::ORIGINAL_DST.to_owned()]);
    listener
        .listener_filters
        .push(ListenerFilter::new(names::ORIGINAL_DST));

    for source in inbound {
        let Address::Socket {
            address,
            port_value,
        } = &source.address
        else {
            continue;
        };

        for filter in &source.listener_filters {
            if seen.insert(filter.name.clone()) {
                listener.listener_filters.push(filter.clone());
            }
        }

        for source_chain in &source.filter_chains {
            listener
                .filter_chains
                .push(rematch(source_chain, address, *port_value));
        }
    }

    let passthrough = if ctx.wildcard == net::WILDCARD_IPV4 {
        clusters::INBOUND_PASSTHROUGH_IPV4
    } else {
        clusters::INBOUND_PASSTHROUGH_IPV6
    };
    listener.filter_chains.push(FilterChain {
        filters: vec![Filter::tcp_proxy(passthrough, passthrough)],
        ..<_>::default()
    });

    if let Err(error) = listener.validate() {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            listener = VIRTUAL_INBOUND_LISTENER_NAME,
            %error,
            "dropping invalid capture listener"
        );
        metrics::dropped_listeners(Stage::Capture).inc();
        return None;
    }

    Some(listener)
}

/// `chain` matched on the address its listener was bound to.
fn rematch(chain: &FilterChain, bind: &str, port: u16) -> FilterChain {
    let mut chain_match = chain.filter_chain_match.clone().unwrap_or_default();
    chain_match.destination_port = Some(port);
    if !net::is_wildcard(bind) {
        chain_match.prefix_ranges = net::convert_address_to_cidr(bind).into_iter().collect();
    }

    FilterChain {
        filter_chain_match: Some(chain_match),
        ..chain.clone()
    }
}
