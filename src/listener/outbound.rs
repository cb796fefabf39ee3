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

//! Listeners carrying the proxy's own traffic to the services it can see.
//!
//! Egress rules are walked in declared order and every (service, port) pair
//! they expose becomes an [`OutboundUnit`] bidding for a `bind:port` key in
//! the [`ListenerRegistry`]. Once every rule has been resolved the surviving
//! entries are turned into listeners.

use std::sync::Arc;

use super::{
    chain::{self, FilterChainOpts, HttpListenerOpts, ListenerOpts, RouteSource},
    conflict::{ListenerRegistry, OutboundListenerEntry, OutboundUnit},
    metrics, BuildContext, BuildError, Stage,
};
use crate::{
    model::{
        CaptureMode, EgressListener, ListenerProtocol, OutboundTcpParams, Port, Service,
        TrafficDirection,
    },
    net,
    plugin::{self, Hook, MutableObjects},
    xds::{Http1ProtocolOptions, HttpConnectionManager, Listener, OperationName},
};

/// Route name of the explicit HTTP proxy listener.
pub(crate) const HTTP_PROXY_ROUTE: &str = "http_proxy";

/// Resolves every egress rule into `registry` and builds the resulting
/// listeners: TCP ones first, then HTTP ones, then the HTTP proxy listener.
pub(crate) fn build(ctx: &BuildContext<'_>, registry: &mut ListenerRegistry) -> Vec<Listener> {
    for egress in &ctx.proxy.sidecar_scope.egress {
        resolve_rule(ctx, registry, egress);
    }

    let mut tcp = Vec::new();
    let mut http = Vec::new();
    for entry in registry.iter() {
        let Some(listener) = finalize(ctx, entry) else {
            continue;
        };

        if entry.port.protocol.is_tcp() {
            tcp.push(listener);
        } else {
            http.push(listener);
        }
    }

    tcp.append(&mut http);
    tcp.extend(http_proxy(ctx, registry));
    tcp
}

fn resolve_rule(ctx: &BuildContext<'_>, registry: &mut ListenerRegistry, egress: &EgressListener) {
    let bind_to_port = ctx.proxy.is_none_mode() || egress.capture_mode == CaptureMode::None;
    let rule_bind = egress.bind.as_deref().filter(|bind| !bind.is_empty());

    let services = egress.services.iter().filter(|service| match service.validate() {
        Ok(()) => true,
        Err(errors) => {
            tracing::warn!(
                proxy = %ctx.proxy.id,
                service = %service.hostname,
                %errors,
                "skipping invalid service"
            );
            false
        }
    });

    match &egress.port {
        Some(port) => {
            let bind = match rule_bind {
                Some(bind) => bind,
                None if bind_to_port => ctx.localhost,
                None => ctx.wildcard,
            };

            for service in services {
                resolve_unit(ctx, registry, service, port, Some(bind), bind_to_port);
            }
        }
        None => {
            registry.lock_all();
            let bind = rule_bind.or(bind_to_port.then_some(ctx.localhost));

            for service in services {
                for port in &service.ports {
                    if !ctx.proxy.can_bind(port.port, bind_to_port) {
                        tracing::debug!(
                            proxy = %ctx.proxy.id,
                            service = %service.hostname,
                            port = port.port,
                            "proxy cannot bind privileged port"
                        );
                        continue;
                    }

                    resolve_unit(ctx, registry, service, port, bind, bind_to_port);
                }
            }
        }
    }
}

fn resolve_unit(
    ctx: &BuildContext<'_>,
    registry: &mut ListenerRegistry,
    service: &Arc<Service>,
    port: &Port,
    bind: Option<&str>,
    bind_to_port: bool,
) {
    let unit = match port.protocol.listener_protocol() {
        ListenerProtocol::Http => http_unit(ctx, service, port, bind, bind_to_port),
        ListenerProtocol::Tcp => match tcp_unit(ctx, service, port, bind, bind_to_port) {
            Some(unit) => unit,
            None => return,
        },
        ListenerProtocol::Unknown => {
            tracing::trace!(
                service = %service.hostname,
                protocol = %port.protocol,
                "no outbound listener for protocol"
            );
            return;
        }
    };

    let key = unit.key();
    let resolution = registry.resolve(unit, &ctx.proxy.id, &ctx.push.status);
    tracing::trace!(
        proxy = %ctx.proxy.id,
        listener = %key,
        service = %service.hostname,
        ?resolution,
        "resolved outbound unit"
    );
}

fn http_unit(
    ctx: &BuildContext<'_>,
    service: &Arc<Service>,
    port: &Port,
    bind: Option<&str>,
    bind_to_port: bool,
) -> OutboundUnit {
    let bind = bind.unwrap_or(ctx.wildcard).to_owned();
    // Unix domain socket listeners have no port to name their routes after.
    let route = if port.port == 0 {
        bind.clone()
    } else {
        port.port.to_string()
    };

    OutboundUnit {
        filter_chains: vec![FilterChainOpts::http(HttpListenerOpts {
            route: RouteSource::Rds(route),
            connection_manager: None,
            direction: OperationName::Egress,
            add_grpc_web_filter: false,
            use_remote_address: ctx.mesh().features.use_remote_address,
        })],
        bind,
        port: port.clone(),
        service: service.clone(),
        bind_to_port,
    }
}

fn tcp_unit(
    ctx: &BuildContext<'_>,
    service: &Arc<Service>,
    port: &Port,
    bind: Option<&str>,
    bind_to_port: bool,
) -> Option<OutboundUnit> {
    let address = service.address_for_proxy(ctx.proxy);
    let (bind, destination_cidr) = match bind {
        Some(bind) => (bind.to_owned(), None),
        None if address.is_empty() => (ctx.wildcard.to_owned(), None),
        None if address.contains('/') => (ctx.wildcard.to_owned(), Some(address)),
        None => (address.to_owned(), None),
    };

    let chains = ctx.push.env.outbound_tcp_filter_chains(OutboundTcpParams {
        proxy: ctx.proxy,
        service,
        port,
        destination_cidr,
        wildcard: ctx.wildcard,
    });

    if chains.is_empty() || chains.iter().any(|chain| chain.filters.is_empty()) {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            service = %service.hostname,
            port = port.port,
            "no usable filter chains for outbound tcp service"
        );
        metrics::dropped_listeners(Stage::Outbound).inc();
        return None;
    }

    Some(OutboundUnit {
        filter_chains: chains
            .into_iter()
            .map(|chain| FilterChainOpts {
                sni_hosts: chain.sni_hosts,
                destination_cidrs: chain.destination_cidrs,
                network_filters: chain.filters,
                ..<_>::default()
            })
            .collect(),
        bind,
        port: port.clone(),
        service: service.clone(),
        bind_to_port,
    })
}

/// Turns a registry entry into a listener. Plugins see the entry's first
/// contributing service.
fn finalize(ctx: &BuildContext<'_>, entry: &OutboundListenerEntry) -> Option<Listener> {
    let mut opts = entry.opts.clone();
    if net::is_wildcard(&opts.bind) {
        chain::apply_wildcard_safety_net(&mut opts, ctx.proxy, ctx.mesh());
    }

    let mut listener = chain::build_listener(&opts);
    listener.traffic_direction = Some(TrafficDirection::Outbound);
    let mut mutable = MutableObjects::new(listener);

    let service = entry.services.first().map(Arc::as_ref);
    let params = ctx.params(entry.protocol(), &opts.bind, Some(&entry.port), service, None);

    let result = plugin::run_hook(ctx.plugins, Hook::OutboundListener, &params, &mut mutable)
        .map_err(BuildError::from)
        .and_then(|_| {
            chain::build_complete_filter_chain(ctx.mesh(), ctx.proxy, &mut mutable, &opts)
        });

    if let Err(error) = result {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            listener = %entry.key,
            %error,
            "dropping outbound listener"
        );
        metrics::dropped_listeners(Stage::Outbound).inc();
        return None;
    }

    if let Err(error) = mutable.listener.validate() {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            listener = %entry.key,
            protocol = %entry.port.protocol,
            %error,
            "invalid outbound listener"
        );
        metrics::invalid_outbound_listeners().inc();
        return None;
    }

    Some(mutable.listener)
}

/// The loopback listener applications use as an explicit HTTP proxy.
fn http_proxy(ctx: &BuildContext<'_>, registry: &ListenerRegistry) -> Option<Listener> {
    let port = ctx.mesh().http_proxy_port(!ctx.proxy.is_none_mode())?;
    let key = net::listener_key(ctx.localhost, port);
    if registry.contains(&key) {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            listener = %key,
            "http proxy port already taken by an outbound listener"
        );
        return None;
    }

    let opts = ListenerOpts {
        bind: ctx.localhost.into(),
        port,
        bind_to_port: true,
        filter_chains: vec![FilterChainOpts::http(HttpListenerOpts {
            route: RouteSource::Rds(HTTP_PROXY_ROUTE.into()),
            connection_manager: Some(HttpConnectionManager {
                http_protocol_options: Some(Http1ProtocolOptions {
                    allow_absolute_url: true,
                    ..<_>::default()
                }),
                ..<_>::default()
            }),
            direction: OperationName::Egress,
            add_grpc_web_filter: false,
            use_remote_address: false,
        })],
    };

    let mut listener = chain::build_listener(&opts);
    listener.traffic_direction = Some(TrafficDirection::Outbound);
    let mut mutable = MutableObjects::new(listener);

    if let Err(error) =
        chain::build_complete_filter_chain(ctx.mesh(), ctx.proxy, &mut mutable, &opts)
    {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            listener = %key,
            %error,
            "dropping http proxy listener"
        );
        metrics::dropped_listeners(Stage::Outbound).inc();
        return None;
    }

    Some(mutable.listener)
}
