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

//! Listeners accepting traffic for the services co-located with the proxy.

use std::collections::HashMap;

use super::{
    chain::{self, FilterChainOpts, HttpListenerOpts, ListenerOpts, RouteSource},
    metrics, BuildContext, BuildError, Stage,
};
use crate::{
    model::{
        AddressFamily, CaptureMode, Hostname, IngressListener, ListenerProtocol, Protocol,
        ServiceInstance, TrafficDirection,
    },
    net,
    plugin::{self, Hook, InboundChain, MutableObjects},
    push::{ConflictEvent, ConflictKind},
    xds::{
        ClientCertDetails, ForwardClientCertDetails, Http1ProtocolOptions, Http2ProtocolOptions,
        HttpConnectionManager, Listener, OperationName,
    },
};

/// Builds one listener per local service instance, or per ingress override
/// when the proxy's scope declares any. The first unit to claim an address
/// wins.
pub(crate) fn build(ctx: &BuildContext<'_>) -> Vec<Listener> {
    let mut claimed = HashMap::new();
    let scope = &ctx.proxy.sidecar_scope;

    if scope.has_custom_ingress_listeners() {
        return scope
            .ingress
            .iter()
            .filter_map(|ingress| build_for_ingress(ctx, &mut claimed, ingress))
            .collect();
    }

    if ctx.proxy.is_none_mode() {
        tracing::debug!(proxy = %ctx.proxy.id, "interception disabled, no inbound listeners");
        return Vec::new();
    }

    let mut listeners = Vec::new();
    for instance in &ctx.proxy.service_instances {
        if let Err(errors) = instance.validate() {
            tracing::warn!(
                proxy = %ctx.proxy.id,
                service = %instance.service.hostname,
                %errors,
                "skipping invalid service instance"
            );
            continue;
        }

        let bind = instance.endpoint.address.clone();
        if let Some(listener) = build_unit(ctx, &mut claimed, instance, &bind, false) {
            listeners.push(listener);
        }
    }

    listeners
}

fn build_for_ingress(
    ctx: &BuildContext<'_>,
    claimed: &mut HashMap<String, Hostname>,
    ingress: &IngressListener,
) -> Option<Listener> {
    let listen_port = &ingress.port;
    let bind_to_port = ctx.proxy.is_none_mode() || ingress.capture_mode == CaptureMode::None;

    if !ctx.proxy.can_bind(listen_port.port, bind_to_port) {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            port = listen_port.port,
            "skipping ingress listener on a privileged port"
        );
        return None;
    }

    let Some(found) = find_instance(&ctx.proxy.service_instances, ingress) else {
        tracing::debug!(
            proxy = %ctx.proxy.id,
            port = listen_port.port,
            "no service instance for ingress listener"
        );
        return None;
    };

    let bind = match &ingress.bind {
        Some(bind) if !bind.is_empty() => bind.clone(),
        _ if bind_to_port => net::inbound_bind_ip(ctx.proxy),
        _ => found.endpoint.address.clone(),
    };

    let mut instance = found.clone();
    instance.endpoint.family = AddressFamily::Tcp;
    instance.endpoint.address = bind.clone();
    instance.endpoint.service_port = listen_port.clone();
    instance.endpoint.port = listen_port.port;

    build_unit(ctx, claimed, &instance, &bind, bind_to_port)
}

/// The instance an ingress override fronts: the one listening on the
/// override's port, else the one whose service port has the override's name.
fn find_instance<'a>(
    instances: &'a [ServiceInstance],
    ingress: &IngressListener,
) -> Option<&'a ServiceInstance> {
    instances
        .iter()
        .find(|instance| instance.endpoint.port == ingress.port.port)
        .or_else(|| {
            instances.iter().find(|instance| {
                !ingress.port.name.is_empty()
                    && instance.endpoint.service_port.name == ingress.port.name
            })
        })
}

fn build_unit(
    ctx: &BuildContext<'_>,
    claimed: &mut HashMap<String, Hostname>,
    instance: &ServiceInstance,
    bind: &str,
    bind_to_port: bool,
) -> Option<Listener> {
    let port = instance.endpoint.port;
    let key = net::listener_key(bind, port);
    let hostname = &instance.service.hostname;

    if let Some(existing) = claimed.get(&key) {
        ctx.push.status.add(ConflictEvent {
            kind: ConflictKind::InboundListener,
            proxy_id: ctx.proxy.id.clone(),
            listener: key.clone(),
            accepted: vec![existing.clone()],
            rejected: hostname.clone(),
            message: format!(
                "Conflicting inbound listener:{key}. existing: {existing}, incoming: {hostname}"
            ),
        });
        return None;
    }

    let service_port = &instance.endpoint.service_port;
    let protocol = service_port.protocol.listener_protocol();
    if protocol == ListenerProtocol::Unknown {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            service = %hostname,
            protocol = %service_port.protocol,
            "unsupported inbound protocol"
        );
        return None;
    }

    let params = ctx.params(
        protocol,
        bind,
        Some(service_port),
        Some(&instance.service),
        Some(instance),
    );

    let mut inbound_chains: Vec<InboundChain> = ctx
        .plugins
        .iter()
        .flat_map(|plugin| plugin.on_inbound_filter_chains(&params))
        .collect();
    if inbound_chains.is_empty() {
        inbound_chains.push(InboundChain::default());
    }

    let filter_chains = inbound_chains
        .into_iter()
        .map(|chain| {
            let mut opts = match protocol {
                ListenerProtocol::Http => FilterChainOpts::http(http_opts(ctx, instance)),
                _ => FilterChainOpts::network(
                    ctx.push.env.inbound_network_filters(ctx.proxy, instance),
                ),
            };
            opts.tls_context = chain.tls_context;
            opts.match_override = chain.filter_chain_match;
            opts.listener_filters = chain.listener_filters;
            opts
        })
        .collect();

    let opts = ListenerOpts {
        bind: bind.into(),
        port,
        bind_to_port,
        filter_chains,
    };

    let mut listener = chain::build_listener(&opts);
    listener.traffic_direction = Some(TrafficDirection::Inbound);
    let mut mutable = MutableObjects::new(listener);

    let result = plugin::run_hook(ctx.plugins, Hook::InboundListener, &params, &mut mutable)
        .map_err(BuildError::from)
        .and_then(|_| {
            chain::build_complete_filter_chain(ctx.mesh(), ctx.proxy, &mut mutable, &opts)
        })
        .and_then(|_| mutable.listener.validate().map_err(BuildError::from));

    if let Err(error) = result {
        tracing::warn!(
            proxy = %ctx.proxy.id,
            listener = %key,
            %error,
            "dropping inbound listener"
        );
        metrics::dropped_listeners(Stage::Inbound).inc();
        return None;
    }

    claimed.insert(key, hostname.clone());
    Some(mutable.listener)
}

fn http_opts(ctx: &BuildContext<'_>, instance: &ServiceInstance) -> HttpListenerOpts {
    let protocol = instance.endpoint.service_port.protocol;

    let connection_manager = HttpConnectionManager {
        forward_client_cert_details: Some(ForwardClientCertDetails::AppendForward),
        set_current_client_cert_details: Some(ClientCertDetails {
            subject: true,
            uri: true,
            dns: true,
        }),
        server_name: Some(ctx.mesh().server_name.clone()),
        http2_protocol_options: protocol.is_http2().then(Http2ProtocolOptions::default),
        http_protocol_options: (ctx.mesh().features.http10 || ctx.proxy.http10()).then(|| {
            Http1ProtocolOptions {
                accept_http_10: true,
                ..<_>::default()
            }
        }),
        ..<_>::default()
    };

    HttpListenerOpts {
        route: RouteSource::Inline(ctx.push.env.inbound_route_config(ctx.proxy, instance)),
        connection_manager: Some(connection_manager),
        direction: OperationName::Ingress,
        add_grpc_web_filter: protocol == Protocol::GrpcWeb,
        use_remote_address: false,
    }
}
