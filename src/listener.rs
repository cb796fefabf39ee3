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

//! Listener synthesis.
//!
//! [`ConfigGenerator`] computes every listener of a proxy from a
//! [`PushContext`] snapshot. The work is split into stages that run in a
//! fixed order (inbound, outbound, management, then the virtual capture
//! listeners), each stage seeing what the earlier ones produced.

mod builder;
pub mod chain;
mod capture;
pub mod conflict;
mod inbound;
mod management;
pub(crate) mod metrics;
mod outbound;

use std::sync::Arc;

use serde::Serialize;

use self::builder::ListenerBuilder;
pub use self::{
    chain::{FilterChainOpts, HttpListenerOpts, ListenerOpts, RouteSource},
    conflict::{
        EntryState, ListenerRegistry, OutboundListenerEntry, OutboundUnit, Rejection, Resolution,
    },
};
use crate::{
    config::MeshConfig,
    model::{ListenerProtocol, Port, Proxy, Service, ServiceInstance},
    net,
    plugin::{InputParams, Plugin, PluginError},
    push::{PushContext, PushVersion, SharedPushContext},
    xds::Listener,
};

/// Why a single listener could not be built.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("listener {0} has no filter chains")]
    NoFilterChains(String),
    #[error("filter chain {index} of listener {listener} has no filters")]
    EmptyFilterChain { listener: String, index: usize },
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Invalid(#[from] crate::xds::ValidationError),
}

/// The build step a listener was abandoned in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::AsRefStr, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Stage {
    Inbound,
    Outbound,
    Management,
    Capture,
    Orchestrator,
}

/// What every stage of one proxy's build reads.
#[derive(Clone, Copy)]
pub(crate) struct BuildContext<'a> {
    pub proxy: &'a Proxy,
    pub push: &'a PushContext,
    pub plugins: &'a [Arc<dyn Plugin>],
    pub wildcard: &'static str,
    pub localhost: &'static str,
}

impl<'a> BuildContext<'a> {
    pub fn new(proxy: &'a Proxy, push: &'a PushContext, plugins: &'a [Arc<dyn Plugin>]) -> Self {
        let (wildcard, localhost) = net::wildcard_and_localhost(proxy);
        Self {
            proxy,
            push,
            plugins,
            wildcard,
            localhost,
        }
    }

    pub fn mesh(&self) -> &'a MeshConfig {
        &self.push.mesh
    }

    pub fn params<'b>(
        &'b self,
        listener_protocol: ListenerProtocol,
        bind: &'b str,
        port: Option<&'b Port>,
        service: Option<&'b Service>,
        service_instance: Option<&'b ServiceInstance>,
    ) -> InputParams<'b> {
        InputParams {
            listener_protocol,
            proxy: self.proxy,
            push: self.push,
            bind,
            port,
            service,
            service_instance,
        }
    }
}

/// The listeners built for one proxy in one push cycle.
#[derive(Clone, Debug, Serialize)]
pub struct ProxyListeners {
    pub proxy_id: String,
    pub version: PushVersion,
    pub listeners: Vec<Listener>,
}

/// Builds listeners for sidecar proxies with a fixed, ordered set of
/// plugins.
#[derive(Clone, Default)]
pub struct ConfigGenerator {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl ConfigGenerator {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Every listener of `proxy`, built against `push`.
    ///
    /// Listeners that cannot be built are logged and left out. Conflicts are
    /// recorded on `push.status`.
    #[cfg_attr(feature = "instrument", tracing::instrument(skip_all, fields(proxy = %proxy.id)))]
    pub fn build_listeners(&self, proxy: &Proxy, push: &PushContext) -> Vec<Listener> {
        if push.mesh.proxy_listen_port == 0 {
            tracing::debug!(proxy = %proxy.id, "no capture port configured, skipping listeners");
            return Vec::new();
        }

        if let Err(errors) = proxy.sidecar_scope.validate() {
            tracing::warn!(proxy = %proxy.id, %errors, "sidecar scope is invalid");
        }

        let listeners = ListenerBuilder::new(BuildContext::new(proxy, push, &self.plugins))
            .build_inbound()
            .build_outbound()
            .build_management()
            .build_virtual_outbound()
            .build_virtual_inbound()
            .into_listeners();

        tracing::debug!(
            proxy = %proxy.id,
            version = %push.version,
            listeners = listeners.len(),
            "built listeners"
        );
        listeners
    }

    /// Builds every proxy's listeners in parallel against the snapshot held
    /// by `shared` when the call starts. Results are in `proxies` order.
    pub async fn push_all(
        &self,
        shared: &SharedPushContext,
        proxies: Vec<Arc<Proxy>>,
    ) -> crate::Result<Vec<ProxyListeners>> {
        let push = shared.load();
        let mut tasks = tokio::task::JoinSet::new();

        for (index, proxy) in proxies.into_iter().enumerate() {
            let generator = self.clone();
            let push = push.clone();
            tasks.spawn_blocking(move || {
                let listeners = generator.build_listeners(&proxy, &push);
                (
                    index,
                    ProxyListeners {
                        proxy_id: proxy.id.clone(),
                        version: push.version.clone(),
                        listeners,
                    },
                )
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(result) = tasks.join_next().await {
            results.push(result?);
        }
        results.sort_by_key(|(index, _)| *index);

        tracing::info!(
            version = %push.version,
            proxies = results.len(),
            conflicts = push.status.events().len(),
            "push cycle complete"
        );

        Ok(results.into_iter().map(|(_, listeners)| listeners).collect())
    }
}
