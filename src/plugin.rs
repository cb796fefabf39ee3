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

//! Extension points consulted while listeners are built.

use std::sync::Arc;

use crate::{
    model::{ListenerProtocol, Port, Proxy, Service, ServiceInstance},
    push::PushContext,
    xds::{Filter, FilterChainMatch, HttpFilter, Listener, ListenerFilter, TlsContext},
};

/// An error reported by a [`Plugin`] hook. Aborts the listener being built.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("plugin {plugin} failed: {message}")]
pub struct PluginError {
    pub plugin: String,
    pub message: String,
}

impl PluginError {
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// What a hook is being called for.
#[derive(Clone, Copy)]
pub struct InputParams<'a> {
    pub listener_protocol: ListenerProtocol,
    pub proxy: &'a Proxy,
    pub push: &'a PushContext,
    /// Bind address of the listener, empty for capture listeners.
    pub bind: &'a str,
    pub port: Option<&'a Port>,
    /// The service an outbound or capture listener was built for.
    pub service: Option<&'a Service>,
    /// The local instance an inbound listener was built for.
    pub service_instance: Option<&'a ServiceInstance>,
}

/// A filter chain contributed for an inbound listener.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InboundChain {
    pub tls_context: Option<TlsContext>,
    pub filter_chain_match: Option<FilterChainMatch>,
    pub listener_filters: Vec<ListenerFilter>,
}

/// Filters plugins add to one filter chain. Network filters are inserted
/// ahead of the chain's terminal filter, HTTP filters ahead of the router.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChainFilters {
    pub tcp: Vec<Filter>,
    pub http: Vec<HttpFilter>,
}

/// The listener under construction, as handed to plugin hooks.
/// `filter_chains[i]` holds additions for `listener.filter_chains[i]`.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableObjects {
    pub listener: Listener,
    pub filter_chains: Vec<ChainFilters>,
}

impl MutableObjects {
    pub fn new(listener: Listener) -> Self {
        let filter_chains = vec![ChainFilters::default(); listener.filter_chains.len()];
        Self {
            listener,
            filter_chains,
        }
    }
}

/// A listener extension. Every hook has a no-op default.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Additional filter chains for an inbound listener. When no plugin
    /// contributes any, the listener gets one chain without a match.
    fn on_inbound_filter_chains(&self, _params: &InputParams<'_>) -> Vec<InboundChain> {
        Vec::new()
    }

    fn on_inbound_listener(
        &self,
        _params: &InputParams<'_>,
        _mutable: &mut MutableObjects,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_outbound_listener(
        &self,
        _params: &InputParams<'_>,
        _mutable: &mut MutableObjects,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called for the `virtualOutbound` capture listener.
    fn on_capture_listener(
        &self,
        _params: &InputParams<'_>,
        _mutable: &mut MutableObjects,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Which listener hook to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum Hook {
    InboundListener,
    OutboundListener,
    CaptureListener,
}

/// Runs `hook` on every plugin in registration order. A failing plugin does
/// not stop the ones after it; the first error is returned once all ran.
pub(crate) fn run_hook(
    plugins: &[Arc<dyn Plugin>],
    hook: Hook,
    params: &InputParams<'_>,
    mutable: &mut MutableObjects,
) -> Result<(), PluginError> {
    let mut first_error = None;

    for plugin in plugins {
        let result = match hook {
            Hook::InboundListener => plugin.on_inbound_listener(params, mutable),
            Hook::OutboundListener => plugin.on_outbound_listener(params, mutable),
            Hook::CaptureListener => plugin.on_capture_listener(params, mutable),
        };

        if let Err(error) = result {
            tracing::warn!(
                plugin = plugin.name(),
                %hook,
                listener = %mutable.listener.name,
                %error,
                "plugin hook failed"
            );
            first_error.get_or_insert(error);
        }
    }

    first_error.map_or(Ok(()), Err)
}
