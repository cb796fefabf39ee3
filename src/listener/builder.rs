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

use std::collections::HashSet;

use super::{capture, inbound, management, metrics, outbound, BuildContext, ListenerRegistry, Stage};
use crate::xds::Listener;

/// Collects the listeners of one proxy stage by stage. Each stage reads the
/// output of the stages before it, so they are expected to be called in
/// declaration order.
pub(crate) struct ListenerBuilder<'a> {
    ctx: BuildContext<'a>,
    registry: ListenerRegistry,
    inbound: Vec<Listener>,
    outbound: Vec<Listener>,
    management: Vec<Listener>,
    virtual_outbound: Option<Listener>,
    virtual_inbound: Option<Listener>,
}

impl<'a> ListenerBuilder<'a> {
    pub fn new(ctx: BuildContext<'a>) -> Self {
        Self {
            ctx,
            registry: ListenerRegistry::new(),
            inbound: Vec::new(),
            outbound: Vec::new(),
            management: Vec::new(),
            virtual_outbound: None,
            virtual_inbound: None,
        }
    }

    pub fn build_inbound(mut self) -> Self {
        self.inbound = inbound::build(&self.ctx);
        self
    }

    pub fn build_outbound(mut self) -> Self {
        self.outbound = outbound::build(&self.ctx, &mut self.registry);
        self
    }

    pub fn build_management(mut self) -> Self {
        let existing: Vec<Listener> = self
            .inbound
            .iter()
            .chain(&self.outbound)
            .cloned()
            .collect();
        self.management = management::build(&self.ctx, &existing);
        self
    }

    pub fn build_virtual_outbound(mut self) -> Self {
        self.virtual_outbound = capture::virtual_outbound(&self.ctx);
        self
    }

    pub fn build_virtual_inbound(mut self) -> Self {
        self.virtual_inbound = capture::virtual_inbound(&self.ctx, &self.inbound);
        self
    }

    /// Every listener built, in stage order. A listener whose address was
    /// already taken by an earlier one is left out.
    pub fn into_listeners(self) -> Vec<Listener> {
        let proxy_id = &self.ctx.proxy.id;
        let mut seen = HashSet::new();

        self.inbound
            .into_iter()
            .chain(self.outbound)
            .chain(self.management)
            .chain(self.virtual_outbound)
            .chain(self.virtual_inbound)
            .filter(|listener| {
                if seen.insert(listener.address.clone()) {
                    return true;
                }

                tracing::warn!(
                    proxy = %proxy_id,
                    listener = %listener.name,
                    "omitting listener, its address is already in use"
                );
                metrics::dropped_listeners(Stage::Orchestrator).inc();
                false
            })
            .collect()
    }
}
