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

use once_cell::sync::Lazy;
use prometheus::core::Collector;
pub use prometheus::Result;
use prometheus::{Opts, Registry};

pub const NAMESPACE: &str = "meshgen";

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);

/// The registry every collector in this crate is registered with. Exposition
/// is left to whoever embeds the generator.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
}

/// Registers `collector` with [`registry`], returning it so it can be stored
/// in a lazy static.
pub(crate) fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    // Registration only fails for duplicate descriptors, which
    // `register_if_not_exists` already treats as success.
    collector
        .clone()
        .register_if_not_exists(registry())
        .unwrap_or(collector)
}

pub trait CollectorExt: Collector + Clone + Sized + 'static {
    fn register_if_not_exists(self, registry: &Registry) -> Result<Self> {
        match registry.register(Box::new(self.clone())) {
            Ok(_) | Err(prometheus::Error::AlreadyReg) => Ok(self),
            Err(prometheus::Error::Msg(msg)) if msg.contains("already exists") => {
                // FIXME: We should be able to remove this branch entirely if `AlreadyReg` gets fixed.
                //  https://github.com/tikv/rust-prometheus/issues/247
                Ok(self)
            }
            Err(err) => Err(err),
        }
    }
}

impl<C: Collector + Clone + 'static> CollectorExt for C {}
