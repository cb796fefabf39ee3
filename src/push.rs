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

//! The immutable snapshot a push cycle builds against, and the status sink
//! conflicts are reported to.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    config::MeshConfig,
    listener::metrics,
    model::{DefaultEnvironment, Environment, Hostname},
};

static VERSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Stamp identifying one push cycle: `<RFC3339 time>/<counter>`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PushVersion(String);

impl PushVersion {
    /// A new version, unique within this process.
    pub fn next() -> Self {
        let now = time::OffsetDateTime::now_utc()
            .replace_nanosecond(0)
            .unwrap_or_else(|_| time::OffsetDateTime::now_utc());
        let timestamp = now
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        let counter = VERSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{timestamp}/{counter}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PushVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of listener conflict that was resolved.
///
/// Duplicate matches between two TCP chains and two catch-all chains share
/// [`ConflictKind::TcpOverCurrentTcp`].
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    Serialize,
    strum_macros::AsRefStr,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConflictKind {
    /// Two inbound units claimed the same address.
    InboundListener,
    /// A TCP unit arrived where a TCP listener with the same match exists.
    TcpOverCurrentTcp,
    /// A TCP unit arrived where an HTTP listener exists.
    TcpOverCurrentHttp,
    /// An HTTP unit arrived where a TCP listener exists.
    HttpOverCurrentTcp,
}

/// One resolved conflict, naming the winner and the rejected contributor.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ConflictEvent {
    pub kind: ConflictKind,
    pub proxy_id: String,
    /// The `bind:port` key of the contested listener.
    pub listener: String,
    pub accepted: Vec<Hostname>,
    pub rejected: Hostname,
    pub message: String,
}

/// Conflicts recorded during one push cycle.
#[derive(Debug, Default)]
pub struct PushStatus {
    events: Mutex<Vec<ConflictEvent>>,
}

impl PushStatus {
    pub fn add(&self, event: ConflictEvent) {
        tracing::warn!(
            kind = %event.kind,
            proxy = %event.proxy_id,
            listener = %event.listener,
            rejected = %event.rejected,
            "{}",
            event.message
        );
        metrics::conflicts(event.kind).inc();
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<ConflictEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, proxy_id: &str) -> Vec<ConflictEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.proxy_id == proxy_id)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: ConflictKind) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.kind == kind)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Everything one push cycle reads: mesh settings, collaborators, version
/// stamp, and the conflict sink.
pub struct PushContext {
    pub mesh: Arc<MeshConfig>,
    pub env: Arc<dyn Environment>,
    pub version: PushVersion,
    pub status: PushStatus,
}

impl PushContext {
    pub fn new(mesh: Arc<MeshConfig>, env: Arc<dyn Environment>) -> Self {
        Self {
            mesh,
            env,
            version: PushVersion::next(),
            status: PushStatus::default(),
        }
    }
}

impl Default for PushContext {
    fn default() -> Self {
        Self::new(
            Arc::new(MeshConfig::default()),
            Arc::new(DefaultEnvironment::default()),
        )
    }
}

impl fmt::Debug for PushContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushContext")
            .field("mesh", &self.mesh)
            .field("version", &self.version)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Holder of the current [`PushContext`]. A push cycle loads it once and
/// every build in the cycle sees that snapshot, whatever is stored after.
#[derive(Default)]
pub struct SharedPushContext {
    current: ArcSwap<PushContext>,
}

impl SharedPushContext {
    pub fn new(context: PushContext) -> Self {
        Self {
            current: ArcSwap::from_pointee(context),
        }
    }

    pub fn load(&self) -> Arc<PushContext> {
        self.current.load_full()
    }

    /// Replaces the snapshot with one built from new settings and a fresh
    /// version.
    pub fn store(&self, mesh: Arc<MeshConfig>, env: Arc<dyn Environment>) {
        self.current.store(Arc::new(PushContext::new(mesh, env)));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn versions_are_unique_and_stamped() {
        let first = PushVersion::next();
        let second = PushVersion::next();
        assert_ne!(first, second);

        let (timestamp, counter) = first.as_str().rsplit_once('/').unwrap();
        assert!(counter.parse::<u64>().is_ok());
        assert!(time::OffsetDateTime::parse(
            timestamp,
            &time::format_description::well_known::Rfc3339
        )
        .is_ok());
    }

    #[test]
    fn status_records_events() {
        let status = PushStatus::default();
        assert!(status.is_empty());

        status.add(ConflictEvent {
            kind: ConflictKind::TcpOverCurrentHttp,
            proxy_id: "a".into(),
            listener: "0.0.0.0:80".into(),
            accepted: vec!["web".into()],
            rejected: "db".into(),
            message: String::new(),
        });

        assert_eq!(1, status.count(ConflictKind::TcpOverCurrentHttp));
        assert_eq!(0, status.count(ConflictKind::TcpOverCurrentTcp));
        assert_eq!(1, status.events_for("a").len());
        assert!(status.events_for("b").is_empty());
    }

    #[test]
    fn loaded_snapshot_survives_store() {
        let shared = SharedPushContext::default();
        let snapshot = shared.load();

        let mesh = MeshConfig {
            proxy_listen_port: 16001,
            ..<_>::default()
        };
        shared.store(Arc::new(mesh), Arc::new(DefaultEnvironment::default()));

        assert_eq!(15001, snapshot.mesh.proxy_listen_port);
        assert_eq!(16001, shared.load().mesh.proxy_listen_port);
        assert_ne!(snapshot.version, shared.load().version);
    }

    #[test]
    fn kind_labels() {
        use strum::IntoEnumIterator;

        assert_eq!("http_over_current_tcp", ConflictKind::HttpOverCurrentTcp.as_ref());
        assert_eq!("inbound_listener", ConflictKind::InboundListener.to_string());

        let labels: Vec<String> = ConflictKind::iter()
            .map(|kind| serde_json::to_value(kind).unwrap().as_str().unwrap().to_owned())
            .collect();
        let expected: Vec<String> = ConflictKind::iter().map(|kind| kind.to_string()).collect();
        assert_eq!(expected, labels);
    }
}
