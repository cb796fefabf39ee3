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

//! The outbound listener registry, keyed by `bind:port`.
//!
//! Units are resolved in egress rule order. The first unit to claim a key
//! creates its entry; later units either merge into it or are rejected, and
//! every rejection that is not plain filtering is recorded on the push status.

use std::{collections::HashMap, sync::Arc};

use super::chain::{FilterChainOpts, ListenerOpts};
use crate::{
    model::{Hostname, ListenerProtocol, Port, Service},
    net,
    push::{ConflictEvent, ConflictKind, PushStatus},
};

/// Whether an entry still accepts contributions.
///
/// Entries are locked once every explicit egress rule has been processed, so
/// the catch-all rule only fills ports nothing claimed explicitly.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum EntryState {
    #[default]
    Open,
    Locked,
}

/// One service port's bid for an outbound listener.
#[derive(Clone, Debug)]
pub struct OutboundUnit {
    pub bind: String,
    pub port: Port,
    pub service: Arc<Service>,
    pub filter_chains: Vec<FilterChainOpts>,
    pub bind_to_port: bool,
}

impl OutboundUnit {
    pub fn key(&self) -> String {
        net::listener_key(&self.bind, self.port.port)
    }

    pub fn protocol(&self) -> ListenerProtocol {
        self.port.protocol.listener_protocol()
    }
}

/// The listener claimed for one `bind:port` key.
#[derive(Clone, Debug)]
pub struct OutboundListenerEntry {
    pub key: String,
    /// The port of the unit that created the entry. Decides the protocol.
    pub port: Port,
    /// Contributing services in arrival order.
    pub services: Vec<Arc<Service>>,
    pub opts: ListenerOpts,
    pub state: EntryState,
}

impl OutboundListenerEntry {
    fn new(unit: OutboundUnit) -> Self {
        let key = unit.key();
        Self {
            key,
            opts: ListenerOpts {
                bind: unit.bind,
                port: unit.port.port,
                bind_to_port: unit.bind_to_port,
                filter_chains: unit.filter_chains,
            },
            port: unit.port,
            services: vec![unit.service],
            state: EntryState::Open,
        }
    }

    pub fn protocol(&self) -> ListenerProtocol {
        self.port.protocol.listener_protocol()
    }

    pub fn hostnames(&self) -> Vec<Hostname> {
        self.services
            .iter()
            .map(|service| service.hostname.clone())
            .collect()
    }

    fn add_service(&mut self, service: Arc<Service>) {
        if !self
            .services
            .iter()
            .any(|existing| existing.hostname == service.hostname)
        {
            self.services.push(service);
        }
    }
}

/// Why a unit was turned away.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Rejection {
    /// The entry was locked. Not a conflict.
    Locked,
    Conflict(ConflictKind),
}

/// The outcome of [`ListenerRegistry::resolve`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Resolution {
    Created,
    /// The unit's service now contributes to the entry. HTTP merges never
    /// add chains.
    Merged { chains_added: usize },
    Rejected(Rejection),
}

/// Outbound entries in first-claim order. Owned by a single build.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    entries: Vec<OutboundListenerEntry>,
    index: HashMap<String, usize>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&OutboundListenerEntry> {
        self.index.get(key).map(|&index| &self.entries[index])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OutboundListenerEntry> {
        self.entries.iter()
    }

    pub fn lock_all(&mut self) {
        for entry in &mut self.entries {
            entry.state = EntryState::Locked;
        }
    }

    pub fn into_entries(self) -> Vec<OutboundListenerEntry> {
        self.entries
    }

    /// Creates, merges into, or rejects in favour of the entry at the unit's
    /// key. Conflicts are recorded on `status` against `proxy_id`.
    pub fn resolve(
        &mut self,
        unit: OutboundUnit,
        proxy_id: &str,
        status: &PushStatus,
    ) -> Resolution {
        let key = unit.key();
        let Some(&index) = self.index.get(&key) else {
            tracing::trace!(listener = %key, service = %unit.service.hostname, "claimed listener");
            self.index.insert(key, self.entries.len());
            self.entries.push(OutboundListenerEntry::new(unit));
            return Resolution::Created;
        };

        let entry = &mut self.entries[index];
        if entry.state == EntryState::Locked {
            tracing::trace!(
                listener = %key,
                service = %unit.service.hostname,
                "listener claimed by an explicit egress rule"
            );
            return Resolution::Rejected(Rejection::Locked);
        }

        let incoming = unit.protocol();
        let current = entry.protocol();

        if incoming != current {
            let kind = if incoming == ListenerProtocol::Http {
                ConflictKind::HttpOverCurrentTcp
            } else {
                ConflictKind::TcpOverCurrentHttp
            };
            record(status, kind, proxy_id, entry, incoming, &unit.service.hostname);
            return Resolution::Rejected(Rejection::Conflict(kind));
        }

        if current == ListenerProtocol::Http {
            entry.add_service(unit.service);
            return Resolution::Merged { chains_added: 0 };
        }

        let mut chains_added = 0;
        for chain in unit.filter_chains {
            let chain_match = chain.build_match();
            let duplicate = entry
                .opts
                .filter_chains
                .iter()
                .any(|existing| existing.build_match() == chain_match);

            if duplicate {
                record(
                    status,
                    ConflictKind::TcpOverCurrentTcp,
                    proxy_id,
                    entry,
                    incoming,
                    &unit.service.hostname,
                );
                continue;
            }

            entry.opts.filter_chains.push(chain);
            chains_added += 1;
        }

        if chains_added == 0 {
            return Resolution::Rejected(Rejection::Conflict(ConflictKind::TcpOverCurrentTcp));
        }

        entry.add_service(unit.service);
        Resolution::Merged { chains_added }
    }
}

fn record(
    status: &PushStatus,
    kind: ConflictKind,
    proxy_id: &str,
    entry: &OutboundListenerEntry,
    incoming: ListenerProtocol,
    rejected: &Hostname,
) {
    let current = entry.protocol();
    let accepted = entry.hostnames();
    let joined = accepted
        .iter()
        .map(Hostname::as_str)
        .collect::<Vec<_>>()
        .join(",");

    let message = format!(
        "Listener={} Accepted{current}={joined} Rejected{incoming}={rejected} {current}Services={}",
        entry.key,
        accepted.len(),
    );

    status.add(ConflictEvent {
        kind,
        proxy_id: proxy_id.into(),
        listener: entry.key.clone(),
        accepted,
        rejected: rejected.clone(),
        message,
    });
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        listener::chain::{HttpListenerOpts, RouteSource},
        model::Protocol,
        xds::{Filter, OperationName},
    };

    fn service(hostname: &str) -> Arc<Service> {
        Arc::new(Service {
            hostname: hostname.into(),
            ..<_>::default()
        })
    }

    fn tcp(hostname: &str, cidrs: &[&str]) -> OutboundUnit {
        OutboundUnit {
            bind: "0.0.0.0".into(),
            port: Port::new("tcp", 9080, Protocol::Tcp),
            service: service(hostname),
            filter_chains: vec![FilterChainOpts {
                destination_cidrs: cidrs.iter().map(|cidr| (*cidr).to_owned()).collect(),
                network_filters: vec![Filter::tcp_proxy(hostname, hostname)],
                ..<_>::default()
            }],
            bind_to_port: false,
        }
    }

    fn http(hostname: &str) -> OutboundUnit {
        OutboundUnit {
            bind: "0.0.0.0".into(),
            port: Port::new("http", 9080, Protocol::Http),
            service: service(hostname),
            filter_chains: vec![FilterChainOpts::http(HttpListenerOpts {
                route: RouteSource::Rds("9080".into()),
                connection_manager: None,
                direction: OperationName::Egress,
                add_grpc_web_filter: false,
                use_remote_address: false,
            })],
            bind_to_port: false,
        }
    }

    #[test]
    fn http_units_merge() {
        let status = PushStatus::default();
        let mut registry = ListenerRegistry::new();

        assert_eq!(Resolution::Created, registry.resolve(http("a"), "p", &status));
        assert_eq!(
            Resolution::Merged { chains_added: 0 },
            registry.resolve(http("b"), "p", &status)
        );

        let entry = registry.get("0.0.0.0:9080").unwrap();
        assert_eq!(vec![Hostname::from("a"), Hostname::from("b")], entry.hostnames());
        assert_eq!(1, entry.opts.filter_chains.len());
        assert!(status.is_empty());
    }

    #[test]
    fn disjoint_tcp_units_merge() {
        let status = PushStatus::default();
        let mut registry = ListenerRegistry::new();

        registry.resolve(tcp("a", &["10.0.0.1"]), "p", &status);
        assert_eq!(
            Resolution::Merged { chains_added: 1 },
            registry.resolve(tcp("b", &["10.0.0.2"]), "p", &status)
        );

        let entry = registry.get("0.0.0.0:9080").unwrap();
        assert_eq!(2, entry.opts.filter_chains.len());
        assert_eq!(2, entry.services.len());
        assert!(status.is_empty());
    }

    #[test]
    fn equal_tcp_matches_conflict() {
        let status = PushStatus::default();
        let mut registry = ListenerRegistry::new();

        registry.resolve(tcp("a", &["10.0.0.2", "10.0.0.1"]), "p", &status);
        assert_eq!(
            Resolution::Rejected(Rejection::Conflict(ConflictKind::TcpOverCurrentTcp)),
            registry.resolve(tcp("b", &["10.0.0.1", "10.0.0.2"]), "p", &status)
        );

        let entry = registry.get("0.0.0.0:9080").unwrap();
        assert_eq!(1, entry.opts.filter_chains.len());
        assert_eq!(vec![Hostname::from("a")], entry.hostnames());

        let events = status.events();
        assert_eq!(1, events.len());
        assert_eq!(ConflictKind::TcpOverCurrentTcp, events[0].kind);
        assert_eq!(Hostname::from("b"), events[0].rejected);
        assert_eq!(
            "Listener=0.0.0.0:9080 AcceptedTCP=a RejectedTCP=b TCPServices=1",
            events[0].message
        );
    }

    #[test]
    fn differently_written_equal_matches_conflict() {
        let status = PushStatus::default();
        let mut registry = ListenerRegistry::new();

        registry.resolve(tcp("a", &["2001:DB8::2", "2001:db8::1"]), "p", &status);
        assert_eq!(
            Resolution::Rejected(Rejection::Conflict(ConflictKind::TcpOverCurrentTcp)),
            registry.resolve(tcp("b", &["2001:db8::2", "2001:db8::1"]), "p", &status)
        );
        assert_eq!(
            Resolution::Rejected(Rejection::Conflict(ConflictKind::TcpOverCurrentTcp)),
            registry.resolve(
                tcp("c", &["2001:db8::1/128", "2001:db8::2", "2001:db8::1"]),
                "p",
                &status
            )
        );

        let entry = registry.get("0.0.0.0:9080").unwrap();
        assert_eq!(1, entry.opts.filter_chains.len());
        assert_eq!(2, status.events().len());
    }

    #[test]
    fn two_catch_alls_conflict() {
        let status = PushStatus::default();
        let mut registry = ListenerRegistry::new();

        registry.resolve(tcp("a", &[]), "p", &status);
        assert!(matches!(
            registry.resolve(tcp("b", &[]), "p", &status),
            Resolution::Rejected(Rejection::Conflict(ConflictKind::TcpOverCurrentTcp))
        ));
        assert_eq!(1, status.count(ConflictKind::TcpOverCurrentTcp));
    }

    #[test]
    fn protocol_mismatch_is_directional() {
        let status = PushStatus::default();
        let mut registry = ListenerRegistry::new();

        registry.resolve(tcp("db", &[]), "p", &status);
        assert_eq!(
            Resolution::Rejected(Rejection::Conflict(ConflictKind::HttpOverCurrentTcp)),
            registry.resolve(http("web"), "p", &status)
        );

        let mut registry = ListenerRegistry::new();
        registry.resolve(http("web"), "p", &status);
        assert_eq!(
            Resolution::Rejected(Rejection::Conflict(ConflictKind::TcpOverCurrentHttp)),
            registry.resolve(tcp("db", &[]), "p", &status)
        );

        let events = status.events();
        assert_eq!(
            "Listener=0.0.0.0:9080 AcceptedTCP=db RejectedHTTP=web TCPServices=1",
            events[0].message
        );
        assert_eq!(
            "Listener=0.0.0.0:9080 AcceptedHTTP=web RejectedTCP=db HTTPServices=1",
            events[1].message
        );
    }

    #[test]
    fn locked_entries_reject_silently() {
        let status = PushStatus::default();
        let mut registry = ListenerRegistry::new();

        registry.resolve(http("a"), "p", &status);
        registry.lock_all();

        assert_eq!(
            Resolution::Rejected(Rejection::Locked),
            registry.resolve(tcp("b", &[]), "p", &status)
        );
        assert_eq!(
            Resolution::Rejected(Rejection::Locked),
            registry.resolve(http("c"), "p", &status)
        );
        assert_eq!(
            vec![Hostname::from("a")],
            registry.get("0.0.0.0:9080").unwrap().hostnames()
        );
        assert!(status.is_empty());

        let mut other = tcp("d", &[]);
        other.port.port = 9090;
        assert_eq!(Resolution::Created, registry.resolve(other, "p", &status));
        assert_eq!(EntryState::Open, registry.get("0.0.0.0:9090").unwrap().state);
    }
}
