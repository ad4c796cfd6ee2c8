//! Live subscription registry and fan-out.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{connection::Connection, envelope::RelayMessage, event::Event, filter::Filter};

struct Listener {
    filters: Vec<Filter>,
    token: CancellationToken,
    generation: u64,
    // events are only pushed once the stored replay has finished
    armed: bool,
}

struct ConnectionListeners {
    conn: Arc<Connection>,
    subs: HashMap<String, Listener>,
}

/// Subscriptions keyed by connection id, then by subscription id.
#[derive(Default)]
pub struct Registry {
    conns: DashMap<u64, ConnectionListeners>,
    generation: AtomicU64,
}

impl Registry {
    /// Add or replace the subscription `sub_id` on `conn`.
    ///
    /// The listener starts unarmed. The returned generation must be handed to
    /// [`Registry::arm`] so that a replay which outlived its subscription
    /// cannot arm a newer one under the same id.
    pub fn register(
        &self,
        conn: &Arc<Connection>,
        sub_id: &str,
        filters: Vec<Filter>,
        token: CancellationToken,
    ) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let mut entry = self
            .conns
            .entry(conn.id())
            .or_insert_with(|| ConnectionListeners {
                conn: Arc::clone(conn),
                subs: HashMap::new(),
            });
        let listener = Listener {
            filters,
            token,
            generation,
            armed: false,
        };
        if let Some(old) = entry.subs.insert(sub_id.to_string(), listener) {
            old.token.cancel();
        }
        generation
    }

    /// Start live delivery for a subscription whose replay has finished.
    pub fn arm(&self, conn_id: u64, sub_id: &str, generation: u64) -> bool {
        let Some(mut entry) = self.conns.get_mut(&conn_id) else {
            return false;
        };
        match entry.subs.get_mut(sub_id) {
            Some(l) if l.generation == generation => {
                l.armed = true;
                true
            }
            _ => false,
        }
    }

    /// Cancel and drop one subscription. Unknown ids are ignored.
    pub fn unregister(&self, conn_id: u64, sub_id: &str) -> bool {
        let removed = {
            let Some(mut entry) = self.conns.get_mut(&conn_id) else {
                return false;
            };
            entry.subs.remove(sub_id)
        };
        self.conns.remove_if(&conn_id, |_, e| e.subs.is_empty());
        match removed {
            Some(l) => {
                l.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget every subscription of a closed connection.
    ///
    /// The listeners' tokens are children of the connection token, which the
    /// caller has already cancelled.
    pub fn unregister_all(&self, conn_id: u64) {
        self.conns.remove(&conn_id);
    }

    /// Push `ev` to every armed subscription with a matching filter.
    pub fn notify(&self, ev: &Event) -> usize {
        let mut delivered = 0;
        for entry in self.conns.iter() {
            for (sub_id, listener) in &entry.subs {
                if !listener.armed || !listener.filters.iter().any(|f| f.matches(ev)) {
                    continue;
                }
                if entry.conn.try_send(RelayMessage::Event { sub_id, event: ev }) {
                    delivered += 1;
                }
            }
        }
        trace!(id = %ev.id, delivered, "fan-out");
        delivered
    }

    /// Distinct filters across all live subscriptions.
    pub fn listening_filters(&self) -> Vec<Filter> {
        let mut out: Vec<Filter> = Vec::new();
        for entry in self.conns.iter() {
            for listener in entry.subs.values() {
                for f in &listener.filters {
                    if !out.iter().any(|seen| seen.equivalent(f)) {
                        out.push(f.clone());
                    }
                }
            }
        }
        out
    }

    pub fn subscription_count(&self) -> usize {
        self.conns.iter().map(|e| e.subs.len()).sum()
    }
}
