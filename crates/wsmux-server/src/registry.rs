//! Live set of open connections.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use metrics::counter;
use tracing::{debug, warn};
use wsmux_core::ConnectionId;

use crate::connection::{Connection, Message};
use crate::error::SendError;

/// Connections tracked by one manager, keyed by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    /// Tracked connections plus outstanding reservations.
    slots: AtomicUsize,
}

/// Room for one connection, held between admission and insert.
///
/// Dropping it without [`insert`](Self::insert) gives the slot back.
#[must_use = "dropping a reservation releases the slot"]
pub struct Reservation<'a> {
    registry: &'a ConnectionRegistry,
    used: bool,
}

impl Reservation<'_> {
    /// Track `connection` in the reserved slot.
    pub fn insert(mut self, connection: Arc<Connection>) {
        self.used = true;
        self.registry.track(connection);
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.used {
            let _ = self.registry.slots.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection regardless of capacity.
    pub fn insert(&self, connection: Arc<Connection>) {
        let _ = self.slots.fetch_add(1, Ordering::SeqCst);
        self.track(connection);
    }

    /// Reserve a slot if fewer than `max` connections are tracked or reserved.
    ///
    /// Check and claim are one atomic step, so concurrent admissions cannot
    /// overshoot `max`.
    pub fn try_reserve(&self, max: usize) -> Option<Reservation<'_>> {
        self.slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .ok()
            .map(|_| Reservation {
                registry: self,
                used: false,
            })
    }

    fn track(&self, connection: Arc<Connection>) {
        if self
            .connections
            .insert(connection.id().clone(), connection)
            .is_some()
        {
            // Same id re-inserted: it already held a slot.
            let _ = self.slots.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Stop tracking a connection. Returns it if it was tracked.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        let removed = self.connections.remove(id).map(|(_, conn)| conn);
        if removed.is_some() {
            let _ = self.slots.fetch_sub(1, Ordering::SeqCst);
        }
        removed
    }

    /// Look up a tracked connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `id` is tracked.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Point-in-time copy of the tracked connections.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Send `message` to every tracked connection that is still open.
    ///
    /// Never fails as a whole; per-connection outcomes are in the report.
    pub fn broadcast(&self, message: &Message) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for conn in self.snapshot() {
            if !conn.is_open() {
                report.skipped.push(conn.id().clone());
                continue;
            }
            match conn.send(message.clone()) {
                Ok(()) => report.delivered.push(conn.id().clone()),
                Err(error) => {
                    warn!(conn_id = %conn.id(), %error, "failed to send broadcast to connection");
                    counter!("ws_broadcast_failures_total").increment(1);
                    report.failed.push((conn.id().clone(), error));
                }
            }
        }
        debug!(
            kind = message.kind(),
            delivered = report.delivered.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "broadcast"
        );
        report
    }
}

/// Per-connection outcome of a broadcast.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the message was queued for.
    pub delivered: Vec<ConnectionId>,
    /// Tracked connections that were already closing or closed.
    pub skipped: Vec<ConnectionId>,
    /// Open connections whose send was refused.
    pub failed: Vec<(ConnectionId, SendError)>,
}

impl BroadcastReport {
    /// Number of connections the message was queued for.
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Whether every open connection received the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
