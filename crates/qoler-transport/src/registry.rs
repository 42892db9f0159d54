//! Connection registry and envelope fan-out.
//!
//! The registry is keyed by identity, not by socket: at most one live handle
//! per identity. A newer registration supersedes the older one and the older
//! socket is closed explicitly with [`CLOSE_SUPERSEDED`].
//!
//! Sends are non-blocking pushes onto each connection's bounded outbound
//! queue, drained by that connection's own task. A full or closed queue is
//! logged and skipped; it never holds up delivery to anyone else.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use qoler_protocol::BroadcastEnvelope;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// WebSocket close code: endpoint going away (server shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// WebSocket close code: policy violation (bad credentials).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Application close code: identity reconnected elsewhere.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Default per-connection outbound queue depth.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Why the server is closing a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self { code, reason: reason.into() }
    }

    pub fn going_away() -> Self {
        Self::new(CLOSE_GOING_AWAY, "Server shutting down")
    }

    pub fn superseded() -> Self {
        Self::new(CLOSE_SUPERSEDED, "Superseded by a newer connection")
    }
}

/// Server-side handle to one live socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    frames: mpsc::Sender<Arc<str>>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

/// The receiving half owned by the connection task.
#[derive(Debug)]
pub struct ConnectionOutlet {
    pub frames: mpsc::Receiver<Arc<str>>,
    pub close: watch::Receiver<Option<CloseReason>>,
}

impl ConnectionHandle {
    pub fn new(queue: usize) -> (Self, ConnectionOutlet) {
        let (frames_tx, frames_rx) = mpsc::channel(queue.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Self {
            id: Uuid::new_v4(),
            frames: frames_tx,
            close: Arc::new(close_tx),
        };
        (handle, ConnectionOutlet { frames: frames_rx, close: close_rx })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a serialized frame without waiting. Returns false if the
    /// queue is full or the connection is gone.
    pub fn send(&self, frame: Arc<str>) -> bool {
        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn_id = %self.id, "outbound queue full, dropping frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(conn_id = %self.id, "connection gone, dropping frame");
                false
            }
        }
    }

    /// Ask the connection task to close the socket.
    pub fn close(&self, reason: CloseReason) {
        self.close.send_replace(Some(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.frames.is_closed()
    }
}

/// A registered, authenticated connection.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    pub identity: String,
    pub handle: ConnectionHandle,
    pub connected_at: DateTime<Utc>,
}

/// Per-call delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Live authenticated connections, keyed by identity.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<String, ConnectionEntry>>,
    /// Set by [`ConnectionRegistry::close_all`]; later registrations are
    /// closed with this reason instead of being inserted.
    closed: Mutex<Option<CloseReason>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `identity` and broadcast presence.
    ///
    /// Returns the superseded handle, which has already been told to close.
    /// After [`close_all`](Self::close_all) the handle is closed right away
    /// and nothing is inserted.
    pub fn register(&self, identity: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut entries = self.entries.write();
        if let Some(reason) = self.closed.lock().clone() {
            debug!(identity, conn_id = %handle.id(), "registry closed, refusing connection");
            handle.close(reason);
            return None;
        }
        let entry = ConnectionEntry {
            identity: identity.to_string(),
            handle: handle.clone(),
            connected_at: Utc::now(),
        };
        let previous = entries.insert(identity.to_string(), entry).map(|e| e.handle);
        if let Some(old) = &previous {
            if old.id() != handle.id() {
                info!(identity, old = %old.id(), new = %handle.id(), "connection superseded");
                old.close(CloseReason::superseded());
            }
        }
        info!(identity, conn_id = %handle.id(), online = entries.len(), "connection registered");
        Self::publish_presence(&entries);
        previous
    }

    /// Remove `identity` only if it is still bound to `handle_id`.
    ///
    /// A late close from an already superseded socket leaves the newer
    /// entry in place and returns false.
    pub fn unregister(&self, identity: &str, handle_id: Uuid) -> bool {
        let mut entries = self.entries.write();
        let matches = entries
            .get(identity)
            .is_some_and(|entry| entry.handle.id() == handle_id);
        if !matches {
            debug!(identity, conn_id = %handle_id, "stale unregister ignored");
            return false;
        }
        entries.remove(identity);
        info!(identity, conn_id = %handle_id, online = entries.len(), "connection unregistered");
        Self::publish_presence(&entries);
        true
    }

    /// Deliver to every registered connection.
    pub fn broadcast(&self, envelope: &BroadcastEnvelope) -> Delivery {
        let Some(frame) = serialize(envelope) else {
            return Delivery::default();
        };
        let entries = self.entries.read();
        let delivery = deliver(entries.values(), &frame);
        debug!(kind = envelope.kind(), delivered = delivery.delivered, failed = delivery.failed, "broadcast");
        delivery
    }

    /// Deliver only to the given identities that are currently connected.
    /// Offline identities are skipped, not queued.
    pub fn notify<I, S>(&self, identities: I, envelope: &BroadcastEnvelope) -> Delivery
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let Some(frame) = serialize(envelope) else {
            return Delivery::default();
        };
        let entries = self.entries.read();
        let mut targets: Vec<&ConnectionEntry> = Vec::new();
        for identity in identities {
            if let Some(entry) = entries.get(identity.as_ref()) {
                if !targets.iter().any(|t| t.handle.id() == entry.handle.id()) {
                    targets.push(entry);
                }
            }
        }
        let delivery = deliver(targets.into_iter(), &frame);
        debug!(kind = envelope.kind(), delivered = delivery.delivered, "notify");
        delivery
    }

    /// Sorted identities with a live registered handle.
    pub fn presence(&self) -> Vec<String> {
        sorted_identities(&self.entries.read())
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }

    /// Drop every entry and tell each socket to close. Returns how many
    /// connections were closed. No presence update is sent: nobody is left
    /// to receive it. The registry stays closed afterwards.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        *self.closed.lock() = Some(reason.clone());
        let drained: Vec<ConnectionEntry> = self.entries.write().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.handle.close(reason.clone());
        }
        if !drained.is_empty() {
            info!(count = drained.len(), code = reason.code, "closed all connections");
        }
        drained.len()
    }

    fn publish_presence(entries: &HashMap<String, ConnectionEntry>) {
        let envelope = BroadcastEnvelope::UserListUpdate { data: sorted_identities(entries) };
        if let Some(frame) = serialize(&envelope) {
            deliver(entries.values(), &frame);
        }
    }
}

fn sorted_identities(entries: &HashMap<String, ConnectionEntry>) -> Vec<String> {
    let mut identities: Vec<String> = entries.keys().cloned().collect();
    identities.sort();
    identities
}

fn serialize(envelope: &BroadcastEnvelope) -> Option<Arc<str>> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(kind = envelope.kind(), error = %e, "failed to serialize envelope");
            None
        }
    }
}

fn deliver<'a>(entries: impl Iterator<Item = &'a ConnectionEntry>, frame: &Arc<str>) -> Delivery {
    let mut delivery = Delivery::default();
    for entry in entries {
        if entry.handle.send(Arc::clone(frame)) {
            delivery.delivered += 1;
        } else {
            delivery.failed += 1;
        }
    }
    delivery
}
