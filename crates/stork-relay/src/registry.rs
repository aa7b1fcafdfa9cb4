//! Identity → live connection registry.
//!
//! The registry is the relay's only state. It is owned by [`crate::api::AppState`]
//! and mutated exclusively through the methods below, each of which holds
//! the lock for a single lookup/mutation sequence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use stork_shared::PeerId;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

pub type ConnectionId = u64;

/// Outbound side of one client connection: frames pushed here are written
/// to the socket by that connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// True while the connection's writer is still draining its queue.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queue a text frame. Returns `false` if the connection is gone.
    pub fn deliver(&self, text: String) -> bool {
        self.tx.send(text).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    entries: Mutex<HashMap<PeerId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Insert or replace the entry for `peer`.
    ///
    /// Returns the id of the connection that previously held the identity,
    /// if it was a different connection. That connection is not notified;
    /// it stays orphaned until it closes on its own.
    pub async fn register(&self, peer: PeerId, handle: ConnectionHandle) -> Option<ConnectionId> {
        let mut entries = self.entries.lock().await;
        let new_id = handle.id();
        let replaced = entries
            .insert(peer.clone(), handle)
            .map(|old| old.id())
            .filter(|old_id| *old_id != new_id);

        if let Some(old_id) = replaced {
            warn!(
                peer = %peer,
                old_connection = old_id,
                new_connection = new_id,
                "Identity re-registered on another connection, previous connection orphaned"
            );
        } else {
            debug!(peer = %peer, connection = new_id, "Peer registered");
        }

        replaced
    }

    /// Routable handle for `peer`, if one is registered and still open.
    pub async fn lookup(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        let entries = self.entries.lock().await;
        entries.get(peer).filter(|h| h.is_open()).cloned()
    }

    /// Remove `peer`'s entry if it still belongs to `connection`.
    pub async fn remove_connection(&self, peer: &PeerId, connection: ConnectionId) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(peer) {
            Some(handle) if handle.id() == connection => {
                entries.remove(peer);
                debug!(peer = %peer, connection, "Peer unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
