//! Broadcast Hub
//!
//! Registry of live WebSocket connections and fan-out delivery to them.
//!
//! Each connection is represented by the sending half of its bounded
//! outbound queue; a per-connection writer task owns the socket. Delivery is
//! a non-blocking enqueue, so the connection set lock is never held while
//! waiting on a peer. A recipient whose queue is closed or full is dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::network::protocol::Envelope;

/// Hub-assigned connection identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frame queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// JSON text frame. Shared across recipients of one broadcast.
    Text(Arc<str>),
    /// Liveness ping.
    Ping,
}

struct ConnectionEntry {
    identity: Option<String>,
    sender: mpsc::Sender<Outbound>,
    connected_at: Instant,
}

/// The set of live connections.
pub struct BroadcastHub {
    connections: RwLock<BTreeMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a connection with no identity bound.
    pub async fn register(&self, sender: mpsc::Sender<Outbound>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.write().await.insert(id, ConnectionEntry {
            identity: None,
            sender,
            connected_at: Instant::now(),
        });
        debug!("Registered {}", id);
        id
    }

    /// Bind an identity to a registered connection. Last writer wins.
    pub async fn associate(&self, id: ConnectionId, identity: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(&id) {
            Some(entry) => {
                entry.identity = Some(identity.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove a connection. Returns false if it was already gone.
    pub async fn deregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections.write().await.remove(&id);
        match removed {
            Some(entry) => {
                debug!("Deregistered {} after {:?}", id, entry.connected_at.elapsed());
                true
            }
            None => false,
        }
    }

    /// Time since the connection was registered.
    pub async fn connected_for(&self, id: ConnectionId) -> Option<Duration> {
        self.connections.read().await.get(&id).map(|e| e.connected_at.elapsed())
    }

    /// Identity bound to a connection.
    pub async fn identity_of(&self, id: ConnectionId) -> Option<String> {
        self.connections.read().await.get(&id).and_then(|e| e.identity.clone())
    }

    /// Identities of every authenticated connection, deduplicated and sorted.
    pub async fn connected_identities(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut names: Vec<String> = connections
            .values()
            .filter_map(|e| e.identity.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Serialize once and deliver to every connection.
    ///
    /// Returns the number of connections the frame was queued for.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        match envelope.to_json() {
            Ok(text) => self.broadcast_raw(text).await,
            Err(e) => {
                error!("Failed to serialize broadcast: {}", e);
                0
            }
        }
    }

    /// Deliver pre-serialized text to every connection.
    pub async fn broadcast_raw(&self, text: impl Into<Arc<str>>) -> usize {
        let recipients: Vec<_> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .map(|(id, e)| (*id, e.sender.clone()))
                .collect()
        };

        self.deliver(recipients, Outbound::Text(text.into())).await
    }

    /// Deliver to a single connection.
    pub async fn send_to(&self, id: ConnectionId, envelope: &Envelope) -> bool {
        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize message for {}: {}", id, e);
                return false;
            }
        };
        self.send_frame(id, Outbound::Text(text.into())).await
    }

    /// Queue a raw frame (text or ping) for a single connection.
    pub async fn send_frame(&self, id: ConnectionId, frame: Outbound) -> bool {
        let sender = match self.connections.read().await.get(&id) {
            Some(entry) => entry.sender.clone(),
            None => return false,
        };

        self.deliver(vec![(id, sender)], frame).await == 1
    }

    /// Enqueue `frame` for each recipient outside any lock, then drop the
    /// ones that could not take it in one short write section.
    async fn deliver(
        &self,
        recipients: Vec<(ConnectionId, mpsc::Sender<Outbound>)>,
        frame: Outbound,
    ) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for (id, sender) in recipients {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Outbound queue full for {}, dropping connection", id);
                    failed.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Connection {} closed during delivery", id);
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut connections = self.connections.write().await;
            for id in failed {
                if let Some(entry) = connections.remove(&id) {
                    debug!("Dropped {} after {:?}", id, entry.connected_at.elapsed());
                }
            }
        }

        delivered
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
