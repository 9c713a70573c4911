//! Fan-out of relayed frames to every connection in a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each connection gets an independent receiver that buffers up to
//! `capacity` messages; slow readers lag and lose the oldest ones.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::Frame;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// A frame relayed within a room, tagged with the connection it came from
/// so that it is not echoed back.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub sender: Uuid,
    pub frame: Frame,
}

/// Counters updated on the hot path without taking a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// One room's broadcast channel and its connections.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RoomMessage>>,
    peers: Arc<RwLock<HashMap<Uuid, SocketAddr>>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register a connection. Returns its receiver.
    pub async fn add_peer(
        &self,
        conn_id: Uuid,
        addr: SocketAddr,
    ) -> broadcast::Receiver<Arc<RoomMessage>> {
        self.peers.write().await.insert(conn_id, addr);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, conn_id: &Uuid) -> Option<SocketAddr> {
        self.peers.write().await.remove(conn_id)
    }

    /// Send `frame` to every receiver. Filtering out the sender is the
    /// receiving side's job. Returns the number of receivers reached.
    pub fn broadcast(&self, sender: Uuid, frame: Frame) -> usize {
        let count = self
            .sender
            .send(Arc::new(RoomMessage { sender, frame }))
            .unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Note messages a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
