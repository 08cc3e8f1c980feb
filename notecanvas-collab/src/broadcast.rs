//! Per-document fan-out and the registry that owns document rooms.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! peer gets an independent receiver that buffers up to `capacity`
//! messages; a peer that falls further behind lags and is told how many
//! messages it missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Fan-out group for one document.
///
/// The sender sees its own broadcasts; filtering is the receiver's job.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Register a peer and subscribe it.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every subscriber. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes. Lock-free.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a lagging receiver never saw.
    pub fn record_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a peer.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}

/// Live rooms keyed by document id.
///
/// Rooms are created with [`open`](Self::open) and torn down with
/// [`close`](Self::close) by whoever manages session lifecycle; nothing is
/// created implicitly on lookup.
pub struct ChannelRegistry<T> {
    rooms: RwLock<HashMap<Uuid, Arc<T>>>,
}

impl<T> Default for ChannelRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ChannelRegistry<T> {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Return the room for `doc_id`, creating it with `make` if absent.
    ///
    /// The boolean is true when this call created the room.
    pub async fn open<F>(&self, doc_id: Uuid, make: F) -> (Arc<T>, bool)
    where
        F: FnOnce() -> T,
    {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return (room.clone(), false);
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&doc_id) {
            return (room.clone(), false);
        }
        let room = Arc::new(make());
        rooms.insert(doc_id, room.clone());
        (room, true)
    }

    pub async fn get(&self, doc_id: &Uuid) -> Option<Arc<T>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove the room; returns it if it was open.
    pub async fn close(&self, doc_id: &Uuid) -> Option<Arc<T>> {
        self.rooms.write().await.remove(doc_id)
    }

    /// Remove the room only if `predicate` holds, checked under the write
    /// lock so no `open` can slip in between.
    pub async fn close_if<P>(&self, doc_id: &Uuid, predicate: P) -> Option<Arc<T>>
    where
        P: FnOnce(&T) -> bool,
    {
        let mut rooms = self.rooms.write().await;
        match rooms.get(doc_id) {
            Some(room) if predicate(room) => rooms.remove(doc_id),
            _ => None,
        }
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }

    pub async fn documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
