use agora_core::AgoraError;
use agora_core::config::DEFAULT_PRESENCE_TIMEOUT_MS;
use agora_core::presence::{Awareness, AwarenessProvider};
use agora_core::presence::awareness::update_client_ids;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

/// Frames buffered per subscriber before it starts lagging
const BROADCAST_CAPACITY: usize = 1024;

/// Awareness client id of the relay itself; it never publishes a state
const RELAY_CLIENT_ID: u64 = 0;

/// A frame fanned out to the connections of a room.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    /// Connection that produced the frame; it is not echoed back there
    pub sender: u64,
    pub data: Vec<u8>,
}

/// Statistics about the sync state
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Global sync state managing all rooms
pub struct SyncState {
    /// Map of document id to room
    rooms: RwLock<HashMap<String, Arc<DocRoom>>>,
    next_connection_id: AtomicU64,
    presence_timeout: Duration,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(0),
            presence_timeout: Duration::from_millis(DEFAULT_PRESENCE_TIMEOUT_MS),
        }
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Age after which a room forgets presence that was never renewed.
    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }

    /// Allocate an id for a new connection
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get or create the room of a document and subscribe to it.
    ///
    /// Subscribing under the map lock keeps [`SyncState::maybe_remove_room`]
    /// from dropping a room a connection is about to join.
    pub async fn join_room(&self, doc_id: &str) -> (Arc<DocRoom>, broadcast::Receiver<RoomFrame>) {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                let rx = room.subscribe();
                return (room.clone(), rx);
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring write lock
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| {
                info!("Created sync room for document: {}", doc_id);
                Arc::new(DocRoom::new(doc_id).with_presence_timeout(self.presence_timeout))
            })
            .clone();
        let rx = room.subscribe();

        (room, rx)
    }

    pub async fn get_room(&self, doc_id: &str) -> Option<Arc<DocRoom>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Remove a room if it has no active connections
    pub async fn maybe_remove_room(&self, doc_id: &str) {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(doc_id) {
            if room.connection_count() == 0 {
                rooms.remove(doc_id);
                info!("Removed idle sync room: {}", doc_id);
            }
        }
    }

    /// Get statistics about the sync state
    pub async fn get_stats(&self) -> SyncStats {
        let rooms = self.rooms.read().await;
        SyncStats {
            active_connections: rooms.values().map(|r| r.connection_count()).sum(),
            active_rooms: rooms.len(),
        }
    }
}

/// Live state of one document's connections.
///
/// Document content is not held here; every joiner is served from the
/// update log. The room only fans out frames and caches presence.
pub struct DocRoom {
    doc_id: String,
    broadcast_tx: broadcast::Sender<RoomFrame>,
    connection_count: AtomicUsize,
    /// Relay copy of every connected client's presence
    awareness: Awareness,
    /// Awareness client ids announced by each connection
    presence_clients: Mutex<HashMap<u64, HashSet<u64>>>,
    presence_timeout: Duration,
}

impl DocRoom {
    pub fn new(doc_id: &str) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            doc_id: doc_id.to_string(),
            broadcast_tx,
            connection_count: AtomicUsize::new(0),
            awareness: Awareness::new(RELAY_CLIENT_ID),
            presence_clients: Mutex::new(HashMap::new()),
            presence_timeout: Duration::from_millis(DEFAULT_PRESENCE_TIMEOUT_MS),
        }
    }

    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Subscribe to room frames
    pub fn subscribe(&self) -> broadcast::Receiver<RoomFrame> {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.broadcast_tx.subscribe()
    }

    /// Unsubscribe from room frames
    pub fn unsubscribe(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Send a frame to every connection except `sender`
    pub fn broadcast(&self, sender: u64, data: Vec<u8>) {
        // No receivers is fine: the sender may be alone in the room
        let _ = self.broadcast_tx.send(RoomFrame { sender, data });
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    /// Merge a presence update sent by `connection_id` into the relay copy.
    pub fn apply_awareness(&self, connection_id: u64, update: &[u8]) -> Result<(), AgoraError> {
        self.awareness.apply_update(update)?;
        let ids = update_client_ids(update);
        if !ids.is_empty() {
            self.presence_clients
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(connection_id)
                .or_default()
                .extend(ids);
        }
        Ok(())
    }

    /// Encoded presence of everyone currently in the room, if anyone.
    ///
    /// States not renewed within the presence timeout are swept first.
    pub fn awareness_snapshot(&self) -> Result<Option<Vec<u8>>, AgoraError> {
        let swept = self.awareness.remove_outdated(self.presence_timeout);
        if !swept.is_empty() {
            debug!(
                "Swept outdated presence of clients {:?} in {}",
                swept.removed, self.doc_id
            );
        }
        if self.awareness.states().is_none_or(|states| states.is_empty()) {
            return Ok(None);
        }
        self.awareness.encode_full_update().map(Some)
    }

    /// Drop the presence a connection announced.
    ///
    /// Returns the encoded removal update to broadcast, if any state was
    /// actually removed.
    pub fn release_presence(&self, connection_id: u64) -> Option<Vec<u8>> {
        let ids: Vec<u64> = self
            .presence_clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id)?
            .into_iter()
            .collect();

        let change = self.awareness.remove_states(&ids);
        if change.removed.is_empty() {
            return None;
        }
        debug!(
            "Released presence of clients {:?} in {}",
            change.removed, self.doc_id
        );
        self.awareness.encode_update(&change.removed).ok()
    }
}
