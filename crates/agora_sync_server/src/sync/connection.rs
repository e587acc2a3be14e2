use super::{DocRoom, RoomFrame, UpdateIngest};
use agora_core::AgoraError;
use agora_core::crdt::{AuthMessage, ControlMessage, Message, Role, SyncMessage};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// A frame to send back to the client that produced the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Binary(Vec<u8>),
    /// JSON control message
    Text(String),
}

/// Represents a connected client
pub struct ClientConnection {
    pub id: u64,
    pub user_id: Option<String>,
    pub doc_id: String,
    pub role: Role,
    room: Arc<DocRoom>,
    broadcast_rx: broadcast::Receiver<RoomFrame>,
    ingest: UpdateIngest,
    /// A viewer is told once that its writes are dropped
    denial_sent: bool,
}

impl ClientConnection {
    /// Create a connection on a room already subscribed to via
    /// [`SyncState::join_room`](super::SyncState::join_room).
    pub fn new(
        id: u64,
        user_id: Option<String>,
        role: Role,
        room: Arc<DocRoom>,
        broadcast_rx: broadcast::Receiver<RoomFrame>,
        ingest: UpdateIngest,
    ) -> Self {
        Self {
            id,
            user_id,
            doc_id: room.doc_id().to_string(),
            role,
            room,
            broadcast_rx,
            ingest,
            denial_sent: false,
        }
    }

    /// Frames sent right after the upgrade: stored state, then presence.
    pub fn initial_sync(&self) -> Result<Vec<Vec<u8>>, AgoraError> {
        let mut frames = self.ingest.join_frames(&self.doc_id)?;
        if let Some(presence) = self.room.awareness_snapshot()? {
            frames.push(Message::Awareness(presence).encode());
        }
        Ok(frames)
    }

    /// Handle an incoming binary frame, returning any direct replies.
    pub fn handle_message(&mut self, data: &[u8]) -> Vec<Outgoing> {
        let message = match Message::decode(data) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Ignoring empty or unknown frame from connection {}", self.id);
                return Vec::new();
            }
            Err(e) => {
                warn!("Malformed frame from connection {}: {}", self.id, e);
                return Vec::new();
            }
        };

        match message {
            Message::Sync(SyncMessage::SyncStep1(state_vector)) => {
                match self.ingest.answer_step1(&self.doc_id, &state_vector) {
                    Ok(reply) => vec![Outgoing::Binary(reply)],
                    Err(e) => {
                        error!("Failed to answer sync step 1 for {}: {}", self.doc_id, e);
                        Vec::new()
                    }
                }
            }
            Message::Sync(SyncMessage::SyncStep2(update) | SyncMessage::Update(update)) => {
                self.handle_update(update)
            }
            Message::Awareness(update) => {
                match self.room.apply_awareness(self.id, &update) {
                    Ok(()) => self.room.broadcast(self.id, data.to_vec()),
                    Err(e) => warn!("Invalid awareness update from connection {}: {}", self.id, e),
                }
                Vec::new()
            }
            Message::QueryAwareness => match self.room.awareness_snapshot() {
                Ok(Some(presence)) => vec![Outgoing::Binary(Message::Awareness(presence).encode())],
                Ok(None) => Vec::new(),
                Err(e) => {
                    warn!("Failed to encode presence for {}: {}", self.doc_id, e);
                    Vec::new()
                }
            },
            Message::Auth(_) => {
                debug!("Ignoring auth frame from connection {}", self.id);
                Vec::new()
            }
        }
    }

    fn handle_update(&mut self, update: Vec<u8>) -> Vec<Outgoing> {
        if update.is_empty() {
            return Vec::new();
        }

        if !self.role.can_write() {
            debug!(
                "Dropping update from read-only connection {} on {}",
                self.id, self.doc_id
            );
            if self.denial_sent {
                return Vec::new();
            }
            self.denial_sent = true;
            let denied = Message::Auth(AuthMessage::PermissionDenied {
                reason: format!("{} access is read-only", self.role.as_str()),
            });
            return vec![Outgoing::Binary(denied.encode())];
        }

        match self
            .ingest
            .ingest(&self.doc_id, &update, self.user_id.as_deref())
        {
            Ok(record) => {
                debug!(
                    "Stored update {} ({} bytes) for {}",
                    record.id,
                    update.len(),
                    self.doc_id
                );
                self.room
                    .broadcast(self.id, SyncMessage::Update(update).encode());
                Vec::new()
            }
            Err(AgoraError::PayloadTooLarge { size, max }) => {
                warn!(
                    "Rejected {} byte update (limit {}) on {}",
                    size, max, self.doc_id
                );
                match ControlMessage::payload_too_large().to_json() {
                    Ok(json) => vec![Outgoing::Text(json)],
                    Err(e) => {
                        error!("Failed to encode rejection: {}", e);
                        Vec::new()
                    }
                }
            }
            Err(e) if e.is_data_error() => {
                warn!("Rejected invalid update on {}: {}", self.doc_id, e);
                Vec::new()
            }
            Err(e) => {
                error!("Failed to persist update for {}: {}", self.doc_id, e);
                Vec::new()
            }
        }
    }

    /// Receive the next frame from other connections
    pub async fn recv_broadcast(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.broadcast_rx.recv().await {
                Ok(frame) if frame.sender == self.id => continue,
                Ok(frame) => return Some(frame.data),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "Connection {} lagged {} frames, sending full state",
                        self.id, n
                    );
                    match self.ingest.full_state(&self.doc_id) {
                        Ok(state) => return Some(state),
                        Err(e) => error!("Failed to load state for {}: {}", self.doc_id, e),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(removal) = self.room.release_presence(self.id) {
            self.room
                .broadcast(self.id, Message::Awareness(removal).encode());
        }
        self.room.unsubscribe();
        debug!(
            "Client disconnected: connection={}, doc={}",
            self.id, self.doc_id
        );
    }
}
