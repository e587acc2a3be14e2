//! Y-sync wire protocol.
//!
//! This module provides the framing shared by the sync server and the native
//! client: sync messages carrying CRDT state, awareness messages carrying
//! presence, and auth messages carrying a permission-denied reason.
//!
//! # Protocol Overview
//!
//! The Y-sync protocol uses a two-phase handshake:
//!
//! 1. **SyncStep1**: Peer sends its state vector
//! 2. **SyncStep2**: Other side responds with missing updates
//!
//! After the handshake, updates are exchanged bidirectionally.
//!
//! # Wire Format (y-protocols compatible)
//!
//! Messages use varUint encoding (variable-length unsigned integers):
//! - `varUint(0)`: Sync message type
//!   - `varUint(0)`: SyncStep1 - contains state vector
//!   - `varUint(1)`: SyncStep2 - contains missing updates
//!   - `varUint(2)`: Update - contains incremental update
//! - `varUint(1)`: Awareness message - contains an awareness update
//! - `varUint(2)`: Auth message
//!   - `varUint(0)`: PermissionDenied - contains a reason string
//! - `varUint(3)`: Query awareness (no payload)
//!
//! Byte arrays are encoded as: `varUint(length) + raw bytes`

use serde::{Deserialize, Serialize};

use super::graph_doc::GraphDoc;
use super::storage::StorageResult;
use crate::error::AgoraError;

// ===========================================================================
// VarUint encoding/decoding (y-protocols compatible)
// ===========================================================================

/// Write a variable-length unsigned integer to a buffer.
/// Uses 7 bits per byte, with MSB indicating continuation.
pub(crate) fn write_var_uint(buf: &mut Vec<u8>, mut num: u64) {
    loop {
        let mut byte = (num & 0x7F) as u8;
        num >>= 7;
        if num > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if num == 0 {
            break;
        }
    }
}

/// Read a variable-length unsigned integer from a buffer.
/// Returns (value, bytes_consumed) or None if buffer is too short.
pub(crate) fn read_var_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut num: u64 = 0;
    let mut shift = 0;
    for (i, &byte) in data.iter().enumerate() {
        num |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((num, i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None; // Overflow
        }
    }
    None // Incomplete
}

/// Write a byte array with length prefix (varUint encoding).
pub(crate) fn write_var_byte_array(buf: &mut Vec<u8>, data: &[u8]) {
    write_var_uint(buf, data.len() as u64);
    buf.extend_from_slice(data);
}

/// Read a byte array with length prefix.
/// Returns (data, bytes_consumed) or None if buffer is too short.
pub(crate) fn read_var_byte_array(data: &[u8]) -> Option<(Vec<u8>, usize)> {
    let (len, len_bytes) = read_var_uint(data)?;
    let total = len_bytes.checked_add(usize::try_from(len).ok()?)?;
    if data.len() < total {
        return None;
    }
    Some((data[len_bytes..total].to_vec(), total))
}

/// Write a UTF-8 string with length prefix.
pub(crate) fn write_var_string(buf: &mut Vec<u8>, value: &str) {
    write_var_byte_array(buf, value.as_bytes());
}

/// Read a UTF-8 string with length prefix.
pub(crate) fn read_var_string(data: &[u8]) -> Option<(String, usize)> {
    let (bytes, consumed) = read_var_byte_array(data)?;
    let value = String::from_utf8(bytes).ok()?;
    Some((value, consumed))
}

/// Message type bytes for the Y-sync protocol.
pub mod msg_type {
    /// Sync message (SyncStep1, SyncStep2, Update)
    pub const SYNC: u8 = 0;
    /// Awareness message
    pub const AWARENESS: u8 = 1;
    /// Auth message
    pub const AUTH: u8 = 2;
    /// Request for the peer's full awareness state
    pub const QUERY_AWARENESS: u8 = 3;
}

/// Sync sub-message types.
pub mod sync_type {
    /// SyncStep1: Initial state vector exchange
    pub const STEP1: u8 = 0;
    /// SyncStep2: Missing updates response
    pub const STEP2: u8 = 1;
    /// Update: Incremental update
    pub const UPDATE: u8 = 2;
}

mod auth_type {
    pub const PERMISSION_DENIED: u8 = 0;
}

/// Y-sync message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// SyncStep1 contains a state vector
    SyncStep1(Vec<u8>),
    /// SyncStep2 contains missing updates
    SyncStep2(Vec<u8>),
    /// Update contains an incremental update
    Update(Vec<u8>),
}

impl SyncMessage {
    /// Encode the message to bytes using y-protocols compatible format.
    /// Format: varUint(msgType) + varUint(syncType) + varByteArray(payload)
    pub fn encode(&self) -> Vec<u8> {
        let (sub_type, payload) = match self {
            SyncMessage::SyncStep1(sv) => (sync_type::STEP1, sv),
            SyncMessage::SyncStep2(update) => (sync_type::STEP2, update),
            SyncMessage::Update(update) => (sync_type::UPDATE, update),
        };
        log::trace!(
            "[Y-sync] Encoding {}, {} bytes",
            self.name(),
            payload.len()
        );

        let mut buf = Vec::with_capacity(2 + payload.len() + 5);
        write_var_uint(&mut buf, msg_type::SYNC as u64);
        write_var_uint(&mut buf, sub_type as u64);
        write_var_byte_array(&mut buf, payload);
        buf
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncMessage::SyncStep1(_) => "SyncStep1",
            SyncMessage::SyncStep2(_) => "SyncStep2",
            SyncMessage::Update(_) => "Update",
        }
    }

    /// CRDT update carried by this message, if any.
    pub fn update_payload(&self) -> Option<&[u8]> {
        match self {
            SyncMessage::SyncStep1(_) => None,
            SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                Some(update.as_slice())
            }
        }
    }

    /// Decode a message from bytes using y-protocols compatible format.
    /// Returns None for empty, incomplete, or non-sync messages.
    pub fn decode(data: &[u8]) -> StorageResult<Option<Self>> {
        match Message::decode(data)? {
            Some(Message::Sync(msg)) => Ok(Some(msg)),
            _ => Ok(None),
        }
    }

    /// Decode a sync sub-message (sync_type + payload) without the message type prefix.
    /// Returns (Option<message>, bytes_consumed).
    fn decode_sub_message(data: &[u8]) -> StorageResult<(Option<Self>, usize)> {
        let Some((sync_type_val, sync_type_bytes)) = read_var_uint(data) else {
            return Ok((None, 0)); // Incomplete message
        };

        let Some((payload, payload_bytes)) = read_var_byte_array(&data[sync_type_bytes..]) else {
            log::debug!("[Y-sync] Incomplete payload");
            return Ok((None, 0));
        };

        let msg = match u8::try_from(sync_type_val) {
            Ok(sync_type::STEP1) => SyncMessage::SyncStep1(payload),
            Ok(sync_type::STEP2) => SyncMessage::SyncStep2(payload),
            Ok(sync_type::UPDATE) => SyncMessage::Update(payload),
            _ => {
                return Err(AgoraError::Crdt(format!(
                    "Unknown sync type: {}",
                    sync_type_val
                )));
            }
        };

        Ok((Some(msg), sync_type_bytes + payload_bytes))
    }

    /// Decode ALL sub-messages from a combined Sync message.
    ///
    /// Some peers send several sub-messages (e.g. SyncStep2 + SyncStep1) in
    /// one frame.
    pub fn decode_all(data: &[u8]) -> StorageResult<Vec<Self>> {
        let mut messages = Vec::new();

        let Some((msg_type_val, msg_type_bytes)) = read_var_uint(data) else {
            return Ok(messages);
        };
        if msg_type_val != msg_type::SYNC as u64 {
            return Ok(messages);
        }

        let mut offset = msg_type_bytes;
        while offset < data.len() {
            let (msg, consumed) = Self::decode_sub_message(&data[offset..])?;
            if consumed == 0 {
                break;
            }
            if let Some(m) = msg {
                messages.push(m);
            }
            offset += consumed;
        }

        Ok(messages)
    }
}

/// Auth sub-messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    PermissionDenied { reason: String },
}

/// Any frame on the sync channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded awareness update (see [`crate::presence::awareness`])
    Awareness(Vec<u8>),
    Auth(AuthMessage),
    QueryAwareness,
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Sync(msg) => msg.encode(),
            Message::Awareness(update) => {
                let mut buf = Vec::with_capacity(1 + update.len() + 5);
                write_var_uint(&mut buf, msg_type::AWARENESS as u64);
                write_var_byte_array(&mut buf, update);
                buf
            }
            Message::Auth(AuthMessage::PermissionDenied { reason }) => {
                let mut buf = Vec::with_capacity(2 + reason.len() + 5);
                write_var_uint(&mut buf, msg_type::AUTH as u64);
                write_var_uint(&mut buf, auth_type::PERMISSION_DENIED as u64);
                write_var_string(&mut buf, reason);
                buf
            }
            Message::QueryAwareness => vec![msg_type::QUERY_AWARENESS],
        }
    }

    /// Decode one frame. Returns None for empty or incomplete frames.
    pub fn decode(data: &[u8]) -> StorageResult<Option<Self>> {
        let Some((msg_type_val, msg_type_bytes)) = read_var_uint(data) else {
            return Ok(None);
        };
        let rest = &data[msg_type_bytes..];

        let msg = match u8::try_from(msg_type_val) {
            Ok(msg_type::SYNC) => SyncMessage::decode_sub_message(rest)?.0.map(Message::Sync),
            Ok(msg_type::AWARENESS) => {
                read_var_byte_array(rest).map(|(update, _)| Message::Awareness(update))
            }
            Ok(msg_type::AUTH) => match read_var_uint(rest) {
                Some((sub, sub_bytes)) if sub == auth_type::PERMISSION_DENIED as u64 => {
                    read_var_string(&rest[sub_bytes..]).map(|(reason, _)| {
                        Message::Auth(AuthMessage::PermissionDenied { reason })
                    })
                }
                Some((sub, _)) => {
                    return Err(AgoraError::Crdt(format!("Unknown auth type: {}", sub)));
                }
                None => None,
            },
            Ok(msg_type::QUERY_AWARENESS) => Some(Message::QueryAwareness),
            _ => {
                return Err(AgoraError::Crdt(format!(
                    "Unknown message type: {}",
                    msg_type_val
                )));
            }
        };
        Ok(msg)
    }
}

/// Reason sent when an update exceeds the size cap.
pub const REJECT_PAYLOAD_TOO_LARGE: &str = "payload_too_large";

/// JSON control frames, sent as WebSocket text messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// The server refused to persist an update
    UpdateRejected { reason: String },
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    pub fn payload_too_large() -> Self {
        ControlMessage::UpdateRejected {
            reason: REJECT_PAYLOAD_TOO_LARGE.to_string(),
        }
    }

    pub fn to_json(&self) -> StorageResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame. Unrecognized JSON yields `Unknown`.
    pub fn parse(text: &str) -> StorageResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Sync protocol handler for a graph document.
///
/// Remote payloads are applied with the remote origin so local observers
/// (undo, outgoing forwarders) can ignore them.
pub struct SyncProtocol<'a> {
    doc: &'a GraphDoc,
}

impl<'a> SyncProtocol<'a> {
    pub fn new(doc: &'a GraphDoc) -> Self {
        Self { doc }
    }

    /// Create a SyncStep1 message containing the local state vector.
    pub fn create_sync_step1(&self) -> Vec<u8> {
        SyncMessage::SyncStep1(self.doc.encode_state_vector()).encode()
    }

    /// Create a SyncStep1 with an empty state vector, asking for everything.
    pub fn create_full_request(&self) -> Vec<u8> {
        SyncMessage::SyncStep1(Vec::new()).encode()
    }

    /// Create a SyncStep2 message with updates the remote peer is missing.
    pub fn create_sync_step2(&self, remote_state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        let diff = self.doc.encode_diff(remote_state_vector)?;
        Ok(SyncMessage::SyncStep2(diff).encode())
    }

    /// Create an update message for broadcasting local changes.
    pub fn create_update_message(&self, update: &[u8]) -> Vec<u8> {
        SyncMessage::Update(update.to_vec()).encode()
    }

    /// Handle an incoming sync frame.
    ///
    /// Returns an optional response that should be sent back:
    ///
    /// - **SyncStep1**: answered with a SyncStep2 holding missing updates
    /// - **SyncStep2** / **Update**: applied, no response
    ///
    /// Malformed update payloads are logged and skipped.
    pub fn handle_message(&self, msg: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let messages = SyncMessage::decode_all(msg)?;
        let mut response: Option<Vec<u8>> = None;

        for sync_msg in messages {
            match sync_msg {
                SyncMessage::SyncStep1(remote_sv) => {
                    let step2 = self.create_sync_step2(&remote_sv)?;
                    response.get_or_insert_with(Vec::new).extend_from_slice(&step2);
                }
                SyncMessage::SyncStep2(update) | SyncMessage::Update(update) => {
                    if !update.is_empty() {
                        self.doc.apply_update(&update);
                    }
                }
            }
        }

        Ok(response)
    }
}

impl std::fmt::Debug for SyncProtocol<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncProtocol")
            .field("doc", &self.doc)
            .finish()
    }
}
