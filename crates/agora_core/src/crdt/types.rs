//! Core types for the collaborative graph document.
//!
//! This module defines the records stored inside the CRDT (nodes and edges),
//! the persisted update log records and snapshots, and the origin tokens used
//! to tag transactions.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Origin tag for updates received from the network or replayed from storage.
pub const REMOTE_ORIGIN: &str = "remote";

/// Default origin tag for edits made by the local user.
pub const LOCAL_ORIGIN: &str = "local";

/// Position of a node on the canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// A node in the graph document's `nodes` map.
///
/// `data` is free-form JSON owned by the editor (point content, author,
/// scores). The sync layer never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub position: Position,

    #[serde(default)]
    pub data: serde_json::Value,
}

impl NodeRecord {
    /// Create a node with empty data at the origin.
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            position: Position::default(),
            data: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Convenience accessor for the `content` field most node types carry.
    pub fn content(&self) -> Option<&str> {
        self.data.get("content").and_then(|v| v.as_str())
    }
}

/// An edge in the graph document's `edges` map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub source: String,
    pub target: String,
}

impl EdgeRecord {
    pub fn new(
        id: impl Into<String>,
        kind: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            source: source.into(),
            target: target.into(),
        }
    }

    /// Whether this edge touches the given node.
    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }
}

/// A persisted CRDT update, stored in the update log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    /// Insertion sequence number (unique, increasing)
    pub id: i64,

    /// Document this update belongs to
    pub doc_id: String,

    /// Binary yrs update (v1 encoding)
    pub data: Vec<u8>,

    /// Author of the update, None for system-origin writes
    pub user_id: Option<String>,

    /// Unix timestamp when this update was stored (milliseconds)
    pub created_at: i64,
}

impl UpdateRecord {
    /// Position of this record in the log's total order.
    pub fn cursor(&self) -> LogCursor {
        LogCursor {
            created_at: self.created_at,
            seq: self.id,
        }
    }
}

/// A position in a document's update log.
///
/// Records are totally ordered by `(created_at, id)`; a cursor names the last
/// record on its side of a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogCursor {
    pub created_at: i64,
    pub seq: i64,
}

impl LogCursor {
    /// Whether a record at `(created_at, seq)` lies strictly after this cursor.
    pub fn precedes(&self, created_at: i64, seq: i64) -> bool {
        (created_at, seq) > (self.created_at, self.seq)
    }
}

impl PartialOrd for LogCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.created_at, self.seq).cmp(&(other.created_at, other.seq))
    }
}

/// A compacted full document state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub doc_id: String,

    /// Full yrs state encoded as a v1 update
    pub state: Vec<u8>,

    /// Timestamp of the newest update record folded into `state`
    pub snapshot_at: i64,

    /// Insertion id of the newest folded record
    pub snapshot_seq: i64,
}

impl Snapshot {
    pub fn cursor(&self) -> LogCursor {
        LogCursor {
            created_at: self.snapshot_at,
            seq: self.snapshot_seq,
        }
    }
}

/// Access level of a caller on one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    /// Owners and editors may persist updates; viewers only read.
    pub fn can_write(self) -> bool {
        matches!(self, Role::Owner | Role::Editor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Role::Owner),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// A document row: identity and ownership, never the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: String,
    pub slug: Option<String>,

    /// None for ownerless (legacy) documents
    pub owner_id: Option<String>,

    /// Unix timestamp (milliseconds)
    pub created_at: i64,

    /// Bumped on every accepted update (milliseconds)
    pub updated_at: i64,
}

/// Everything a joining client needs to rebuild a document.
#[derive(Debug, Clone, Default)]
pub struct ReplayBundle {
    pub snapshot: Option<Snapshot>,
    pub updates: Vec<UpdateRecord>,
}

impl ReplayBundle {
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_none() && self.updates.is_empty()
    }

    /// Payload bytes in replay order: snapshot first, then each tail update.
    pub fn payloads(&self) -> impl Iterator<Item = &[u8]> {
        self.snapshot
            .iter()
            .map(|s| s.state.as_slice())
            .chain(self.updates.iter().map(|u| u.data.as_slice()))
    }
}
