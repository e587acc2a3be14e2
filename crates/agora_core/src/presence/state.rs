//! Presence records carried by the awareness layer.
//!
//! Field names follow the web client's JSON (`sessionId`, `tabId`) so native
//! and browser peers read each other's states.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Lock kind written by editors.
pub const EDIT_LOCK_KIND: &str = "edit";

/// Identity of the person behind a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
    pub session_id: String,
    pub tab_id: String,
}

/// One advisory lock held by a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub kind: String,
    /// Creation or refresh time (Unix milliseconds)
    pub ts: i64,
    pub session_id: String,
    pub tab_id: String,
}

impl LockEntry {
    /// Whether the entry is older than `ttl_ms` at `now_ms`.
    pub fn is_expired(&self, now_ms: i64, ttl_ms: u64) -> bool {
        now_ms.saturating_sub(self.ts) > ttl_ms as i64
    }
}

/// Ephemeral state one connection broadcasts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    /// Absent until the connection announces itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<PresenceUser>,

    #[serde(default)]
    pub locks: BTreeMap<String, LockEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<serde_json::Value>,
}

impl PresenceState {
    pub fn with_user(user: PresenceUser) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    /// Whether this state belongs to `user_id`.
    pub fn is_user(&self, user_id: &str) -> bool {
        self.user.as_ref().is_some_and(|u| u.id == user_id)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.session_id.as_str())
    }
}

/// The session and tab a local connection acts for.
///
/// Known before the user is published, so locks can be stamped from the
/// first moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub session_id: String,
    pub tab_id: String,
}

impl SessionIdentity {
    pub fn new(session_id: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            tab_id: tab_id.into(),
        }
    }

    /// Fresh random tab id within an existing session.
    pub fn new_tab(session_id: impl Into<String>) -> Self {
        Self::new(session_id, uuid::Uuid::new_v4().to_string())
    }
}
