//! Tunable timing and size constants for the collaboration core.
//!
//! This module provides [`SyncTuning`], which gathers every knob the sync,
//! presence and compaction layers depend on. The defaults are the values the
//! web client has shipped with; deployments can override any of them from a
//! TOML file or (on the server) from environment variables.
//!
//! # Example
//!
//! ```ignore
//! use agora_core::config::SyncTuning;
//!
//! let tuning = SyncTuning::from_toml_str("lock_ttl_ms = 20000")?;
//! assert_eq!(tuning.lock_ttl().as_secs(), 20);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default lock staleness window.
pub const DEFAULT_LOCK_TTL_MS: u64 = 15_000;
/// Default debounce for write arbitration re-evaluation.
pub const DEFAULT_ARBITRATION_DEBOUNCE_MS: u64 = 1_000;
/// Default undo capture window.
pub const DEFAULT_UNDO_CAPTURE_TIMEOUT_MS: u64 = 600;
/// Default age after which an unrenewed remote presence state is dropped.
pub const DEFAULT_PRESENCE_TIMEOUT_MS: u64 = 30_000;
/// Default wait for the "connected" status.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 8_000;
/// Compaction runs once a document has more than this many update records.
pub const DEFAULT_COMPACTION_THRESHOLD: usize = 30;
/// Number of most recent update records left out of a snapshot.
pub const DEFAULT_COMPACTION_KEEP_TAIL: usize = 3;
/// Largest accepted update payload.
pub const DEFAULT_MAX_UPDATE_BYTES: usize = 1_000_000;

/// Timing and size configuration shared by client and server components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTuning {
    /// Lock entries older than this are treated as absent
    pub lock_ttl_ms: u64,

    /// Debounce window for write-arbitration re-evaluation
    pub arbitration_debounce_ms: u64,

    /// Edits closer together than this merge into one undo step
    pub undo_capture_timeout_ms: u64,

    /// How long a client waits for the connected status before giving up
    pub connect_timeout_ms: u64,

    /// Remote presence older than this is dropped; clients renew their own
    /// state every half of it
    pub presence_timeout_ms: u64,

    /// Update count above which inline compaction runs
    pub compaction_threshold: usize,

    /// Recent update records kept outside the snapshot
    pub compaction_keep_tail: usize,

    /// Maximum size of a single update payload in bytes
    pub max_update_bytes: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
            arbitration_debounce_ms: DEFAULT_ARBITRATION_DEBOUNCE_MS,
            undo_capture_timeout_ms: DEFAULT_UNDO_CAPTURE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            presence_timeout_ms: DEFAULT_PRESENCE_TIMEOUT_MS,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
            compaction_keep_tail: DEFAULT_COMPACTION_KEEP_TAIL,
            max_update_bytes: DEFAULT_MAX_UPDATE_BYTES,
        }
    }
}

impl SyncTuning {
    /// Parse tuning from a TOML string. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load tuning from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn arbitration_debounce(&self) -> Duration {
        Duration::from_millis(self.arbitration_debounce_ms)
    }

    pub fn undo_capture_timeout(&self) -> Duration {
        Duration::from_millis(self.undo_capture_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }
}
