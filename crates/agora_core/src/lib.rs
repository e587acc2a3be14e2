//! Collaboration core for Agora debate graphs.
//!
//! A graph document (nodes, edges, per-node rich text and metadata) is
//! replicated as a yrs CRDT, persisted as an append-only update log with
//! periodic compaction, and synchronized over WebSocket. Presence rides the
//! same channel and carries advisory editing locks plus the write arbitration
//! that picks one active session per user.

/// Tunable timings and limits
pub mod config;

/// Error (common error types)
pub mod error;

/// CRDT document, update log, compaction, sync protocol and undo
pub mod crdt;

/// Awareness, editing locks and write arbitration
pub mod presence;

/// Native WebSocket sync client
#[cfg(feature = "native-sync")]
pub mod client;

pub use error::{AgoraError, Result};
