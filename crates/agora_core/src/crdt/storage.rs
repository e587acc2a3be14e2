//! Storage abstraction for the update log.
//!
//! This module defines the [`UpdateLogStore`] trait which abstracts over
//! different storage backends (SQLite, in-memory) for persisting a document's
//! CRDT updates and its compacted snapshot.

use super::types::{DocumentInfo, LogCursor, Snapshot, UpdateRecord};
use crate::error::{AgoraError, Result};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T>;

/// Trait for update log backends.
///
/// # Storage Model
///
/// Per document the store keeps:
/// 1. **Document row**: identity, optional slug and owner, timestamps
/// 2. **Update log**: immutable binary deltas ordered by `(created_at, id)`
/// 3. **Snapshot**: at most one compacted state plus the cursor of the newest
///    record folded into it
///
/// Appends are independent inserts; nothing here takes a lock on the log
/// beyond what the backend needs for its own consistency.
pub trait UpdateLogStore: Send + Sync {
    /// Largest payload [`UpdateLogStore::append`] accepts.
    fn max_update_bytes(&self) -> usize;

    /// Create the document row if it doesn't exist, returning the stored row.
    ///
    /// An existing row is returned unchanged (the owner is never replaced).
    fn ensure_document(&self, doc_id: &str, owner_id: Option<&str>) -> StorageResult<DocumentInfo>;

    fn get_document(&self, doc_id: &str) -> StorageResult<Option<DocumentInfo>>;

    fn find_document_by_slug(&self, slug: &str) -> StorageResult<Option<DocumentInfo>>;

    /// Attach a human-readable slug to an existing document.
    fn set_slug(&self, doc_id: &str, slug: &str) -> StorageResult<()>;

    /// Append one update to a document's log.
    ///
    /// Rejects payloads larger than [`UpdateLogStore::max_update_bytes`] with
    /// [`AgoraError::PayloadTooLarge`] before touching storage. On success the
    /// document's `updated_at` is bumped, creating the row if needed.
    fn append(&self, doc_id: &str, data: &[u8], user_id: Option<&str>)
    -> StorageResult<UpdateRecord>;

    /// Records strictly after `since`, in log order. `None` lists everything.
    fn list_since(&self, doc_id: &str, since: Option<LogCursor>)
    -> StorageResult<Vec<UpdateRecord>>;

    fn count_for(&self, doc_id: &str) -> StorageResult<usize>;

    fn load_snapshot(&self, doc_id: &str) -> StorageResult<Option<Snapshot>>;

    /// Store `snapshot` and delete the records it folds.
    ///
    /// `base` is the cursor of the snapshot the new one was built on (`None`
    /// when there was none) and `folded` the ids of the records replayed into
    /// it. Both steps happen atomically, snapshot first, and only when:
    ///
    /// - the stored snapshot still sits at `base`, and
    /// - no record outside `folded` lies at or before the new cursor.
    ///
    /// Otherwise nothing changes and `None` is returned. On success returns
    /// the number of deleted records.
    fn replace_with_snapshot(
        &self,
        snapshot: &Snapshot,
        base: Option<LogCursor>,
        folded: &[i64],
    ) -> StorageResult<Option<usize>>;
}

/// Reject a payload larger than `max` bytes.
pub fn check_payload_size(data: &[u8], max: usize) -> StorageResult<()> {
    if data.len() > max {
        return Err(AgoraError::PayloadTooLarge {
            size: data.len(),
            max,
        });
    }
    Ok(())
}

/// Current time as Unix milliseconds, the unit every stored timestamp uses.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
