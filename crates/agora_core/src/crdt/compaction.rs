//! Update log compaction and the snapshot read path.
//!
//! A document's log is folded into a single snapshot once it grows past a
//! threshold. The newest few records are left out of the snapshot so recent
//! fine-grained deltas stay individually replayable.
//!
//! ```text
//! before:  [u1 u2 ... u28 u29 u30 u31]              (31 records, no snapshot)
//! after:   snapshot(u1..u28)  [u29 u30 u31]        (snapshot_at = u28)
//! ```

use super::graph_doc::{GraphDoc, ReplayStats};
use super::storage::{StorageResult, UpdateLogStore};
use super::types::{LogCursor, ReplayBundle, Snapshot};
use crate::config::{DEFAULT_COMPACTION_KEEP_TAIL, DEFAULT_COMPACTION_THRESHOLD, SyncTuning};

/// Outcome of one compaction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Records folded into the snapshot (and deleted from the log)
    pub folded: usize,

    /// Records left in the log after the snapshot
    pub kept: usize,

    /// Boundary of the new snapshot
    pub cursor: LogCursor,

    /// Size of the encoded snapshot state
    pub snapshot_bytes: usize,
}

/// Folds update logs into snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compactor {
    threshold: usize,
    keep_tail: usize,
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new(DEFAULT_COMPACTION_THRESHOLD, DEFAULT_COMPACTION_KEEP_TAIL)
    }
}

impl Compactor {
    pub fn new(threshold: usize, keep_tail: usize) -> Self {
        Self {
            threshold,
            keep_tail,
        }
    }

    pub fn from_tuning(tuning: &SyncTuning) -> Self {
        Self::new(tuning.compaction_threshold, tuning.compaction_keep_tail)
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn keep_tail(&self) -> usize {
        self.keep_tail
    }

    /// Compact `doc_id` if its log holds more than the threshold.
    ///
    /// Called inline after a successful append. Errors are returned to the
    /// caller, which logs them; the append itself is never affected.
    pub fn maybe_compact(
        &self,
        store: &dyn UpdateLogStore,
        doc_id: &str,
    ) -> StorageResult<Option<CompactionReport>> {
        let count = store.count_for(doc_id)?;
        if count <= self.threshold {
            return Ok(None);
        }
        log::debug!(
            "Compacting '{}': {} records over threshold {}",
            doc_id,
            count,
            self.threshold
        );
        self.compact(store, doc_id)
    }

    /// Fold every record except the newest `keep_tail` into the snapshot.
    ///
    /// Returns `None` when there is nothing to fold, or when the log moved
    /// underneath (another compaction won, or a late record landed behind
    /// the new cursor). The log is left untouched in that case.
    pub fn compact(
        &self,
        store: &dyn UpdateLogStore,
        doc_id: &str,
    ) -> StorageResult<Option<CompactionReport>> {
        let previous = store.load_snapshot(doc_id)?;
        let records = store.list_since(doc_id, previous.as_ref().map(Snapshot::cursor))?;

        if records.len() <= self.keep_tail {
            return Ok(None);
        }

        let fold_count = records.len() - self.keep_tail;
        let folded = &records[..fold_count];
        let Some(newest) = folded.last() else {
            return Ok(None);
        };

        let (scratch, stats) = GraphDoc::replay(
            previous.as_ref().map(|s| s.state.as_slice()),
            folded.iter().map(|u| u.data.as_slice()),
        );
        if stats.skipped > 0 {
            log::warn!(
                "Compacting '{}': skipped {} malformed records",
                doc_id,
                stats.skipped
            );
        }

        let snapshot = Snapshot {
            doc_id: doc_id.to_string(),
            state: scratch.encode_state_as_update(),
            snapshot_at: newest.created_at,
            snapshot_seq: newest.id,
        };
        let base = previous.as_ref().map(Snapshot::cursor);
        let folded_ids: Vec<i64> = folded.iter().map(|u| u.id).collect();
        let Some(deleted) = store.replace_with_snapshot(&snapshot, base, &folded_ids)? else {
            log::debug!(
                "Compaction of '{}' skipped: log changed while folding",
                doc_id
            );
            return Ok(None);
        };

        log::debug!(
            "Compacted '{}': folded {} records ({} deleted) into {} byte snapshot, kept {}",
            doc_id,
            fold_count,
            deleted,
            snapshot.state.len(),
            self.keep_tail
        );

        Ok(Some(CompactionReport {
            folded: fold_count,
            kept: records.len() - fold_count,
            cursor: snapshot.cursor(),
            snapshot_bytes: snapshot.state.len(),
        }))
    }
}

/// Latest snapshot plus every record after it (or the full log).
///
/// This is what a joining or resyncing client needs to rebuild a document.
pub fn load_state(store: &dyn UpdateLogStore, doc_id: &str) -> StorageResult<ReplayBundle> {
    let snapshot = store.load_snapshot(doc_id)?;
    let updates = store.list_since(doc_id, snapshot.as_ref().map(Snapshot::cursor))?;
    Ok(ReplayBundle { snapshot, updates })
}

/// Rebuild a document from storage into a scratch [`GraphDoc`].
pub fn replay_document(
    store: &dyn UpdateLogStore,
    doc_id: &str,
) -> StorageResult<(GraphDoc, ReplayStats)> {
    let bundle = load_state(store, doc_id)?;
    Ok(GraphDoc::replay(
        bundle.snapshot.as_ref().map(|s| s.state.as_slice()),
        bundle.updates.iter().map(|u| u.data.as_slice()),
    ))
}
