use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use agora_core::crdt::{
    Compactor, GraphDoc, StorageResult, SyncMessage, UpdateLogStore, UpdateRecord,
    check_payload_size, load_state, replay_document,
};
use tracing::{debug, warn};

/// The persistence path every accepted update takes, shared by the HTTP
/// endpoint and WebSocket connections.
#[derive(Clone)]
pub struct UpdateIngest {
    store: Arc<dyn UpdateLogStore>,
    compactor: Compactor,
    /// Documents with a compaction in flight
    compacting: Arc<Mutex<HashSet<String>>>,
}

/// Held while a document is being compacted; releases it on drop.
pub struct CompactionSlot<'a> {
    compacting: &'a Mutex<HashSet<String>>,
    doc_id: String,
}

impl Drop for CompactionSlot<'_> {
    fn drop(&mut self) {
        self.compacting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.doc_id);
    }
}

impl UpdateIngest {
    pub fn new(store: Arc<dyn UpdateLogStore>, compactor: Compactor) -> Self {
        Self {
            store,
            compactor,
            compacting: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claim the right to compact `doc_id`. `None` while another caller
    /// holds it.
    pub fn claim_compaction(&self, doc_id: &str) -> Option<CompactionSlot<'_>> {
        let claimed = self
            .compacting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(doc_id.to_string());
        claimed.then(|| CompactionSlot {
            compacting: &self.compacting,
            doc_id: doc_id.to_string(),
        })
    }

    pub fn store(&self) -> &Arc<dyn UpdateLogStore> {
        &self.store
    }

    pub fn max_update_bytes(&self) -> usize {
        self.store.max_update_bytes()
    }

    /// Validate, append and (when over threshold) compact.
    ///
    /// Payloads that are too large or do not decode as an update are
    /// rejected before anything is written. At most one compaction per
    /// document runs at a time; an append that finds one in flight skips it.
    /// Compaction failures are logged and leave the append in place.
    pub fn ingest(
        &self,
        doc_id: &str,
        data: &[u8],
        user_id: Option<&str>,
    ) -> StorageResult<UpdateRecord> {
        check_payload_size(data, self.max_update_bytes())?;
        GraphDoc::new().try_apply_update(data)?;

        let record = self.store.append(doc_id, data, user_id)?;
        let Some(_slot) = self.claim_compaction(doc_id) else {
            debug!("Compaction of {} already running", doc_id);
            return Ok(record);
        };
        match self.compactor.maybe_compact(self.store.as_ref(), doc_id) {
            Ok(Some(report)) => debug!(
                "Compacted {}: folded {} records, kept {}",
                doc_id, report.folded, report.kept
            ),
            Ok(None) => {}
            Err(e) => warn!("Compaction of {} failed: {}", doc_id, e),
        }
        Ok(record)
    }

    /// Frames that bring a joining client up to date: the snapshot as
    /// `SyncStep2`, then one `Update` per record after it.
    pub fn join_frames(&self, doc_id: &str) -> StorageResult<Vec<Vec<u8>>> {
        let bundle = load_state(self.store.as_ref(), doc_id)?;
        let snapshot = bundle.snapshot.map(|s| s.state).unwrap_or_default();

        let mut frames = Vec::with_capacity(1 + bundle.updates.len());
        frames.push(SyncMessage::SyncStep2(snapshot).encode());
        frames.extend(
            bundle
                .updates
                .into_iter()
                .map(|record| SyncMessage::Update(record.data).encode()),
        );
        Ok(frames)
    }

    /// Answer a client's `SyncStep1` with what it is missing.
    ///
    /// An empty state vector yields the full state.
    pub fn answer_step1(&self, doc_id: &str, state_vector: &[u8]) -> StorageResult<Vec<u8>> {
        let (doc, stats) = replay_document(self.store.as_ref(), doc_id)?;
        if stats.skipped > 0 {
            warn!("Skipped {} malformed records replaying {}", stats.skipped, doc_id);
        }
        let diff = doc.encode_diff(state_vector)?;
        Ok(SyncMessage::SyncStep2(diff).encode())
    }

    /// Full state as a `SyncStep2` frame.
    pub fn full_state(&self, doc_id: &str) -> StorageResult<Vec<u8>> {
        self.answer_step1(doc_id, &[])
    }
}
