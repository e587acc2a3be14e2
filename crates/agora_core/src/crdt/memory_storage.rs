//! In-memory update log for testing.
//!
//! This provides a simple in-memory implementation of [`UpdateLogStore`]
//! for use in unit tests and development.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::storage::{StorageResult, UpdateLogStore, check_payload_size, now_millis};
use super::types::{DocumentInfo, LogCursor, Snapshot, UpdateRecord};
use crate::config::DEFAULT_MAX_UPDATE_BYTES;

/// In-memory update log.
///
/// Thread-safe via `RwLock`; data is lost when dropped.
#[derive(Debug)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
    max_update_bytes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<String, DocumentInfo>,
    updates: HashMap<String, Vec<UpdateRecord>>,
    snapshots: HashMap<String, Snapshot>,
    next_id: i64,
}

impl Inner {
    fn touch_document(&mut self, doc_id: &str, now: i64) {
        self.documents
            .entry(doc_id.to_string())
            .and_modify(|doc| doc.updated_at = now)
            .or_insert_with(|| DocumentInfo {
                id: doc_id.to_string(),
                slug: None,
                owner_id: None,
                created_at: now,
                updated_at: now,
            });
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_update_bytes: DEFAULT_MAX_UPDATE_BYTES,
        }
    }

    pub fn with_max_update_bytes(mut self, max: usize) -> Self {
        self.max_update_bytes = max;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record with an explicit timestamp (for ordering tests).
    pub fn append_at(
        &self,
        doc_id: &str,
        data: &[u8],
        user_id: Option<&str>,
        created_at: i64,
    ) -> StorageResult<UpdateRecord> {
        self.insert_update(doc_id, data, user_id, || created_at)
    }

    fn insert_update(
        &self,
        doc_id: &str,
        data: &[u8],
        user_id: Option<&str>,
        timestamp: impl FnOnce() -> i64,
    ) -> StorageResult<UpdateRecord> {
        check_payload_size(data, self.max_update_bytes)?;

        let mut inner = self.write();
        let created_at = timestamp();
        inner.next_id += 1;
        let record = UpdateRecord {
            id: inner.next_id,
            doc_id: doc_id.to_string(),
            data: data.to_vec(),
            user_id: user_id.map(str::to_string),
            created_at,
        };

        let log = inner.updates.entry(doc_id.to_string()).or_default();
        log.push(record.clone());
        log.sort_by_key(UpdateRecord::cursor);

        inner.touch_document(doc_id, created_at);
        Ok(record)
    }
}

impl UpdateLogStore for MemoryStorage {
    fn max_update_bytes(&self) -> usize {
        self.max_update_bytes
    }

    fn ensure_document(&self, doc_id: &str, owner_id: Option<&str>) -> StorageResult<DocumentInfo> {
        let now = now_millis();
        let mut inner = self.write();
        let doc = inner
            .documents
            .entry(doc_id.to_string())
            .or_insert_with(|| DocumentInfo {
                id: doc_id.to_string(),
                slug: None,
                owner_id: owner_id.map(str::to_string),
                created_at: now,
                updated_at: now,
            });
        Ok(doc.clone())
    }

    fn get_document(&self, doc_id: &str) -> StorageResult<Option<DocumentInfo>> {
        Ok(self.read().documents.get(doc_id).cloned())
    }

    fn find_document_by_slug(&self, slug: &str) -> StorageResult<Option<DocumentInfo>> {
        Ok(self
            .read()
            .documents
            .values()
            .find(|doc| doc.slug.as_deref() == Some(slug))
            .cloned())
    }

    fn set_slug(&self, doc_id: &str, slug: &str) -> StorageResult<()> {
        let mut inner = self.write();
        match inner.documents.get_mut(doc_id) {
            Some(doc) => {
                doc.slug = Some(slug.to_string());
                Ok(())
            }
            None => Err(crate::error::AgoraError::DocumentNotFound(doc_id.to_string())),
        }
    }

    fn append(
        &self,
        doc_id: &str,
        data: &[u8],
        user_id: Option<&str>,
    ) -> StorageResult<UpdateRecord> {
        self.insert_update(doc_id, data, user_id, now_millis)
    }

    fn list_since(
        &self,
        doc_id: &str,
        since: Option<LogCursor>,
    ) -> StorageResult<Vec<UpdateRecord>> {
        let inner = self.read();
        let log = inner.updates.get(doc_id).map(Vec::as_slice).unwrap_or(&[]);

        Ok(log
            .iter()
            .filter(|u| since.is_none_or(|cursor| cursor.precedes(u.created_at, u.id)))
            .cloned()
            .collect())
    }

    fn count_for(&self, doc_id: &str) -> StorageResult<usize> {
        Ok(self.read().updates.get(doc_id).map_or(0, Vec::len))
    }

    fn load_snapshot(&self, doc_id: &str) -> StorageResult<Option<Snapshot>> {
        Ok(self.read().snapshots.get(doc_id).cloned())
    }

    fn replace_with_snapshot(
        &self,
        snapshot: &Snapshot,
        base: Option<LogCursor>,
        folded: &[i64],
    ) -> StorageResult<Option<usize>> {
        let mut inner = self.write();
        let stored = inner.snapshots.get(&snapshot.doc_id).map(Snapshot::cursor);
        if stored != base {
            return Ok(None);
        }

        let cursor = snapshot.cursor();
        let folded: HashSet<i64> = folded.iter().copied().collect();
        let log = inner.updates.get(&snapshot.doc_id).map(Vec::as_slice).unwrap_or(&[]);
        let behind = log
            .iter()
            .any(|u| !folded.contains(&u.id) && !cursor.precedes(u.created_at, u.id));
        if behind {
            return Ok(None);
        }

        inner
            .snapshots
            .insert(snapshot.doc_id.clone(), snapshot.clone());
        let Some(log) = inner.updates.get_mut(&snapshot.doc_id) else {
            return Ok(Some(0));
        };
        let before = log.len();
        log.retain(|u| !folded.contains(&u.id));
        Ok(Some(before - log.len()))
    }
}
