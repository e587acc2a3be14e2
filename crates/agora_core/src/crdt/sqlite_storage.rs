//! SQLite-backed update log.
//!
//! This module provides a persistent storage backend using SQLite for a
//! document's update log, its compacted snapshot and the document row itself.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, Row, params};

use super::storage::{StorageResult, UpdateLogStore, check_payload_size, now_millis};
use super::types::{DocumentInfo, LogCursor, Snapshot, UpdateRecord};
use crate::config::DEFAULT_MAX_UPDATE_BYTES;
use crate::error::AgoraError;

/// SQLite-backed update log.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    max_update_bytes: usize,
}

impl SqliteStorage {
    /// Open or create a SQLite database at the given path.
    ///
    /// This will create the necessary tables if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        let storage = Self {
            conn: Mutex::new(conn),
            max_update_bytes: DEFAULT_MAX_UPDATE_BYTES,
        };
        storage.init_schema()?;
        Ok(storage)
    }

    pub fn with_max_update_bytes(mut self, max: usize) -> Self {
        self.max_update_bytes = max;
        self
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> StorageResult<()> {
        self.conn().execute_batch(
            r#"
            -- Document rows (identity and ownership, never content)
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                slug TEXT UNIQUE,
                owner_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Append-only update log
            CREATE TABLE IF NOT EXISTS updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL,
                data BLOB NOT NULL,
                user_id TEXT,
                created_at INTEGER NOT NULL
            );

            -- Replay order
            CREATE INDEX IF NOT EXISTS idx_updates_doc_order ON updates(doc_id, created_at, id);

            -- One compacted state per document
            CREATE TABLE IF NOT EXISTS snapshots (
                doc_id TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                snapshot_at INTEGER NOT NULL,
                snapshot_seq INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert a record with an explicit timestamp.
    pub fn append_at(
        &self,
        doc_id: &str,
        data: &[u8],
        user_id: Option<&str>,
        created_at: i64,
    ) -> StorageResult<UpdateRecord> {
        self.insert_update(doc_id, data, user_id, || created_at)
    }

    /// The timestamp is taken under the connection lock so insertion order and
    /// `(created_at, id)` order agree.
    fn insert_update(
        &self,
        doc_id: &str,
        data: &[u8],
        user_id: Option<&str>,
        timestamp: impl FnOnce() -> i64,
    ) -> StorageResult<UpdateRecord> {
        check_payload_size(data, self.max_update_bytes)?;

        let mut conn = self.conn();
        let created_at = timestamp();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO updates (doc_id, data, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![doc_id, data, user_id, created_at],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO documents (id, owner_id, created_at, updated_at) VALUES (?1, NULL, ?2, ?2)
             ON CONFLICT(id) DO UPDATE SET updated_at = excluded.updated_at",
            params![doc_id, created_at],
        )?;
        tx.commit()?;

        Ok(UpdateRecord {
            id,
            doc_id: doc_id.to_string(),
            data: data.to_vec(),
            user_id: user_id.map(str::to_string),
            created_at,
        })
    }
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("max_update_bytes", &self.max_update_bytes)
            .finish_non_exhaustive()
    }
}

fn document_from_row(row: &Row<'_>) -> rusqlite::Result<DocumentInfo> {
    Ok(DocumentInfo {
        id: row.get(0)?,
        slug: row.get(1)?,
        owner_id: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn update_from_row(row: &Row<'_>) -> rusqlite::Result<UpdateRecord> {
    Ok(UpdateRecord {
        id: row.get(0)?,
        doc_id: row.get(1)?,
        data: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl UpdateLogStore for SqliteStorage {
    fn max_update_bytes(&self) -> usize {
        self.max_update_bytes
    }

    fn ensure_document(&self, doc_id: &str, owner_id: Option<&str>) -> StorageResult<DocumentInfo> {
        let conn = self.conn();
        let now = now_millis();
        conn.execute(
            "INSERT OR IGNORE INTO documents (id, owner_id, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![doc_id, owner_id, now],
        )?;
        let doc = conn.query_row(
            "SELECT id, slug, owner_id, created_at, updated_at FROM documents WHERE id = ?1",
            params![doc_id],
            document_from_row,
        )?;
        Ok(doc)
    }

    fn get_document(&self, doc_id: &str) -> StorageResult<Option<DocumentInfo>> {
        let doc = self
            .conn()
            .query_row(
                "SELECT id, slug, owner_id, created_at, updated_at FROM documents WHERE id = ?1",
                params![doc_id],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    fn find_document_by_slug(&self, slug: &str) -> StorageResult<Option<DocumentInfo>> {
        let doc = self
            .conn()
            .query_row(
                "SELECT id, slug, owner_id, created_at, updated_at FROM documents WHERE slug = ?1",
                params![slug],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    fn set_slug(&self, doc_id: &str, slug: &str) -> StorageResult<()> {
        let changed = self.conn().execute(
            "UPDATE documents SET slug = ?2 WHERE id = ?1",
            params![doc_id, slug],
        )?;
        if changed == 0 {
            return Err(AgoraError::DocumentNotFound(doc_id.to_string()));
        }
        Ok(())
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
        let conn = self.conn();
        let updates = match since {
            Some(cursor) => {
                let mut stmt = conn.prepare(
                    "SELECT id, doc_id, data, user_id, created_at FROM updates
                     WHERE doc_id = ?1 AND (created_at > ?2 OR (created_at = ?2 AND id > ?3))
                     ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(
                        params![doc_id, cursor.created_at, cursor.seq],
                        update_from_row,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, doc_id, data, user_id, created_at FROM updates
                     WHERE doc_id = ?1
                     ORDER BY created_at ASC, id ASC",
                )?;
                let rows = stmt
                    .query_map(params![doc_id], update_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };
        Ok(updates)
    }

    fn count_for(&self, doc_id: &str) -> StorageResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM updates WHERE doc_id = ?1",
            params![doc_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn load_snapshot(&self, doc_id: &str) -> StorageResult<Option<Snapshot>> {
        let snapshot = self
            .conn()
            .query_row(
                "SELECT doc_id, state, snapshot_at, snapshot_seq FROM snapshots WHERE doc_id = ?1",
                params![doc_id],
                |row| {
                    Ok(Snapshot {
                        doc_id: row.get(0)?,
                        state: row.get(1)?,
                        snapshot_at: row.get(2)?,
                        snapshot_seq: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(snapshot)
    }

    fn replace_with_snapshot(
        &self,
        snapshot: &Snapshot,
        base: Option<LogCursor>,
        folded: &[i64],
    ) -> StorageResult<Option<usize>> {
        let mut conn = self.conn();

        // Dropping the transaction without commit rolls everything back
        let tx = conn.transaction()?;

        let stored = tx
            .query_row(
                "SELECT snapshot_at, snapshot_seq FROM snapshots WHERE doc_id = ?1",
                params![snapshot.doc_id],
                |row| {
                    Ok(LogCursor {
                        created_at: row.get(0)?,
                        seq: row.get(1)?,
                    })
                },
            )
            .optional()?;
        if stored != base {
            return Ok(None);
        }

        // Save the new snapshot FIRST, then delete the folded updates
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (doc_id, state, snapshot_at, snapshot_seq)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snapshot.doc_id,
                snapshot.state,
                snapshot.snapshot_at,
                snapshot.snapshot_seq
            ],
        )?;

        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM updates WHERE doc_id = ?1 AND id = ?2")?;
            for id in folded {
                deleted += stmt.execute(params![snapshot.doc_id, id])?;
            }
        }

        // A record the snapshot never saw must not end up behind its cursor
        let behind: i64 = tx.query_row(
            "SELECT COUNT(*) FROM updates
             WHERE doc_id = ?1 AND (created_at < ?2 OR (created_at = ?2 AND id <= ?3))",
            params![snapshot.doc_id, snapshot.snapshot_at, snapshot.snapshot_seq],
            |row| row.get(0),
        )?;
        if behind > 0 {
            return Ok(None);
        }

        tx.commit()?;
        Ok(Some(deleted))
    }
}
