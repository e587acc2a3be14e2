//! Replicated graph document, its update log, compaction, wire protocol and
//! origin-scoped undo.

mod compaction;
mod graph_doc;
mod memory_storage;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
mod sqlite_storage;
mod storage;
pub mod sync;
pub mod types;
mod undo;

pub use compaction::{CompactionReport, Compactor, load_state, replay_document};
pub use graph_doc::{GraphDoc, GraphSnapshot, GraphTxn, ReplayStats};
pub use memory_storage::MemoryStorage;
#[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
pub use sqlite_storage::SqliteStorage;
pub use storage::{StorageResult, UpdateLogStore, check_payload_size};
pub use sync::{
    AuthMessage, ControlMessage, Message, REJECT_PAYLOAD_TOO_LARGE, SyncMessage, SyncProtocol,
};
pub use types::{
    DocumentInfo, EdgeRecord, LOCAL_ORIGIN, LogCursor, NodeRecord, Position, REMOTE_ORIGIN,
    ReplayBundle, Role, Snapshot, UpdateRecord,
};
pub use undo::OriginUndoManager;
