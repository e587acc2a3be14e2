//! Origin-scoped undo/redo over a [`GraphDoc`].
//!
//! Each tab owns one [`OriginUndoManager`] tracking only the origins it was
//! built with, so undoing never reverts a peer's concurrent edit even though
//! both edits live in the same document.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use yrs::UndoManager;
use yrs::undo::Options;

use super::graph_doc::GraphDoc;
use crate::config::DEFAULT_UNDO_CAPTURE_TIMEOUT_MS;
use crate::error::{AgoraError, Result};

/// Undo manager scoped to a set of transaction origins.
pub struct OriginUndoManager {
    manager: UndoManager,
    tracked_origins: Vec<String>,
    tracked_texts: HashSet<String>,
    applying: Arc<AtomicBool>,
}

impl OriginUndoManager {
    /// Track the document's own local origin with the default capture window.
    pub fn new(graph: &GraphDoc) -> Self {
        Self::with_origins(
            graph,
            [graph.local_origin()],
            Duration::from_millis(DEFAULT_UNDO_CAPTURE_TIMEOUT_MS),
        )
    }

    /// Track an explicit set of origins.
    ///
    /// Edits closer together than `capture_timeout` merge into one undo step.
    pub fn with_origins<I, S>(graph: &GraphDoc, origins: I, capture_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut options = Options::default();
        options.capture_timeout_millis = capture_timeout.as_millis() as u64;

        let [nodes, edges, node_text, meta] = graph.shared_maps();
        let mut manager = UndoManager::with_scope_and_options(graph.doc(), nodes, options);
        manager.expand_scope(edges);
        manager.expand_scope(node_text);
        manager.expand_scope(meta);

        let mut tracked_origins = Vec::new();
        for origin in origins {
            let origin = origin.as_ref().to_string();
            manager.include_origin(origin.as_str());
            tracked_origins.push(origin);
        }

        let mut undo = Self {
            manager,
            tracked_origins,
            tracked_texts: HashSet::new(),
            applying: Arc::new(AtomicBool::new(false)),
        };
        undo.track_new_texts(graph);
        undo
    }

    /// Add every rich text not yet in scope.
    ///
    /// Texts nested in `node_text` are not tracked just because the map is;
    /// call this after texts are created (locally or by a peer). Returns the
    /// number of texts added.
    pub fn track_new_texts(&mut self, graph: &GraphDoc) -> usize {
        let mut added = 0;
        for (node_id, text) in graph.node_text_refs() {
            if self.tracked_texts.insert(node_id) {
                self.manager.expand_scope(&text);
                added += 1;
            }
        }
        added
    }

    pub fn tracked_origins(&self) -> &[String] {
        &self.tracked_origins
    }

    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }

    /// Revert the most recent capture group. Returns whether anything changed.
    pub fn undo(&mut self) -> Result<bool> {
        let _guard = ApplyingGuard::set(&self.applying);
        self.manager
            .try_undo()
            .map_err(|e| AgoraError::Crdt(format!("Undo failed: {}", e)))
    }

    /// Re-apply the most recently undone capture group.
    pub fn redo(&mut self) -> Result<bool> {
        let _guard = ApplyingGuard::set(&self.applying);
        self.manager
            .try_redo()
            .map_err(|e| AgoraError::Crdt(format!("Redo failed: {}", e)))
    }

    /// Close the current capture group so the next edit starts a new step.
    pub fn stop_capturing(&mut self) {
        self.manager.reset();
    }

    /// Drop both stacks.
    pub fn clear(&mut self) {
        self.manager.clear();
    }

    /// True while an undo or redo is being applied.
    pub fn is_applying(&self) -> bool {
        self.applying.load(Ordering::Acquire)
    }

    /// Shared handle to the re-entrancy flag, for observers that write back.
    pub fn applying_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.applying)
    }
}

impl std::fmt::Debug for OriginUndoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginUndoManager")
            .field("tracked_origins", &self.tracked_origins)
            .field("tracked_texts", &self.tracked_texts.len())
            .field("can_undo", &self.can_undo())
            .field("can_redo", &self.can_redo())
            .finish()
    }
}

/// Sets the flag for its lifetime.
struct ApplyingGuard<'a>(&'a AtomicBool);

impl<'a> ApplyingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ApplyingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::types::{NodeRecord, REMOTE_ORIGIN};
    use std::sync::atomic::AtomicUsize;

    fn set_node(doc: &GraphDoc, origin: &str, id: &str) {
        doc.transact(origin, |txn| txn.set_node(&NodeRecord::new(id, "point")))
            .unwrap();
    }

    #[test]
    fn test_undo_only_sees_tracked_origin() {
        let doc = GraphDoc::new();
        let mut undo_a = OriginUndoManager::with_origins(&doc, ["tab-a"], Duration::ZERO);
        let undo_b = OriginUndoManager::with_origins(&doc, ["tab-b"], Duration::ZERO);

        set_node(&doc, "tab-a", "p-1");

        assert!(undo_a.can_undo());
        assert!(!undo_b.can_undo());

        assert!(undo_a.undo().unwrap());
        assert!(doc.node("p-1").is_none());
        assert!(undo_a.can_redo());

        assert!(undo_a.redo().unwrap());
        assert!(doc.node("p-1").is_some());
    }

    #[test]
    fn test_remote_edits_are_not_undoable() {
        let doc = GraphDoc::new();
        let undo = OriginUndoManager::new(&doc);

        set_node(&doc, REMOTE_ORIGIN, "remote-node");
        assert!(!undo.can_undo());
    }

    #[test]
    fn test_undo_leaves_peer_edit_intact() {
        let doc = GraphDoc::new();
        let mut undo_a = OriginUndoManager::with_origins(&doc, ["tab-a"], Duration::ZERO);

        set_node(&doc, "tab-a", "mine");
        set_node(&doc, "tab-b", "theirs");

        undo_a.undo().unwrap();
        assert!(doc.node("mine").is_none());
        assert!(doc.node("theirs").is_some());
    }

    #[test]
    fn test_capture_timeout_merges_rapid_edits() {
        let doc = GraphDoc::new();
        let mut undo = OriginUndoManager::with_origins(&doc, ["tab-a"], Duration::from_secs(60));

        set_node(&doc, "tab-a", "a");
        set_node(&doc, "tab-a", "b");

        undo.undo().unwrap();
        assert_eq!(doc.node_count(), 0);
        assert!(!undo.can_undo());
    }

    #[test]
    fn test_stop_capturing_splits_steps() {
        let doc = GraphDoc::new();
        let mut undo = OriginUndoManager::with_origins(&doc, ["tab-a"], Duration::from_secs(60));

        set_node(&doc, "tab-a", "a");
        undo.stop_capturing();
        set_node(&doc, "tab-a", "b");

        undo.undo().unwrap();
        assert!(doc.node("a").is_some());
        assert!(doc.node("b").is_none());
    }

    #[test]
    fn test_existing_text_edits_are_tracked() {
        let doc = GraphDoc::new();
        doc.transact(REMOTE_ORIGIN, |txn| {
            txn.set_node_text("p-1", "Hello");
        });

        let mut undo = OriginUndoManager::with_origins(&doc, ["tab-a"], Duration::ZERO);
        doc.transact("tab-a", |txn| txn.push_text("p-1", " world"));
        assert_eq!(doc.node_text("p-1").as_deref(), Some("Hello world"));

        undo.undo().unwrap();
        assert_eq!(doc.node_text("p-1").as_deref(), Some("Hello"));
    }

    #[test]
    fn test_track_new_texts_counts_additions() {
        let doc = GraphDoc::new();
        let mut undo = OriginUndoManager::with_origins(&doc, ["tab-a"], Duration::ZERO);
        assert_eq!(undo.track_new_texts(&doc), 0);

        doc.transact(REMOTE_ORIGIN, |txn| {
            txn.set_node_text("p-1", "a");
            txn.set_node_text("p-2", "b");
        });
        assert_eq!(undo.track_new_texts(&doc), 2);
        assert_eq!(undo.track_new_texts(&doc), 0);
    }

    #[test]
    fn test_applying_flag_set_during_undo() {
        let doc = GraphDoc::new();
        let mut undo = OriginUndoManager::with_origins(&doc, ["tab-a"], Duration::ZERO);
        let flag = undo.applying_flag();
        let seen_while_applying = Arc::new(AtomicUsize::new(0));
        let seen = seen_while_applying.clone();

        let _sub = doc
            .observe_updates(move |_, _| {
                if flag.load(Ordering::Acquire) {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        set_node(&doc, "tab-a", "p-1");
        assert_eq!(seen_while_applying.load(Ordering::SeqCst), 0);

        undo.undo().unwrap();
        assert_eq!(seen_while_applying.load(Ordering::SeqCst), 1);
        assert!(!undo.is_applying());
    }
}
