//! Graph CRDT document shared by every participant of a debate graph.
//!
//! This module provides [`GraphDoc`], which wraps a yrs [`Doc`] and exposes
//! the graph through typed accessors. The rest of the crate (storage,
//! compaction, sync, undo) only talks to this wrapper, never to yrs types
//! directly, apart from the undo manager which needs the shared types for its
//! scope.
//!
//! # Structure
//!
//! ```text
//! Y.Doc
//! ├── Y.Map "nodes"      nodeId → NodeRecord (JSON)
//! ├── Y.Map "edges"      edgeId → EdgeRecord (JSON)
//! ├── Y.Map "node_text"  nodeId → Y.Text
//! └── Y.Map "meta"       key    → JSON value
//! ```
//!
//! # Transactions
//!
//! Every mutation goes through [`GraphDoc::transact`], which opens a single
//! yrs transaction tagged with an origin. When the transaction commits, every
//! observer registered with [`GraphDoc::observe_updates`] receives exactly one
//! update carrying that transaction's changes together with the origin.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Text, TextPrelim, TextRef, Transact,
    TransactionMut, Update,
};

use super::types::{EdgeRecord, LOCAL_ORIGIN, NodeRecord, REMOTE_ORIGIN};
use crate::error::{AgoraError, Result};

const NODES_MAP_NAME: &str = "nodes";
const EDGES_MAP_NAME: &str = "edges";
const NODE_TEXT_MAP_NAME: &str = "node_text";
const META_MAP_NAME: &str = "meta";

/// Counts from replaying a sequence of stored updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub skipped: usize,
}

/// Plain-data view of a graph document, used to compare replicas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, NodeRecord>,
    pub edges: BTreeMap<String, EdgeRecord>,
    pub texts: BTreeMap<String, String>,
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// A collaborative graph document.
pub struct GraphDoc {
    doc: Doc,
    nodes: MapRef,
    edges: MapRef,
    node_text: MapRef,
    meta: MapRef,
    local_origin: String,
}

impl GraphDoc {
    /// Create a new empty graph document with a random client id.
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create a new empty graph document with a fixed client id.
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let nodes = doc.get_or_insert_map(NODES_MAP_NAME);
        let edges = doc.get_or_insert_map(EDGES_MAP_NAME);
        let node_text = doc.get_or_insert_map(NODE_TEXT_MAP_NAME);
        let meta = doc.get_or_insert_map(META_MAP_NAME);

        Self {
            doc,
            nodes,
            edges,
            node_text,
            meta,
            local_origin: LOCAL_ORIGIN.to_string(),
        }
    }

    /// Use a custom origin token for local edits (one per tab or actor).
    pub fn with_local_origin(mut self, origin: impl Into<String>) -> Self {
        self.local_origin = origin.into();
        self
    }

    /// Rebuild a document from a snapshot and the updates logged after it.
    ///
    /// Malformed entries are logged and skipped so one corrupt record never
    /// blocks the rest of the replay.
    pub fn replay<'a, I>(snapshot: Option<&'a [u8]>, updates: I) -> (Self, ReplayStats)
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let doc = Self::new();
        let mut stats = ReplayStats::default();

        for payload in snapshot.into_iter().chain(updates) {
            if doc.apply_update(payload) {
                stats.applied += 1;
            } else {
                stats.skipped += 1;
            }
        }

        (doc, stats)
    }

    /// Get the underlying yrs document.
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Origin token used for edits made through [`GraphDoc::transact_local`].
    pub fn local_origin(&self) -> &str {
        &self.local_origin
    }

    pub(crate) fn shared_maps(&self) -> [&MapRef; 4] {
        [&self.nodes, &self.edges, &self.node_text, &self.meta]
    }

    // ==================== Transactions ====================

    /// Run `f` inside one transaction tagged with `origin`.
    pub fn transact<F, R>(&self, origin: &str, f: F) -> R
    where
        F: FnOnce(&mut GraphTxn<'_>) -> R,
    {
        let mut txn = GraphTxn {
            txn: self.doc.transact_mut_with(origin),
            graph: self,
        };
        f(&mut txn)
    }

    /// Run `f` inside a transaction tagged with this document's local origin.
    pub fn transact_local<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut GraphTxn<'_>) -> R,
    {
        let origin = self.local_origin.clone();
        self.transact(&origin, f)
    }

    /// Like [`GraphDoc::transact`], also returning the transaction's update bytes.
    pub fn transact_encoded<F, R>(&self, origin: &str, f: F) -> (R, Vec<u8>)
    where
        F: FnOnce(&mut GraphTxn<'_>) -> R,
    {
        let mut txn = GraphTxn {
            txn: self.doc.transact_mut_with(origin),
            graph: self,
        };
        let result = f(&mut txn);
        let update = txn.txn.encode_update_v1();
        (result, update)
    }

    // ==================== Reads ====================

    pub fn node(&self, id: &str) -> Option<NodeRecord> {
        let txn = self.doc.transact();
        self.nodes
            .get(&txn, id)
            .and_then(|value| decode_json(value, &txn))
    }

    /// All nodes, ordered by id.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let txn = self.doc.transact();
        let mut nodes: Vec<NodeRecord> = self
            .nodes
            .iter(&txn)
            .filter_map(|(_, value)| decode_json(value, &txn))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn node_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.nodes.len(&txn)
    }

    pub fn edge(&self, id: &str) -> Option<EdgeRecord> {
        let txn = self.doc.transact();
        self.edges
            .get(&txn, id)
            .and_then(|value| decode_json(value, &txn))
    }

    /// All edges, ordered by id.
    pub fn edges(&self) -> Vec<EdgeRecord> {
        let txn = self.doc.transact();
        let mut edges: Vec<EdgeRecord> = self
            .edges
            .iter(&txn)
            .filter_map(|(_, value)| decode_json(value, &txn))
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    pub fn edge_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.edges.len(&txn)
    }

    /// Current rich text of a node, if it has one.
    pub fn node_text(&self, node_id: &str) -> Option<String> {
        let txn = self.doc.transact();
        match self.node_text.get(&txn, node_id) {
            Some(Out::YText(text)) => Some(text.get_string(&txn)),
            _ => None,
        }
    }

    /// Shared text handle for a node (used to extend undo scope).
    pub fn node_text_ref(&self, node_id: &str) -> Option<TextRef> {
        let txn = self.doc.transact();
        match self.node_text.get(&txn, node_id) {
            Some(Out::YText(text)) => Some(text),
            _ => None,
        }
    }

    /// Every rich text currently in the document.
    pub fn node_text_refs(&self) -> Vec<(String, TextRef)> {
        let txn = self.doc.transact();
        self.node_text
            .iter(&txn)
            .filter_map(|(key, value)| match value {
                Out::YText(text) => Some((key.to_string(), text)),
                _ => None,
            })
            .collect()
    }

    pub fn meta(&self, key: &str) -> Option<serde_json::Value> {
        let txn = self.doc.transact();
        self.meta
            .get(&txn, key)
            .and_then(|value| decode_json(value, &txn))
    }

    /// Plain-data copy of the whole document.
    pub fn snapshot_view(&self) -> GraphSnapshot {
        let txn = self.doc.transact();

        let nodes = self
            .nodes
            .iter(&txn)
            .filter_map(|(key, value)| Some((key.to_string(), decode_json(value, &txn)?)))
            .collect();
        let edges = self
            .edges
            .iter(&txn)
            .filter_map(|(key, value)| Some((key.to_string(), decode_json(value, &txn)?)))
            .collect();
        let texts = self
            .node_text
            .iter(&txn)
            .filter_map(|(key, value)| match value {
                Out::YText(text) => Some((key.to_string(), text.get_string(&txn))),
                _ => None,
            })
            .collect();
        let meta = self
            .meta
            .iter(&txn)
            .filter_map(|(key, value)| Some((key.to_string(), decode_json(value, &txn)?)))
            .collect();

        GraphSnapshot {
            nodes,
            edges,
            texts,
            meta,
        }
    }

    // ==================== Sync Operations ====================

    /// Merge a remote update, logging and skipping it if malformed.
    ///
    /// Returns whether the update was applied.
    pub fn apply_update(&self, update: &[u8]) -> bool {
        self.apply_update_with(update, REMOTE_ORIGIN)
    }

    /// Merge an update under a specific origin, logging and skipping it if malformed.
    pub fn apply_update_with(&self, update: &[u8], origin: &str) -> bool {
        match self.try_apply_update_with(update, origin) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Skipping malformed update ({} bytes): {}", update.len(), e);
                false
            }
        }
    }

    /// Merge a remote update, surfacing decode and integration errors.
    pub fn try_apply_update(&self, update: &[u8]) -> Result<()> {
        self.try_apply_update_with(update, REMOTE_ORIGIN)
    }

    pub fn try_apply_update_with(&self, update: &[u8], origin: &str) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| AgoraError::Crdt(format!("Failed to decode update: {}", e)))?;

        let mut txn = self.doc.transact_mut_with(origin);
        txn.apply_update(decoded)
            .map_err(|e| AgoraError::Crdt(format!("Failed to apply update: {}", e)))?;
        Ok(())
    }

    /// Encode the current state vector for sync.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the diff between current state and a remote state vector.
    ///
    /// An empty state vector means the remote has nothing, so the full state
    /// is returned.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        if remote_state_vector.is_empty() {
            return Ok(self.encode_state_as_update());
        }
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| AgoraError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    // ==================== Observers ====================

    /// Observe committed transactions.
    ///
    /// The callback receives the transaction origin (empty when untagged) and
    /// the update bytes describing exactly that transaction.
    pub fn observe_updates<F>(&self, callback: F) -> Result<yrs::Subscription>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = txn
                    .origin()
                    .map(|o| String::from_utf8_lossy(o.as_ref()).into_owned())
                    .unwrap_or_default();
                callback(&origin, &event.update);
            })
            .map_err(|e| AgoraError::Crdt(format!("Failed to observe document updates: {:?}", e)))
    }
}

impl Default for GraphDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphDoc")
            .field("client_id", &self.client_id())
            .field("nodes", &self.node_count())
            .field("edges", &self.edge_count())
            .finish_non_exhaustive()
    }
}

/// An open, origin-tagged transaction over a [`GraphDoc`].
///
/// The transaction commits when dropped at the end of the closure passed to
/// [`GraphDoc::transact`].
pub struct GraphTxn<'doc> {
    txn: TransactionMut<'doc>,
    graph: &'doc GraphDoc,
}

impl GraphTxn<'_> {
    /// Insert or replace a node.
    pub fn set_node(&mut self, node: &NodeRecord) -> Result<()> {
        let json = serde_json::to_string(node)?;
        self.graph.nodes.insert(&mut self.txn, node.id.as_str(), json);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<NodeRecord> {
        self.graph
            .nodes
            .get(&self.txn, id)
            .and_then(|value| decode_json(value, &self.txn))
    }

    /// Remove a node together with its rich text and every edge touching it.
    ///
    /// Returns the ids of the removed edges.
    pub fn remove_node(&mut self, id: &str) -> Vec<String> {
        let dangling: Vec<String> = self
            .graph
            .edges
            .iter(&self.txn)
            .filter_map(|(key, value)| {
                let edge: EdgeRecord = decode_json(value, &self.txn)?;
                edge.touches(id).then(|| key.to_string())
            })
            .collect();

        for edge_id in &dangling {
            self.graph.edges.remove(&mut self.txn, edge_id);
        }
        self.graph.node_text.remove(&mut self.txn, id);
        self.graph.nodes.remove(&mut self.txn, id);
        dangling
    }

    /// Insert or replace an edge.
    pub fn set_edge(&mut self, edge: &EdgeRecord) -> Result<()> {
        let json = serde_json::to_string(edge)?;
        self.graph.edges.insert(&mut self.txn, edge.id.as_str(), json);
        Ok(())
    }

    pub fn remove_edge(&mut self, id: &str) -> bool {
        self.graph.edges.remove(&mut self.txn, id).is_some()
    }

    /// Attach a fresh rich text to a node, replacing any existing one.
    pub fn set_node_text(&mut self, node_id: &str, content: &str) -> TextRef {
        self.graph
            .node_text
            .insert(&mut self.txn, node_id, TextPrelim::new(content))
    }

    fn text(&self, node_id: &str) -> Option<TextRef> {
        match self.graph.node_text.get(&self.txn, node_id) {
            Some(Out::YText(text)) => Some(text),
            _ => None,
        }
    }

    /// Insert into a node's rich text, creating it if absent.
    pub fn insert_text(&mut self, node_id: &str, index: u32, chunk: &str) {
        match self.text(node_id) {
            Some(text) => text.insert(&mut self.txn, index, chunk),
            None => {
                self.set_node_text(node_id, chunk);
            }
        }
    }

    /// Append to a node's rich text, creating it if absent.
    pub fn push_text(&mut self, node_id: &str, chunk: &str) {
        match self.text(node_id) {
            Some(text) => text.push(&mut self.txn, chunk),
            None => {
                self.set_node_text(node_id, chunk);
            }
        }
    }

    pub fn delete_text(&mut self, node_id: &str, index: u32, len: u32) {
        if let Some(text) = self.text(node_id) {
            text.remove_range(&mut self.txn, index, len);
        }
    }

    pub fn set_meta(&mut self, key: &str, value: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.graph.meta.insert(&mut self.txn, key, json);
        Ok(())
    }

    pub fn remove_meta(&mut self, key: &str) -> bool {
        self.graph.meta.remove(&mut self.txn, key).is_some()
    }
}

fn decode_json<T: DeserializeOwned, Txn: ReadTxn>(value: Out, txn: &Txn) -> Option<T> {
    let json = value.to_string(txn);
    match serde_json::from_str(&json) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            log::debug!("Ignoring undecodable map entry: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn sample_node(id: &str, content: &str) -> NodeRecord {
        NodeRecord::new(id, "point")
            .with_position(1.0, 2.0)
            .with_data(serde_json::json!({ "content": content }))
    }

    #[test]
    fn test_new_doc_is_empty() {
        let doc = GraphDoc::new();
        assert_eq!(doc.node_count(), 0);
        assert_eq!(doc.edge_count(), 0);
        assert!(doc.nodes().is_empty());
        assert_eq!(doc.snapshot_view(), GraphSnapshot::default());
    }

    #[test]
    fn test_set_and_get_node() {
        let doc = GraphDoc::new();
        doc.transact_local(|txn| txn.set_node(&sample_node("p-1", "Hello")))
            .unwrap();

        let node = doc.node("p-1").unwrap();
        assert_eq!(node.content(), Some("Hello"));
        assert_eq!(node.position.x, 1.0);
        assert_eq!(doc.node_count(), 1);
    }

    #[test]
    fn test_remove_node_cascades_edges_and_text() {
        let doc = GraphDoc::new();
        doc.transact_local(|txn| {
            txn.set_node(&sample_node("a", "A"))?;
            txn.set_node(&sample_node("b", "B"))?;
            txn.set_node(&sample_node("c", "C"))?;
            txn.set_edge(&EdgeRecord::new("ab", "support", "a", "b"))?;
            txn.set_edge(&EdgeRecord::new("bc", "oppose", "b", "c"))?;
            txn.set_node_text("a", "alpha");
            Ok::<_, AgoraError>(())
        })
        .unwrap();

        let removed = doc.transact_local(|txn| txn.remove_node("a"));

        assert_eq!(removed, vec!["ab".to_string()]);
        assert!(doc.node("a").is_none());
        assert!(doc.edge("ab").is_none());
        assert!(doc.edge("bc").is_some());
        assert!(doc.node_text("a").is_none());
    }

    #[test]
    fn test_text_editing() {
        let doc = GraphDoc::new();
        doc.transact_local(|txn| {
            txn.set_node_text("p-1", "Hello");
        });
        doc.transact_local(|txn| txn.push_text("p-1", " world"));
        assert_eq!(doc.node_text("p-1").as_deref(), Some("Hello world"));

        doc.transact_local(|txn| txn.insert_text("p-1", 5, ","));
        assert_eq!(doc.node_text("p-1").as_deref(), Some("Hello, world"));

        doc.transact_local(|txn| txn.delete_text("p-1", 5, 1));
        assert_eq!(doc.node_text("p-1").as_deref(), Some("Hello world"));

        // Missing text is created on first push
        doc.transact_local(|txn| txn.push_text("p-2", "new"));
        assert_eq!(doc.node_text("p-2").as_deref(), Some("new"));
    }

    #[test]
    fn test_meta_values() {
        let doc = GraphDoc::new();
        let votes = serde_json::json!({ "up": 3, "down": 1 });
        doc.transact_local(|txn| txn.set_meta("votes:e-1", &votes))
            .unwrap();
        assert_eq!(doc.meta("votes:e-1"), Some(votes));

        assert!(doc.transact_local(|txn| txn.remove_meta("votes:e-1")));
        assert!(doc.meta("votes:e-1").is_none());
    }

    #[test]
    fn test_observer_receives_one_update_per_transaction_with_origin() {
        let doc = GraphDoc::new();
        let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = doc
            .observe_updates(move |origin, update| {
                seen_clone
                    .lock()
                    .unwrap()
                    .push((origin.to_string(), update.len()));
            })
            .unwrap();

        doc.transact("tab-a", |txn| {
            txn.set_node(&sample_node("a", "A"))?;
            txn.set_node(&sample_node("b", "B"))?;
            txn.set_node_text("a", "text");
            Ok::<_, AgoraError>(())
        })
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "tab-a");
        assert!(seen[0].1 > 0);
    }

    #[test]
    fn test_transact_encoded_bytes_reproduce_change() {
        let doc1 = GraphDoc::new();
        let (_, update) = doc1.transact_encoded(LOCAL_ORIGIN, |txn| {
            txn.set_node(&sample_node("x", "X"))
        });

        let doc2 = GraphDoc::new();
        assert!(doc2.apply_update(&update));
        assert_eq!(doc2.node("x").unwrap().content(), Some("X"));
    }

    #[test]
    fn test_malformed_update_is_skipped() {
        let doc = GraphDoc::new();
        assert!(!doc.apply_update(&[0xFF, 0xFF, 0xFF]));
        assert!(doc.try_apply_update(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_replay_skips_corrupt_records() {
        let source = GraphDoc::new();
        let (_, first) = source.transact_encoded(LOCAL_ORIGIN, |txn| {
            txn.set_node(&sample_node("a", "A"))
        });
        let (_, second) = source.transact_encoded(LOCAL_ORIGIN, |txn| {
            txn.set_node(&sample_node("b", "B"))
        });

        let corrupt = vec![0xFF, 0xFF, 0xFF];
        let (replayed, stats) = GraphDoc::replay(
            None,
            [first.as_slice(), corrupt.as_slice(), second.as_slice()],
        );

        assert_eq!(stats.applied, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(replayed.snapshot_view(), source.snapshot_view());
    }

    #[test]
    fn test_encode_diff() {
        let doc1 = GraphDoc::new();
        let doc2 = GraphDoc::new();

        doc1.transact_local(|txn| txn.set_node(&sample_node("a", "A")))
            .unwrap();
        doc2.apply_update(&doc1.encode_state_as_update());

        let sv2 = doc2.encode_state_vector();
        doc1.transact_local(|txn| txn.set_node(&sample_node("b", "B")))
            .unwrap();

        let diff = doc1.encode_diff(&sv2).unwrap();
        doc2.apply_update(&diff);
        assert_eq!(doc2.snapshot_view(), doc1.snapshot_view());

        // Empty state vector yields the full state
        let full = doc1.encode_diff(&[]).unwrap();
        let doc3 = GraphDoc::new();
        doc3.apply_update(&full);
        assert_eq!(doc3.node_count(), 2);
    }
}
