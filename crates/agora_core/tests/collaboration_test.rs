//! End-to-end behavior of the collaboration core without a network:
//! replicas exchange update bytes through an update log store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agora_core::AgoraError;
use agora_core::crdt::{
    Compactor, EdgeRecord, GraphDoc, MemoryStorage, NodeRecord, OriginUndoManager,
    REMOTE_ORIGIN, SqliteStorage, UpdateLogStore, load_state, replay_document,
};
use agora_core::presence::{
    ArbitrationInput, Awareness, AwarenessProvider, EditLocks, PresenceState, PresenceUser,
    SessionIdentity, evaluate,
};

/// Commit a local edit and return its update bytes.
fn edit<F>(doc: &GraphDoc, f: F) -> Vec<u8>
where
    F: FnOnce(&mut agora_core::crdt::GraphTxn<'_>),
{
    let origin = doc.local_origin().to_string();
    let ((), update) = doc.transact_encoded(&origin, f);
    update
}

fn append_and_compact(store: &dyn UpdateLogStore, compactor: &Compactor, doc_id: &str, update: &[u8]) {
    store.append(doc_id, update, Some("user-1")).unwrap();
    compactor.maybe_compact(store, doc_id).unwrap();
}

#[test]
fn test_concurrent_edits_converge() {
    let a = GraphDoc::with_client_id(1);
    let b = GraphDoc::with_client_id(2);

    let ua = edit(&a, |txn| {
        txn.set_node(&NodeRecord::new("claim", "claim").with_position(0.0, 0.0))
            .unwrap();
        txn.set_node_text("claim", "Taxes should rise");
    });
    let ub = edit(&b, |txn| {
        txn.set_node(&NodeRecord::new("objection", "objection")).unwrap();
        txn.set_meta("title", &serde_json::json!("Budget")).unwrap();
    });
    let ua2 = edit(&a, |txn| {
        txn.set_edge(&EdgeRecord::new("e1", "attacks", "objection", "claim"))
            .unwrap();
    });

    // Different delivery orders
    b.apply_update(&ua2);
    b.apply_update(&ua);
    a.apply_update(&ub);

    assert_eq!(a.snapshot_view(), b.snapshot_view());
    assert_eq!(a.node_count(), 2);
    assert_eq!(b.edge("e1").unwrap().source, "objection");
}

#[test]
fn test_reapplying_updates_is_idempotent() {
    let a = GraphDoc::with_client_id(1);
    let update = edit(&a, |txn| {
        txn.set_node_text("p", "Hello");
    });

    let b = GraphDoc::with_client_id(2);
    b.apply_update(&update);
    let once = b.snapshot_view();
    b.apply_update(&update);
    b.apply_update(&a.encode_state_as_update());

    assert_eq!(b.snapshot_view(), once);
    assert_eq!(b.node_text("p").as_deref(), Some("Hello"));
}

#[test]
fn test_hello_world_through_the_log() {
    let store = SqliteStorage::in_memory().unwrap();
    let compactor = Compactor::default();

    // Client A creates a point with text
    let a = GraphDoc::with_client_id(1);
    let u1 = edit(&a, |txn| {
        txn.set_node(&NodeRecord::new("p-1", "point")).unwrap();
        txn.set_node_text("p-1", "Hello");
    });
    append_and_compact(&store, &compactor, "debate", &u1);

    // Client B joins from stored state and appends to the text
    let bundle = load_state(&store, "debate").unwrap();
    let (b, stats) = GraphDoc::replay(
        bundle.snapshot.as_ref().map(|s| s.state.as_slice()),
        bundle.updates.iter().map(|u| u.data.as_slice()),
    );
    assert_eq!(stats.skipped, 0);
    assert_eq!(b.node_text("p-1").as_deref(), Some("Hello"));

    let u2 = edit(&b, |txn| txn.push_text("p-1", " world"));
    append_and_compact(&store, &compactor, "debate", &u2);

    // A receives B's edit live
    a.apply_update(&u2);
    assert_eq!(a.node_text("p-1").as_deref(), Some("Hello world"));

    // A fresh client rebuilds the same text from storage
    let (fresh, _) = replay_document(&store, "debate").unwrap();
    assert_eq!(fresh.node_text("p-1").as_deref(), Some("Hello world"));
    assert_eq!(fresh.snapshot_view(), a.snapshot_view());
}

#[test]
fn test_compaction_after_31_updates() {
    let store = MemoryStorage::new();
    let compactor = Compactor::default();
    let doc = GraphDoc::with_client_id(7);

    for i in 0..31 {
        let update = edit(&doc, |txn| {
            txn.set_node(&NodeRecord::new(format!("n{i}"), "point")).unwrap();
        });
        append_and_compact(&store, &compactor, "d", &update);
        if i < 30 {
            assert!(store.load_snapshot("d").unwrap().is_none());
        }
    }

    let snapshot = store.load_snapshot("d").unwrap().expect("snapshot written");
    assert_eq!(store.count_for("d").unwrap(), 3);

    let tail = store.list_since("d", None).unwrap();
    assert!(tail.iter().all(|r| snapshot.cursor() < r.cursor()));

    let (replayed, _) = replay_document(&store, "d").unwrap();
    assert_eq!(replayed.snapshot_view(), doc.snapshot_view());
    assert_eq!(replayed.node_count(), 31);
}

#[test]
fn test_snapshot_equivalent_to_full_log() {
    let store = SqliteStorage::in_memory().unwrap();
    let doc = GraphDoc::with_client_id(3);
    for i in 0..12 {
        let update = edit(&doc, |txn| {
            txn.set_node_text("p", &format!("version {i}"));
            txn.set_meta("rev", &serde_json::json!(i)).unwrap();
        });
        store.append("d", &update, None).unwrap();
    }

    let (before, _) = replay_document(&store, "d").unwrap();
    Compactor::new(5, 2).compact(&store, "d").unwrap().unwrap();
    let (after, _) = replay_document(&store, "d").unwrap();

    assert_eq!(before.snapshot_view(), after.snapshot_view());
    assert_eq!(after.node_text("p").as_deref(), Some("version 11"));
}

#[test]
fn test_oversized_update_rejected() {
    let store = SqliteStorage::in_memory().unwrap();
    store.append("d", b"\x00\x00", None).unwrap();

    let err = store.append("d", &vec![0u8; 1_000_001], None).unwrap_err();
    assert!(matches!(
        err,
        AgoraError::PayloadTooLarge {
            size: 1_000_001,
            max: 1_000_000
        }
    ));
    assert_eq!(store.count_for("d").unwrap(), 1);

    // The limit itself is accepted
    let memory = MemoryStorage::new();
    assert!(memory.append("d", &vec![0u8; 1_000_000], None).is_ok());
}

#[test]
fn test_malformed_record_skipped_on_replay() {
    let store = MemoryStorage::new();
    let doc = GraphDoc::with_client_id(1);
    let good = edit(&doc, |txn| {
        txn.set_node(&NodeRecord::new("ok", "point")).unwrap();
    });
    store.append("d", b"garbage", None).unwrap();
    store.append("d", &good, None).unwrap();

    let (replayed, stats) = replay_document(&store, "d").unwrap();
    assert_eq!(stats.skipped, 1);
    assert!(replayed.node("ok").is_some());
}

#[test]
fn test_undo_is_scoped_to_each_tab() {
    let tab_a = GraphDoc::with_client_id(1).with_local_origin("tab-a");
    let tab_b = GraphDoc::with_client_id(2).with_local_origin("tab-b");
    let mut undo_a = OriginUndoManager::with_origins(&tab_a, ["tab-a"], Duration::ZERO);

    let ua = edit(&tab_a, |txn| {
        txn.set_node(&NodeRecord::new("a", "point")).unwrap();
    });
    let ub = edit(&tab_b, |txn| {
        txn.set_node(&NodeRecord::new("b", "point")).unwrap();
    });
    tab_a.apply_update(&ub);
    tab_b.apply_update(&ua);

    // Undo in A reverts only A's node; the revert travels like any edit
    let sub_updates = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = sub_updates.clone();
    let _sub = tab_a
        .observe_updates(move |origin, update| {
            if origin != REMOTE_ORIGIN {
                sink.lock().unwrap().push(update.to_vec());
            }
        })
        .unwrap();
    assert!(undo_a.undo().unwrap());
    for update in sub_updates.lock().unwrap().iter() {
        tab_b.apply_update(update);
    }

    for doc in [&tab_a, &tab_b] {
        assert!(doc.node("a").is_none());
        assert!(doc.node("b").is_some());
    }
}

#[test]
fn test_locks_between_two_sessions() {
    let alice = Arc::new(Awareness::new(10));
    let bob = Arc::new(Awareness::new(20));
    let alice_locks = EditLocks::new(alice.clone(), SessionIdentity::new("s-alice", "t1"));
    let alice_other_tab = EditLocks::new(alice.clone(), SessionIdentity::new("s-alice", "t2"));
    let bob_locks = EditLocks::new(bob.clone(), SessionIdentity::new("s-bob", "t1"));

    assert!(alice_locks.lock_node("p-1"));
    bob.apply_update(&alice.encode_full_update().unwrap()).unwrap();

    assert!(!alice_other_tab.is_locked_for_me("p-1"));
    assert!(bob_locks.is_locked_for_me("p-1"));
    assert!(!bob_locks.lock_node("p-1"));
    assert!(bob_locks.lock_node("p-2"));

    // Alice disconnects: her state goes away with her
    bob.remove_states(&[10]);
    assert!(!bob_locks.is_locked_for_me("p-1"));
}

#[test]
fn test_arbitration_picks_one_session() {
    let user = |session: &str| {
        PresenceState::with_user(PresenceUser {
            id: "u1".into(),
            name: "Ann".into(),
            color: "#f00".into(),
            session_id: session.into(),
            tab_id: "t".into(),
        })
    };
    let states = HashMap::from([(4, user("laptop")), (9, user("phone")), (12, user("laptop"))]);

    let decide = |own: u64, session: &str| {
        evaluate(&ArbitrationInput {
            states: Some(&states),
            own_client_id: own,
            user_id: "u1",
            session_id: session,
            adopted_session: None,
        })
    };
    assert!(decide(4, "laptop"));
    assert!(decide(12, "laptop"));
    assert!(!decide(9, "phone"));

    let unavailable = Awareness::new(4);
    unavailable.set_local_state(Some(user("laptop")));
    unavailable.set_available(false);
    assert!(!evaluate(&ArbitrationInput {
        states: unavailable.states().as_ref(),
        own_client_id: 4,
        user_id: "u1",
        session_id: "laptop",
        adopted_session: Some("laptop"),
    }));
}
