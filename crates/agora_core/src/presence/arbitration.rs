//! Write arbitration between sessions of the same user.
//!
//! When one user has several connections open, only the session whose group
//! contains the lowest client id may write. Tabs inside that session all
//! write; other sessions observe. The decision is recomputed from presence
//! states, so a closed session drops out as soon as its states disappear.
//!
//! The winning session is remembered in a [`SessionLedger`] so a new tab of
//! an already-active session keeps write access while it is still announcing
//! itself.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use super::state::PresenceState;
use crate::error::Result;

/// Everything one arbitration decision looks at.
#[derive(Debug, Clone, Copy)]
pub struct ArbitrationInput<'a> {
    /// All presence states, `None` when awareness is unavailable
    pub states: Option<&'a HashMap<u64, PresenceState>>,
    pub own_client_id: u64,
    pub user_id: &'a str,
    pub session_id: &'a str,
    /// Session previously recorded as the writer for this user
    pub adopted_session: Option<&'a str>,
}

/// Lowest client id per session among `user_id`'s published states.
pub fn session_leaders(states: &HashMap<u64, PresenceState>, user_id: &str) -> BTreeMap<String, u64> {
    let mut leaders: BTreeMap<String, u64> = BTreeMap::new();
    for (&client_id, state) in states {
        let Some(user) = state.user.as_ref().filter(|u| u.id == user_id) else {
            continue;
        };
        leaders
            .entry(user.session_id.clone())
            .and_modify(|leader| *leader = (*leader).min(client_id))
            .or_insert(client_id);
    }
    leaders
}

/// Session whose group holds the numerically lowest client id.
pub fn winning_session(states: &HashMap<u64, PresenceState>, user_id: &str) -> Option<String> {
    session_leaders(states, user_id)
        .into_iter()
        .min_by_key(|(_, leader)| *leader)
        .map(|(session, _)| session)
}

/// Decide whether the local connection may write.
pub fn evaluate(input: &ArbitrationInput<'_>) -> bool {
    let Some(states) = input.states else {
        return false;
    };

    let published = states
        .get(&input.own_client_id)
        .is_some_and(|state| state.is_user(input.user_id));

    if published {
        return winning_session(states, input.user_id).as_deref() == Some(input.session_id);
    }

    // Not announced yet: an older connection from another session wins
    let older_other_session = states.iter().any(|(&client_id, state)| {
        client_id < input.own_client_id
            && state.is_user(input.user_id)
            && state.session_id() != Some(input.session_id)
    });
    if older_other_session {
        return false;
    }

    if winning_session(states, input.user_id).as_deref() == Some(input.session_id) {
        return true;
    }
    input.adopted_session == Some(input.session_id)
}

/// Remembers which session last won arbitration for a user.
pub trait SessionLedger: Send + Sync {
    fn adopted_session(&self, user_id: &str) -> Result<Option<String>>;

    fn record_winner(&self, user_id: &str, session_id: &str) -> Result<()>;
}

/// Ledger kept in memory (tests, short-lived clients).
#[derive(Debug, Default)]
pub struct MemorySessionLedger {
    sessions: RwLock<HashMap<String, String>>,
}

impl MemorySessionLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionLedger for MemorySessionLedger {
    fn adopted_session(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .cloned())
    }

    fn record_winner(&self, user_id: &str, session_id: &str) -> Result<()> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), session_id.to_string());
        Ok(())
    }
}

/// Ledger persisted as a small JSON file (`{"userId": "sessionId"}`).
#[derive(Debug)]
pub struct FileSessionLedger {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileSessionLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(HashMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionLedger for FileSessionLedger {
    fn adopted_session(&self, user_id: &str) -> Result<Option<String>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.remove(user_id))
    }

    fn record_winner(&self, user_id: &str, session_id: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let mut sessions = self.load()?;
        if sessions.get(user_id).map(String::as_str) == Some(session_id) {
            return Ok(());
        }
        sessions.insert(user_id.to_string(), session_id.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&sessions)?)?;
        Ok(())
    }
}

#[cfg(feature = "runtime")]
pub use arbiter::{ArbiterHandle, WriteArbiter};

#[cfg(feature = "runtime")]
mod arbiter {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::{mpsc, watch};
    use tokio::task::JoinHandle;

    use super::{ArbitrationInput, SessionLedger, evaluate, winning_session};
    use crate::config::DEFAULT_ARBITRATION_DEBOUNCE_MS;
    use crate::presence::awareness::{AwarenessChange, AwarenessProvider};

    /// Debounced arbitration loop over an awareness instance.
    pub struct WriteArbiter<A: AwarenessProvider + 'static> {
        awareness: Arc<A>,
        ledger: Arc<dyn SessionLedger>,
        user_id: String,
        session_id: String,
        debounce: Duration,
    }

    impl<A: AwarenessProvider + 'static> WriteArbiter<A> {
        pub fn new(
            awareness: Arc<A>,
            ledger: Arc<dyn SessionLedger>,
            user_id: impl Into<String>,
            session_id: impl Into<String>,
        ) -> Self {
            Self {
                awareness,
                ledger,
                user_id: user_id.into(),
                session_id: session_id.into(),
                debounce: Duration::from_millis(DEFAULT_ARBITRATION_DEBOUNCE_MS),
            }
        }

        pub fn with_debounce(mut self, debounce: Duration) -> Self {
            self.debounce = debounce;
            self
        }

        /// Evaluate once against the current presence states.
        ///
        /// The winning session (if any) is written to the ledger.
        pub fn evaluate_now(&self) -> bool {
            let states = self.awareness.states();
            let adopted = self.ledger.adopted_session(&self.user_id).unwrap_or_else(|e| {
                log::warn!("Failed to read session ledger: {}", e);
                None
            });

            let can_write = evaluate(&ArbitrationInput {
                states: states.as_ref(),
                own_client_id: self.awareness.client_id(),
                user_id: &self.user_id,
                session_id: &self.session_id,
                adopted_session: adopted.as_deref(),
            });

            if let Some(winner) = states.as_ref().and_then(|s| winning_session(s, &self.user_id))
                && adopted.as_deref() != Some(winner.as_str())
                && let Err(e) = self.ledger.record_winner(&self.user_id, &winner)
            {
                log::warn!("Failed to record session winner: {}", e);
            }

            can_write
        }

        /// Start re-evaluating on every awareness change.
        ///
        /// Must be called inside a tokio runtime. The loop runs until the
        /// returned handle is stopped or dropped.
        pub fn start(self) -> ArbiterHandle {
            let initial = self.evaluate_now();
            let (can_write_tx, can_write_rx) = watch::channel(initial);
            let (notify_tx, notify_rx) = mpsc::unbounded_channel::<()>();

            let observer_id = self.awareness.observe(Arc::new(move |_: &AwarenessChange| {
                let _ = notify_tx.send(());
            }));

            let awareness: Arc<dyn AwarenessProvider> = self.awareness.clone();
            log::debug!(
                "Write arbiter started for session {} (can_write={})",
                self.session_id,
                initial
            );
            let task = tokio::spawn(async move {
                self.run(notify_rx, can_write_tx).await;
            });

            ArbiterHandle {
                can_write: can_write_rx,
                task,
                awareness,
                observer_id,
            }
        }

        async fn run(self, mut notify: mpsc::UnboundedReceiver<()>, can_write: watch::Sender<bool>) {
            while notify.recv().await.is_some() {
                // Trailing debounce: wait for a quiet window before deciding
                loop {
                    match tokio::time::timeout(self.debounce, notify.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }

                let next = self.evaluate_now();
                can_write.send_if_modified(|current| {
                    if *current != next {
                        log::debug!(
                            "Write arbitration for session {}: can_write={}",
                            self.session_id,
                            next
                        );
                        *current = next;
                        true
                    } else {
                        false
                    }
                });
            }
        }
    }

    /// Running arbitration loop. Dropping it stops the loop.
    pub struct ArbiterHandle {
        can_write: watch::Receiver<bool>,
        task: JoinHandle<()>,
        awareness: Arc<dyn AwarenessProvider>,
        observer_id: u64,
    }

    impl ArbiterHandle {
        /// Latest decision.
        pub fn can_write(&self) -> bool {
            *self.can_write.borrow()
        }

        /// Receiver notified whenever the decision changes.
        pub fn subscribe(&self) -> watch::Receiver<bool> {
            self.can_write.clone()
        }

        /// Stop re-evaluating. Same as dropping the handle.
        pub fn stop(self) {
            drop(self);
        }
    }

    impl Drop for ArbiterHandle {
        fn drop(&mut self) {
            self.awareness.unobserve(self.observer_id);
            self.task.abort();
        }
    }

    impl std::fmt::Debug for ArbiterHandle {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ArbiterHandle")
                .field("can_write", &self.can_write())
                .field("observer_id", &self.observer_id)
                .finish_non_exhaustive()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::state::PresenceUser;

    fn state(user_id: &str, session: &str) -> PresenceState {
        PresenceState::with_user(PresenceUser {
            id: user_id.into(),
            name: String::new(),
            color: String::new(),
            session_id: session.into(),
            tab_id: format!("tab-{session}"),
        })
    }

    fn decide(states: &HashMap<u64, PresenceState>, own: u64, session: &str) -> bool {
        evaluate(&ArbitrationInput {
            states: Some(states),
            own_client_id: own,
            user_id: "u1",
            session_id: session,
            adopted_session: None,
        })
    }

    #[test]
    fn test_same_session_tabs_both_write() {
        let states = HashMap::from([(10, state("u1", "s1")), (20, state("u1", "s1"))]);
        assert!(decide(&states, 10, "s1"));
        assert!(decide(&states, 20, "s1"));
    }

    #[test]
    fn test_cross_session_exactly_one_writes() {
        let states = HashMap::from([(10, state("u1", "s1")), (20, state("u1", "s2"))]);
        assert!(decide(&states, 10, "s1"));
        assert!(!decide(&states, 20, "s2"));
    }

    #[test]
    fn test_leader_is_lowest_id_in_group() {
        // s2 has a tab with id 5, so it wins even though s1 has 10
        let states = HashMap::from([
            (10, state("u1", "s1")),
            (30, state("u1", "s2")),
            (5, state("u1", "s2")),
        ]);
        assert!(!decide(&states, 10, "s1"));
        assert!(decide(&states, 30, "s2"));
    }

    #[test]
    fn test_other_users_ignored() {
        let states = HashMap::from([(1, state("u2", "other")), (10, state("u1", "s1"))]);
        assert!(decide(&states, 10, "s1"));
    }

    #[test]
    fn test_unavailable_fails_closed() {
        assert!(!evaluate(&ArbitrationInput {
            states: None,
            own_client_id: 1,
            user_id: "u1",
            session_id: "s1",
            adopted_session: Some("s1"),
        }));
    }

    #[test]
    fn test_unpublished_with_older_other_session_fails_closed() {
        let states = HashMap::from([(5, state("u1", "s2"))]);
        assert!(!evaluate(&ArbitrationInput {
            states: Some(&states),
            own_client_id: 10,
            user_id: "u1",
            session_id: "s1",
            // Adoption never overrides an older session
            adopted_session: Some("s1"),
        }));
    }

    #[test]
    fn test_unpublished_joins_leading_session() {
        let states = HashMap::from([(5, state("u1", "s1")), (8, state("u1", "s2"))]);
        assert!(decide(&states, 10, "s1"));
    }

    #[test]
    fn test_unpublished_alone_needs_adoption() {
        let states = HashMap::new();
        assert!(!decide(&states, 10, "s1"));
        assert!(evaluate(&ArbitrationInput {
            states: Some(&states),
            own_client_id: 10,
            user_id: "u1",
            session_id: "s1",
            adopted_session: Some("s1"),
        }));
    }

    #[test]
    fn test_winning_session() {
        let states = HashMap::from([(7, state("u1", "s2")), (3, state("u1", "s1"))]);
        assert_eq!(winning_session(&states, "u1").as_deref(), Some("s1"));
        assert_eq!(winning_session(&states, "nobody"), None);
    }

    #[test]
    fn test_file_ledger_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sessions.json");

        let ledger = FileSessionLedger::new(&path);
        assert_eq!(ledger.adopted_session("u1").unwrap(), None);
        ledger.record_winner("u1", "s1").unwrap();

        let reopened = FileSessionLedger::new(&path);
        assert_eq!(reopened.adopted_session("u1").unwrap().as_deref(), Some("s1"));
    }

    #[test]
    fn test_memory_ledger() {
        let ledger = MemorySessionLedger::new();
        ledger.record_winner("u1", "s1").unwrap();
        ledger.record_winner("u1", "s2").unwrap();
        assert_eq!(ledger.adopted_session("u1").unwrap().as_deref(), Some("s2"));
    }

    #[test]
    fn test_silent_older_session_stops_blocking_after_timeout() {
        use crate::presence::awareness::{Awareness, AwarenessProvider};

        let mine = Awareness::new(10);
        mine.set_local_state(Some(state("u1", "s1")));
        let crashed = Awareness::new(5);
        crashed.set_local_state(Some(state("u1", "s2")));
        mine.apply_update(&crashed.encode_full_update().unwrap()).unwrap();

        let can_write = |awareness: &Awareness| {
            let states = awareness.states();
            evaluate(&ArbitrationInput {
                states: states.as_ref(),
                own_client_id: 10,
                user_id: "u1",
                session_id: "s1",
                adopted_session: None,
            })
        };
        assert!(!can_write(&mine));

        // The other session never renews its state
        let timeout = std::time::Duration::from_secs(30);
        let seen_at = mine.last_updated(5).unwrap();
        mine.remove_outdated_at(seen_at + 30_000, timeout);
        assert!(can_write(&mine));
    }

    #[cfg(feature = "runtime")]
    mod runtime {
        use std::sync::Arc;
        use std::time::Duration;

        use super::state;
        use crate::presence::arbitration::{MemorySessionLedger, SessionLedger, WriteArbiter};
        use crate::presence::awareness::{Awareness, AwarenessProvider};

        fn published(client_id: u64, session: &str) -> Arc<Awareness> {
            let awareness = Arc::new(Awareness::new(client_id));
            awareness.set_local_state(Some(state("u1", session)));
            awareness
        }

        #[tokio::test(start_paused = true)]
        async fn test_arbiter_demotes_after_debounce() {
            let mine = published(10, "s1");
            let ledger: Arc<dyn SessionLedger> = Arc::new(MemorySessionLedger::new());
            let handle = WriteArbiter::new(mine.clone(), ledger.clone(), "u1", "s1")
                .with_debounce(Duration::from_millis(1_000))
                .start();
            assert!(handle.can_write());
            assert_eq!(ledger.adopted_session("u1").unwrap().as_deref(), Some("s1"));

            // An older session of the same user shows up
            let older = published(5, "s2");
            mine.apply_update(&older.encode_full_update().unwrap()).unwrap();

            tokio::time::sleep(Duration::from_millis(500)).await;
            assert!(handle.can_write(), "decision must wait for the debounce window");

            let mut rx = handle.subscribe();
            tokio::time::timeout(Duration::from_secs(5), rx.changed())
                .await
                .unwrap()
                .unwrap();
            assert!(!*rx.borrow());
            assert_eq!(ledger.adopted_session("u1").unwrap().as_deref(), Some("s2"));
        }

        #[tokio::test(start_paused = true)]
        async fn test_arbiter_fails_closed_when_unavailable() {
            let mine = published(10, "s1");
            let handle = WriteArbiter::new(mine.clone(), Arc::new(MemorySessionLedger::new()), "u1", "s1")
                .with_debounce(Duration::from_millis(100))
                .start();
            assert!(handle.can_write());

            let mut rx = handle.subscribe();
            mine.set_available(false);
            tokio::time::timeout(Duration::from_secs(5), rx.changed())
                .await
                .unwrap()
                .unwrap();
            assert!(!handle.can_write());
        }
    }
}
