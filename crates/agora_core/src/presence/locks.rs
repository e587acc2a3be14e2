//! Advisory editing locks carried in presence state.
//!
//! Nothing is stored centrally: every query scans the current presence
//! states. A lock older than the TTL is ignored, so a crashed tab never
//! leaves an entity stuck. Locks held by the observer's own session (any
//! tab) never block it. Transport and storage never enforce these locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::awareness::AwarenessProvider;
use super::state::{EDIT_LOCK_KIND, LockEntry, PresenceState, SessionIdentity};
use crate::config::DEFAULT_LOCK_TTL_MS;

/// Who holds a lock, for UI attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOwner {
    pub client_id: u64,
    pub user_id: Option<String>,
    pub name: Option<String>,
    pub color: Option<String>,
    pub session_id: String,
    pub tab_id: String,
    pub since: i64,
}

/// Lock state of one entity as seen by one observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked,
    LockedBySelf,
    LockedByOther { owner: LockOwner },
}

impl LockStatus {
    /// Whether the observer should treat the entity as read-only.
    pub fn blocks(&self) -> bool {
        matches!(self, LockStatus::LockedByOther { .. })
    }
}

/// Evaluate the lock on `entity_id` from a snapshot of presence states.
///
/// `None` states (awareness unavailable) evaluate as unlocked. When several
/// other sessions hold live locks the freshest one is reported, ties going
/// to the lower client id.
pub fn lock_status(
    states: Option<&HashMap<u64, PresenceState>>,
    entity_id: &str,
    own_session_id: &str,
    now_ms: i64,
    ttl_ms: u64,
) -> LockStatus {
    let Some(states) = states else {
        return LockStatus::Unlocked;
    };

    let mut held_by_self = false;
    let mut other: Option<(u64, &PresenceState, &LockEntry)> = None;

    for (&client_id, state) in states {
        let Some(entry) = state.locks.get(entity_id) else {
            continue;
        };
        if entry.is_expired(now_ms, ttl_ms) {
            continue;
        }
        if entry.session_id == own_session_id {
            held_by_self = true;
            continue;
        }
        let replace = match other {
            None => true,
            Some((best_id, _, best)) => {
                entry.ts > best.ts || (entry.ts == best.ts && client_id < best_id)
            }
        };
        if replace {
            other = Some((client_id, state, entry));
        }
    }

    match other {
        Some((client_id, state, entry)) => LockStatus::LockedByOther {
            owner: LockOwner {
                client_id,
                user_id: state.user.as_ref().map(|u| u.id.clone()),
                name: state.user.as_ref().map(|u| u.name.clone()),
                color: state.user.as_ref().map(|u| u.color.clone()),
                session_id: entry.session_id.clone(),
                tab_id: entry.tab_id.clone(),
                since: entry.ts,
            },
        },
        None if held_by_self => LockStatus::LockedBySelf,
        None => LockStatus::Unlocked,
    }
}

/// Lock operations for one local connection.
pub struct EditLocks<A: AwarenessProvider> {
    awareness: Arc<A>,
    identity: SessionIdentity,
    ttl: Duration,
}

impl<A: AwarenessProvider> EditLocks<A> {
    pub fn new(awareness: Arc<A>, identity: SessionIdentity) -> Self {
        Self::with_ttl(awareness, identity, Duration::from_millis(DEFAULT_LOCK_TTL_MS))
    }

    pub fn with_ttl(awareness: Arc<A>, identity: SessionIdentity, ttl: Duration) -> Self {
        Self {
            awareness,
            identity,
            ttl,
        }
    }

    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Current lock state of an entity for this connection.
    pub fn status(&self, entity_id: &str) -> LockStatus {
        let states = self.awareness.states();
        lock_status(
            states.as_ref(),
            entity_id,
            &self.identity.session_id,
            Self::now_ms(),
            self.ttl.as_millis() as u64,
        )
    }

    /// Take the lock on an entity.
    ///
    /// Returns false without writing anything when another session holds a
    /// live lock on it.
    pub fn lock_node(&self, entity_id: &str) -> bool {
        if self.status(entity_id).blocks() {
            log::debug!("Lock on '{}' refused: held by another session", entity_id);
            return false;
        }

        let entry = LockEntry {
            kind: EDIT_LOCK_KIND.to_string(),
            ts: Self::now_ms(),
            session_id: self.identity.session_id.clone(),
            tab_id: self.identity.tab_id.clone(),
        };
        self.awareness.update_local_state(&mut |state: &mut PresenceState| {
            state.locks.insert(entity_id.to_string(), entry.clone());
        });
        true
    }

    /// Release this connection's lock on an entity. Returns whether one was held.
    pub fn unlock_node(&self, entity_id: &str) -> bool {
        let held = self
            .awareness
            .local_state()
            .is_some_and(|state| state.locks.contains_key(entity_id));
        if held {
            self.awareness.update_local_state(&mut |state: &mut PresenceState| {
                state.locks.remove(entity_id);
            });
        }
        held
    }

    pub fn is_locked_for_me(&self, entity_id: &str) -> bool {
        self.status(entity_id).blocks()
    }

    /// The session blocking this connection on an entity, if any.
    pub fn get_lock_owner(&self, entity_id: &str) -> Option<LockOwner> {
        match self.status(entity_id) {
            LockStatus::LockedByOther { owner } => Some(owner),
            _ => None,
        }
    }

    /// Re-stamp every lock this connection holds so long edits don't expire.
    pub fn refresh_locks(&self) -> usize {
        let held = self
            .awareness
            .local_state()
            .map_or(0, |state| state.locks.len());
        if held > 0 {
            let now = Self::now_ms();
            self.awareness.update_local_state(&mut |state: &mut PresenceState| {
                for entry in state.locks.values_mut() {
                    entry.ts = now;
                }
            });
        }
        held
    }

    /// Drop every lock this connection holds.
    pub fn release_all(&self) {
        let held = self
            .awareness
            .local_state()
            .is_some_and(|state| !state.locks.is_empty());
        if held {
            self.awareness.update_local_state(&mut |state: &mut PresenceState| state.locks.clear());
        }
    }
}

impl<A: AwarenessProvider> std::fmt::Debug for EditLocks<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditLocks")
            .field("identity", &self.identity)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::awareness::Awareness;
    use crate::presence::state::PresenceUser;

    const TTL: u64 = 15_000;

    fn state_with_lock(session: &str, tab: &str, entity: &str, ts: i64) -> PresenceState {
        let mut state = PresenceState::with_user(PresenceUser {
            id: format!("user-{session}"),
            name: format!("Name {session}"),
            color: "#abcdef".into(),
            session_id: session.into(),
            tab_id: tab.into(),
        });
        state.locks.insert(
            entity.into(),
            LockEntry {
                kind: EDIT_LOCK_KIND.into(),
                ts,
                session_id: session.into(),
                tab_id: tab.into(),
            },
        );
        state
    }

    #[test]
    fn test_same_session_other_tab_is_self() {
        let states = HashMap::from([(7, state_with_lock("s1", "tab-b", "n1", 1_000))]);
        let status = lock_status(Some(&states), "n1", "s1", 2_000, TTL);
        assert_eq!(status, LockStatus::LockedBySelf);
        assert!(!status.blocks());
    }

    #[test]
    fn test_other_session_blocks() {
        let states = HashMap::from([(7, state_with_lock("s2", "tab-x", "n1", 1_000))]);
        match lock_status(Some(&states), "n1", "s1", 2_000, TTL) {
            LockStatus::LockedByOther { owner } => {
                assert_eq!(owner.client_id, 7);
                assert_eq!(owner.name.as_deref(), Some("Name s2"));
                assert_eq!(owner.session_id, "s2");
            }
            other => panic!("expected LockedByOther, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_lock_ignored() {
        let states = HashMap::from([(7, state_with_lock("s2", "tab-x", "n1", 1_000))]);
        let status = lock_status(Some(&states), "n1", "s1", 1_000 + TTL as i64 + 1, TTL);
        assert_eq!(status, LockStatus::Unlocked);
    }

    #[test]
    fn test_unavailable_awareness_is_unlocked() {
        assert_eq!(
            lock_status(None, "n1", "s1", 0, TTL),
            LockStatus::Unlocked
        );
    }

    #[test]
    fn test_freshest_other_lock_reported() {
        let states = HashMap::from([
            (3, state_with_lock("s2", "t2", "n1", 1_000)),
            (9, state_with_lock("s3", "t3", "n1", 1_500)),
            (4, state_with_lock("s1", "t1", "n1", 1_900)),
        ]);
        match lock_status(Some(&states), "n1", "s1", 2_000, TTL) {
            LockStatus::LockedByOther { owner } => assert_eq!(owner.client_id, 9),
            other => panic!("expected LockedByOther, got {:?}", other),
        }
    }

    #[test]
    fn test_edit_locks_round_trip() {
        let mine = Arc::new(Awareness::new(1));
        let theirs = Arc::new(Awareness::new(2));
        let my_locks = EditLocks::new(mine.clone(), SessionIdentity::new("s1", "t1"));
        let their_locks = EditLocks::new(theirs.clone(), SessionIdentity::new("s2", "t2"));

        assert!(my_locks.lock_node("n1"));
        theirs
            .apply_update(&mine.encode_full_update().unwrap())
            .unwrap();

        assert!(their_locks.is_locked_for_me("n1"));
        assert!(!my_locks.is_locked_for_me("n1"));
        assert_eq!(their_locks.get_lock_owner("n1").unwrap().client_id, 1);
        assert!(!their_locks.lock_node("n1"));

        assert!(my_locks.unlock_node("n1"));
        assert!(!my_locks.unlock_node("n1"));
        theirs
            .apply_update(&mine.encode_full_update().unwrap())
            .unwrap();
        assert!(!their_locks.is_locked_for_me("n1"));
    }

    #[test]
    fn test_refresh_and_release() {
        let awareness = Arc::new(Awareness::new(1));
        let locks = EditLocks::new(awareness.clone(), SessionIdentity::new("s1", "t1"));

        assert_eq!(locks.refresh_locks(), 0);
        locks.lock_node("a");
        locks.lock_node("b");
        assert_eq!(locks.refresh_locks(), 2);

        locks.release_all();
        assert!(awareness.local_state().unwrap().locks.is_empty());
    }
}
