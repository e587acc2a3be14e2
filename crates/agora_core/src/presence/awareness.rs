//! Awareness: ephemeral per-connection presence with y-protocols framing.
//!
//! Every peer keeps the latest [`PresenceState`] per client id. A state wins
//! over the stored one when its clock is higher; a `null` state removes the
//! client. States are never persisted.
//!
//! Remote states that go unrenewed for longer than the presence timeout are
//! dropped by [`Awareness::remove_outdated`], so a live client has to renew
//! its own state (see [`Awareness::renew_local_state`]) more often than that.
//!
//! # Wire format
//!
//! ```text
//! varUint(count)
//! count × { varUint(clientId) varUint(clock) varString(json | "null") }
//! ```
//!
//! Lock and arbitration protocols depend only on [`AwarenessProvider`], so
//! tests can inject an in-memory fake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use super::state::PresenceState;
use crate::crdt::sync::{read_var_string, read_var_uint, write_var_string, write_var_uint};
use crate::error::{AgoraError, Result};

/// Callback invoked after the set of states changes.
pub type ChangeCallback = Arc<dyn Fn(&AwarenessChange) + Send + Sync>;

/// Clients touched by one awareness change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
    /// True when the change came from the network
    pub remote: bool,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client id mentioned by the change.
    pub fn touched(&self) -> impl Iterator<Item = u64> + '_ {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
    }
}

/// The presence interface the lock and arbitration protocols consume.
pub trait AwarenessProvider: Send + Sync {
    /// This connection's client id.
    fn client_id(&self) -> u64;

    /// Snapshot of every known state, or `None` when presence data is
    /// currently unavailable.
    fn states(&self) -> Option<HashMap<u64, PresenceState>>;

    fn local_state(&self) -> Option<PresenceState>;

    /// Replace (or with `None`, withdraw) this connection's state.
    fn set_local_state(&self, state: Option<PresenceState>);

    /// Edit this connection's state in place, starting from an empty one.
    fn update_local_state(&self, edit: &mut dyn FnMut(&mut PresenceState)) {
        let mut state = self.local_state().unwrap_or_default();
        edit(&mut state);
        self.set_local_state(Some(state));
    }

    /// Register a change callback; returns an id for [`AwarenessProvider::unobserve`].
    fn observe(&self, callback: ChangeCallback) -> u64;

    fn unobserve(&self, id: u64) -> bool;
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u64,
    last_updated: i64,
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<u64, PresenceState>,
    meta: HashMap<u64, ClientMeta>,
}

/// In-memory awareness instance.
pub struct Awareness {
    client_id: u64,
    inner: RwLock<Inner>,
    observers: RwLock<HashMap<u64, ChangeCallback>>,
    next_observer_id: AtomicU64,
    available: AtomicBool,
}

impl Awareness {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            inner: RwLock::new(Inner::default()),
            observers: RwLock::new(HashMap::new()),
            next_observer_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Mark presence data as (un)available, e.g. while disconnected.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::AcqRel);
        if was != available {
            log::debug!("Awareness for client {} available={}", self.client_id, available);
            self.emit(&AwarenessChange {
                remote: false,
                ..AwarenessChange::default()
            });
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Last clock seen for a client.
    pub fn clock_of(&self, client_id: u64) -> Option<u64> {
        self.read().meta.get(&client_id).map(|m| m.clock)
    }

    /// Unix milliseconds of the last change received for a client.
    pub fn last_updated(&self, client_id: u64) -> Option<i64> {
        self.read().meta.get(&client_id).map(|m| m.last_updated)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, change: &AwarenessChange) {
        let callbacks: Vec<ChangeCallback> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(change);
        }
    }

    /// Encode the states of `clients` (a missing state encodes as `null`).
    pub fn encode_update(&self, clients: &[u64]) -> Result<Vec<u8>> {
        let inner = self.read();
        let mut buf = Vec::new();
        let known: Vec<(u64, u64)> = clients
            .iter()
            .filter_map(|id| inner.meta.get(id).map(|m| (*id, m.clock)))
            .collect();

        write_var_uint(&mut buf, known.len() as u64);
        for (client_id, clock) in known {
            let json = match inner.states.get(&client_id) {
                Some(state) => serde_json::to_string(state)?,
                None => "null".to_string(),
            };
            write_var_uint(&mut buf, client_id);
            write_var_uint(&mut buf, clock);
            write_var_string(&mut buf, &json);
        }
        Ok(buf)
    }

    /// Encode every live state, for peers that just joined.
    pub fn encode_full_update(&self) -> Result<Vec<u8>> {
        let clients: Vec<u64> = self.read().states.keys().copied().collect();
        self.encode_update(&clients)
    }

    /// Merge an encoded awareness update from the network.
    pub fn apply_update(&self, update: &[u8]) -> Result<AwarenessChange> {
        let entries = decode_update(update)?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut change = AwarenessChange {
            remote: true,
            ..AwarenessChange::default()
        };
        let mut reannounce = false;

        {
            let mut inner = self.write();
            for entry in entries {
                let current_clock = inner.meta.get(&entry.client_id).map(|m| m.clock);
                let exists = inner.states.contains_key(&entry.client_id);
                // An equal clock still wins when it flips presence: a null
                // for a live client, or a state for one we dropped locally
                let newer = match current_clock {
                    None => true,
                    Some(clock) => {
                        clock < entry.clock
                            || (clock == entry.clock && entry.state.is_none() == exists)
                    }
                };
                if !newer {
                    continue;
                }

                if entry.client_id == self.client_id {
                    // Peers may not overwrite or remove our own state
                    let own_clock = current_clock.unwrap_or(0).max(entry.clock) + 1;
                    inner.meta.insert(
                        entry.client_id,
                        ClientMeta {
                            clock: own_clock,
                            last_updated: now,
                        },
                    );
                    reannounce = exists;
                    continue;
                }

                inner.meta.insert(
                    entry.client_id,
                    ClientMeta {
                        clock: entry.clock,
                        last_updated: now,
                    },
                );
                match entry.state {
                    Some(state) => {
                        let previous = inner.states.insert(entry.client_id, state.clone());
                        match previous {
                            None => change.added.push(entry.client_id),
                            Some(prev) if prev != state => change.updated.push(entry.client_id),
                            Some(_) => {}
                        }
                    }
                    None => {
                        if inner.states.remove(&entry.client_id).is_some() {
                            change.removed.push(entry.client_id);
                        }
                    }
                }
            }
        }

        if reannounce {
            log::debug!("Peer sent a newer clock for our own client {}", self.client_id);
        }
        if !change.is_empty() {
            self.emit(&change);
        }
        Ok(change)
    }

    /// Drop the states of disconnected clients.
    ///
    /// Clocks are bumped so a later [`Awareness::encode_update`] for the same
    /// ids tells peers to remove them.
    pub fn remove_states(&self, clients: &[u64]) -> AwarenessChange {
        let now = chrono::Utc::now().timestamp_millis();
        let mut change = AwarenessChange {
            remote: true,
            ..AwarenessChange::default()
        };
        {
            let mut inner = self.write();
            for &client_id in clients {
                if client_id == self.client_id {
                    continue;
                }
                if inner.states.remove(&client_id).is_some() {
                    let clock = inner.meta.get(&client_id).map_or(0, |m| m.clock) + 1;
                    inner.meta.insert(
                        client_id,
                        ClientMeta {
                            clock,
                            last_updated: now,
                        },
                    );
                    change.removed.push(client_id);
                }
            }
        }
        if !change.is_empty() {
            self.emit(&change);
        }
        change
    }

    /// Bump our own clock without changing the state, so peers that dropped
    /// us (or are about to time us out) accept it again.
    ///
    /// Observers are not notified; the caller sends the encoded state itself.
    /// Returns the new clock, or `None` when there is no local state.
    pub fn renew_local_state(&self) -> Option<u64> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut inner = self.write();
        if !inner.states.contains_key(&self.client_id) {
            return None;
        }
        let meta = inner.meta.entry(self.client_id).or_insert(ClientMeta {
            clock: 0,
            last_updated: now,
        });
        meta.clock += 1;
        meta.last_updated = now;
        Some(meta.clock)
    }

    /// Drop remote states not renewed within `timeout`.
    pub fn remove_outdated(&self, timeout: Duration) -> AwarenessChange {
        self.remove_outdated_at(chrono::Utc::now().timestamp_millis(), timeout)
    }

    /// [`Awareness::remove_outdated`] against an explicit clock (Unix ms).
    pub fn remove_outdated_at(&self, now_ms: i64, timeout: Duration) -> AwarenessChange {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let outdated: Vec<u64> = {
            let inner = self.read();
            inner
                .states
                .keys()
                .copied()
                .filter(|id| *id != self.client_id)
                .filter(|id| {
                    inner
                        .meta
                        .get(id)
                        .is_none_or(|m| now_ms.saturating_sub(m.last_updated) >= timeout_ms)
                })
                .collect()
        };
        if !outdated.is_empty() {
            log::debug!(
                "Client {} dropping {} outdated presence states",
                self.client_id,
                outdated.len()
            );
        }
        self.remove_states(&outdated)
    }

    /// Drop every state but our own (e.g. after the connection is lost).
    pub fn clear_remote_states(&self) -> AwarenessChange {
        let clients: Vec<u64> = self
            .read()
            .states
            .keys()
            .copied()
            .filter(|id| *id != self.client_id)
            .collect();
        self.remove_states(&clients)
    }
}

impl AwarenessProvider for Awareness {
    fn client_id(&self) -> u64 {
        self.client_id
    }

    fn states(&self) -> Option<HashMap<u64, PresenceState>> {
        if !self.is_available() {
            return None;
        }
        Some(self.read().states.clone())
    }

    fn local_state(&self) -> Option<PresenceState> {
        self.read().states.get(&self.client_id).cloned()
    }

    fn set_local_state(&self, state: Option<PresenceState>) {
        let now = chrono::Utc::now().timestamp_millis();
        let change = {
            let mut inner = self.write();
            let clock = inner.meta.get(&self.client_id).map_or(0, |m| m.clock + 1);
            inner.meta.insert(
                self.client_id,
                ClientMeta {
                    clock,
                    last_updated: now,
                },
            );

            let mut change = AwarenessChange::default();
            match state {
                Some(state) => match inner.states.insert(self.client_id, state.clone()) {
                    None => change.added.push(self.client_id),
                    Some(prev) if prev != state => change.updated.push(self.client_id),
                    Some(_) => {}
                },
                None => {
                    if inner.states.remove(&self.client_id).is_some() {
                        change.removed.push(self.client_id);
                    }
                }
            }
            change
        };
        if !change.is_empty() {
            self.emit(&change);
        }
    }

    fn observe(&self, callback: ChangeCallback) -> u64 {
        let id = self.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);
        id
    }

    fn unobserve(&self, id: u64) -> bool {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("states", &self.read().states.len())
            .field("available", &self.is_available())
            .finish()
    }
}

/// One decoded awareness entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    /// `None` means the client left
    pub state: Option<PresenceState>,
}

/// Decode an awareness update without applying it.
pub fn decode_update(update: &[u8]) -> Result<Vec<AwarenessEntry>> {
    let truncated = || AgoraError::Crdt("Truncated awareness update".to_string());

    let (count, mut offset) = read_var_uint(update).ok_or_else(truncated)?;
    let mut entries = Vec::new();

    for _ in 0..count {
        let (client_id, n) = read_var_uint(&update[offset..]).ok_or_else(truncated)?;
        offset += n;
        let (clock, n) = read_var_uint(&update[offset..]).ok_or_else(truncated)?;
        offset += n;
        let (json, n) = read_var_string(&update[offset..]).ok_or_else(truncated)?;
        offset += n;

        let state = match json.as_str() {
            "null" => None,
            _ => Some(serde_json::from_str::<PresenceState>(&json)?),
        };
        entries.push(AwarenessEntry {
            client_id,
            clock,
            state,
        });
    }

    Ok(entries)
}

/// Client ids an encoded update mentions, ignoring malformed payloads.
pub fn update_client_ids(update: &[u8]) -> Vec<u64> {
    decode_update(update)
        .map(|entries| entries.into_iter().map(|e| e.client_id).collect())
        .unwrap_or_default()
}
