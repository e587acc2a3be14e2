//! Presence: per-connection ephemeral state shared over the sync channel.

pub mod arbitration;
pub mod awareness;
pub mod locks;
pub mod state;

pub use arbitration::{
    ArbitrationInput, FileSessionLedger, MemorySessionLedger, SessionLedger, evaluate,
    winning_session,
};
#[cfg(feature = "runtime")]
pub use arbitration::{ArbiterHandle, WriteArbiter};
pub use awareness::{Awareness, AwarenessChange, AwarenessProvider, ChangeCallback};
pub use locks::{EditLocks, LockOwner, LockStatus, lock_status};
pub use state::{EDIT_LOCK_KIND, LockEntry, PresenceState, PresenceUser, SessionIdentity};
