//! Native WebSocket sync client.
//!
//! [`SyncClient`] keeps a [`GraphDoc`](crate::crdt::GraphDoc) and an
//! [`Awareness`](crate::presence::Awareness) in sync with one document room
//! on the sync server. Local edits go out as they are committed (subject to
//! the caller's role and write arbitration), remote edits are merged with
//! the remote origin, and the connection is re-established with exponential
//! backoff when it drops.

mod config;
mod connection;

pub use config::SyncClientConfig;
pub use connection::{ClientEvent, ConnectionState, SyncClient};
