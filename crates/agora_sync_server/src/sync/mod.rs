mod connection;
mod ingest;
mod room;

pub use connection::{ClientConnection, Outgoing};
pub use ingest::UpdateIngest;
pub use room::{DocRoom, RoomFrame, SyncState, SyncStats};
