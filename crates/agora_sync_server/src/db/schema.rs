use rusqlite::Connection;

/// SQL schema for identity and access tables.
///
/// Documents, update logs and snapshots live in the tables created by
/// `agora_core::crdt::SqliteStorage` in the same database file.
const SCHEMA: &str = r#"
-- Users table
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Auth sessions (issued by the external login flow)
CREATE TABLE IF NOT EXISTS auth_sessions (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON auth_sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_expires ON auth_sessions(expires_at);

-- Per-document roles granted to other users
CREATE TABLE IF NOT EXISTS doc_collaborators (
    doc_id TEXT NOT NULL,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (doc_id, user_id)
);

-- Share links
CREATE TABLE IF NOT EXISTS share_tokens (
    token TEXT PRIMARY KEY,
    doc_id TEXT NOT NULL,
    role TEXT NOT NULL,
    requires_login INTEGER NOT NULL DEFAULT 0,
    expires_at INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_share_tokens_doc ON share_tokens(doc_id);
"#;

/// Initialize the database with the access schema
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
