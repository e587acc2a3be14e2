use agora_core::crdt::Role;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// User information
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Session information
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Share link information
#[derive(Debug, Clone)]
pub struct ShareTokenInfo {
    pub token: String,
    pub doc_id: String,
    pub role: Role,
    /// Anonymous callers are turned away even with the token
    pub requires_login: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Identity and access repository
#[derive(Clone)]
pub struct AuthRepo {
    conn: Arc<Mutex<Connection>>,
}

impl AuthRepo {
    /// Create a new AuthRepo with the given connection
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== User operations =====

    /// Create a user, returning its ID
    pub fn create_user(&self, name: &str) -> Result<String, rusqlite::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn().execute(
            "INSERT INTO users (id, name, created_at) VALUES (?, ?, ?)",
            params![id, name, Utc::now().timestamp()],
        )?;
        Ok(id)
    }

    /// Get a user by ID
    pub fn get_user(&self, user_id: &str) -> Result<Option<UserInfo>, rusqlite::Error> {
        self.conn()
            .query_row(
                "SELECT id, name, created_at FROM users WHERE id = ?",
                [user_id],
                |row| {
                    Ok(UserInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: timestamp_to_datetime(row.get(2)?),
                    })
                },
            )
            .optional()
    }

    // ===== Session operations =====

    /// Create a session for a user, returning the token
    pub fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, rusqlite::Error> {
        let token = generate_secure_token();
        self.conn().execute(
            "INSERT INTO auth_sessions (token, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
            params![token, user_id, expires_at.timestamp(), Utc::now().timestamp()],
        )?;
        Ok(token)
    }

    /// Look up a session that has not expired yet
    pub fn validate_session(&self, token: &str) -> Result<Option<SessionInfo>, rusqlite::Error> {
        self.conn()
            .query_row(
                "SELECT token, user_id, expires_at, created_at FROM auth_sessions
                 WHERE token = ? AND expires_at > ?",
                params![token, Utc::now().timestamp()],
                |row| {
                    Ok(SessionInfo {
                        token: row.get(0)?,
                        user_id: row.get(1)?,
                        expires_at: timestamp_to_datetime(row.get(2)?),
                        created_at: timestamp_to_datetime(row.get(3)?),
                    })
                },
            )
            .optional()
    }

    pub fn delete_session(&self, token: &str) -> Result<(), rusqlite::Error> {
        self.conn()
            .execute("DELETE FROM auth_sessions WHERE token = ?", [token])?;
        Ok(())
    }

    /// Delete expired sessions
    pub fn cleanup_expired_sessions(&self) -> Result<usize, rusqlite::Error> {
        self.conn().execute(
            "DELETE FROM auth_sessions WHERE expires_at <= ?",
            [Utc::now().timestamp()],
        )
    }

    // ===== Collaborator operations =====

    /// Grant (or change) a user's role on a document
    pub fn set_collaborator(
        &self,
        doc_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<(), rusqlite::Error> {
        self.conn().execute(
            "INSERT INTO doc_collaborators (doc_id, user_id, role, created_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(doc_id, user_id) DO UPDATE SET role = excluded.role",
            params![doc_id, user_id, role.as_str(), Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn remove_collaborator(&self, doc_id: &str, user_id: &str) -> Result<bool, rusqlite::Error> {
        let removed = self.conn().execute(
            "DELETE FROM doc_collaborators WHERE doc_id = ? AND user_id = ?",
            params![doc_id, user_id],
        )?;
        Ok(removed > 0)
    }

    /// A user's collaborator role on a document, if any
    pub fn collaborator_role(
        &self,
        doc_id: &str,
        user_id: &str,
    ) -> Result<Option<Role>, rusqlite::Error> {
        let role: Option<String> = self
            .conn()
            .query_row(
                "SELECT role FROM doc_collaborators WHERE doc_id = ? AND user_id = ?",
                params![doc_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(role.and_then(|r| r.parse().ok()))
    }

    // ===== Share token operations =====

    /// Create a share link for a document, returning the token
    pub fn create_share_token(
        &self,
        doc_id: &str,
        role: Role,
        requires_login: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<String, rusqlite::Error> {
        let token = generate_secure_token();
        self.conn().execute(
            "INSERT INTO share_tokens (token, doc_id, role, requires_login, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                token,
                doc_id,
                role.as_str(),
                requires_login,
                expires_at.map(|t| t.timestamp()),
                Utc::now().timestamp()
            ],
        )?;
        Ok(token)
    }

    /// Look up a share token that has not expired
    pub fn get_share_token(&self, token: &str) -> Result<Option<ShareTokenInfo>, rusqlite::Error> {
        let row = self
            .conn()
            .query_row(
                "SELECT token, doc_id, role, requires_login, expires_at, created_at FROM share_tokens
                 WHERE token = ? AND (expires_at IS NULL OR expires_at > ?)",
                params![token, Utc::now().timestamp()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.and_then(
            |(token, doc_id, role, requires_login, expires_at, created_at)| {
                Some(ShareTokenInfo {
                    token,
                    doc_id,
                    role: role.parse().ok()?,
                    requires_login,
                    expires_at: expires_at.map(timestamp_to_datetime),
                    created_at: timestamp_to_datetime(created_at),
                })
            },
        ))
    }

    pub fn delete_share_token(&self, token: &str) -> Result<bool, rusqlite::Error> {
        let removed = self
            .conn()
            .execute("DELETE FROM share_tokens WHERE token = ?", [token])?;
        Ok(removed > 0)
    }

    /// Delete expired share tokens
    pub fn cleanup_expired_share_tokens(&self) -> Result<usize, rusqlite::Error> {
        self.conn().execute(
            "DELETE FROM share_tokens WHERE expires_at IS NOT NULL AND expires_at <= ?",
            [Utc::now().timestamp()],
        )
    }
}

/// Generate a random URL-safe token
fn generate_secure_token() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.r#gen()).collect();
    base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes)
}

fn timestamp_to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now)
}
