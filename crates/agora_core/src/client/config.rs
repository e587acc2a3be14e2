use std::time::Duration;

use url::Url;

use crate::config::SyncTuning;
use crate::crdt::Role;
use crate::error::{AgoraError, Result};

/// Where and how a [`SyncClient`](super::SyncClient) connects.
#[derive(Debug, Clone)]
pub struct SyncClientConfig {
    /// Base server URL, e.g. `ws://localhost:3030`
    pub server_url: String,

    /// Document id or slug
    pub doc_id: String,

    /// Session token sent as the `token` query parameter
    pub token: Option<String>,

    /// Share token sent as the `share` query parameter
    pub share_token: Option<String>,

    /// Role granted on the document; viewers never send updates
    pub role: Role,

    pub tuning: SyncTuning,

    /// Reconnect attempts after a failure before giving up
    pub max_reconnect_attempts: u32,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,

    /// Interval between keep-alive pings
    pub ping_interval: Duration,
}

impl SyncClientConfig {
    pub fn new(server_url: impl Into<String>, doc_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            doc_id: doc_id.into(),
            token: None,
            share_token: None,
            role: Role::Editor,
            tuning: SyncTuning::default(),
            max_reconnect_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_share_token(mut self, share_token: impl Into<String>) -> Self {
        self.share_token = Some(share_token.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_tuning(mut self, tuning: SyncTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, initial_backoff: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.initial_backoff = initial_backoff;
        self
    }

    /// WebSocket URL of the document room.
    pub fn sync_url(&self) -> Result<Url> {
        let base = self.server_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{}/docs/{}/sync", base, self.doc_id))
            .map_err(|e| AgoraError::Transport(format!("Invalid server URL '{}': {}", base, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
            if let Some(share) = &self.share_token {
                query.append_pair("share", share);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// Delay before reconnect attempt `attempt` (0-based), doubling up to the cap.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_url_with_tokens() {
        let config = SyncClientConfig::new("ws://localhost:3030/", "debate-1")
            .with_token("abc")
            .with_share_token("s p");
        let url = config.sync_url().unwrap();
        assert_eq!(url.path(), "/docs/debate-1/sync");
        assert_eq!(url.query(), Some("token=abc&share=s+p"));
    }

    #[test]
    fn test_sync_url_without_tokens() {
        let url = SyncClientConfig::new("ws://localhost:3030", "d").sync_url().unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3030/docs/d/sync");
    }

    #[test]
    fn test_invalid_url() {
        assert!(SyncClientConfig::new("not a url", "d").sync_url().is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SyncClientConfig::new("ws://x", "d");
        assert_eq!(config.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(30), Duration::from_secs(30));
    }
}
