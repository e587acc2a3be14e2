use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use agora_core::config::SyncTuning;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Database file path (default: ./agora_sync.db)
    pub database_path: PathBuf,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// Development mode: anonymous callers may edit any document
    pub dev_mode: bool,
    /// Documents created before this instant are editable by anonymous callers
    pub legacy_public_cutoff: Option<DateTime<Utc>>,
    /// Timing and size limits shared with the core
    pub tuning: SyncTuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3030,
            database_path: PathBuf::from("./agora_sync.db"),
            cors_origins: Vec::new(),
            dev_mode: false,
            legacy_public_cutoff: None,
            tuning: SyncTuning::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let port = match lookup("PORT") {
            Some(value) => value.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let database_path = lookup("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.database_path);

        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let dev_mode = lookup("DEV_MODE")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let legacy_public_cutoff = match lookup("LEGACY_PUBLIC_CUTOFF") {
            Some(value) if !value.trim().is_empty() => Some(
                DateTime::parse_from_rfc3339(value.trim())
                    .map_err(|_| ConfigError::InvalidCutoff(value.clone()))?
                    .with_timezone(&Utc),
            ),
            _ => None,
        };

        let base = SyncTuning::default();
        let tuning = SyncTuning {
            lock_ttl_ms: parse_or("LOCK_TTL_MS", &lookup, base.lock_ttl_ms)?,
            arbitration_debounce_ms: parse_or(
                "ARBITRATION_DEBOUNCE_MS",
                &lookup,
                base.arbitration_debounce_ms,
            )?,
            undo_capture_timeout_ms: parse_or(
                "UNDO_CAPTURE_TIMEOUT_MS",
                &lookup,
                base.undo_capture_timeout_ms,
            )?,
            connect_timeout_ms: parse_or("CONNECT_TIMEOUT_MS", &lookup, base.connect_timeout_ms)?,
            presence_timeout_ms: parse_or(
                "PRESENCE_TIMEOUT_MS",
                &lookup,
                base.presence_timeout_ms,
            )?,
            compaction_threshold: parse_or(
                "COMPACTION_THRESHOLD",
                &lookup,
                base.compaction_threshold,
            )?,
            compaction_keep_tail: parse_or(
                "COMPACTION_KEEP_TAIL",
                &lookup,
                base.compaction_keep_tail,
            )?,
            max_update_bytes: parse_or("MAX_UPDATE_BYTES", &lookup, base.max_update_bytes)?,
        };

        Ok(Config {
            host,
            port,
            database_path,
            cors_origins,
            dev_mode,
            legacy_public_cutoff,
            tuning,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T, F>(key: &'static str, lookup: &F, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { key, value }),
        None => Ok(default),
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid PORT environment variable")]
    InvalidPort,

    #[error("Invalid {key} environment variable: '{value}'")]
    InvalidNumber { key: &'static str, value: String },

    #[error("Invalid LEGACY_PUBLIC_CUTOFF (expected RFC 3339): '{0}'")]
    InvalidCutoff(String),
}
