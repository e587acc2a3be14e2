use serde::Serialize;
use thiserror::Error;

/// Unified error type for agora operations
#[derive(Debug, Error)]
pub enum AgoraError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    #[error("Update of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    // CRDT errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Transport errors
    #[error("Timed out after {0} ms waiting for the sync connection")]
    ConnectTimeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias for agora operations
pub type Result<T> = std::result::Result<T, AgoraError>;

/// A serializable representation of AgoraError for IPC and JSON responses
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&AgoraError> for SerializableError {
    fn from(err: &AgoraError) -> Self {
        let kind = match err {
            AgoraError::Io(_) => "Io",
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            AgoraError::Database(_) => "Database",
            AgoraError::DocumentNotFound(_) => "DocumentNotFound",
            AgoraError::PayloadTooLarge { .. } => "PayloadTooLarge",
            AgoraError::Crdt(_) => "Crdt",
            AgoraError::Json(_) => "Json",
            AgoraError::ConfigParse(_) => "ConfigParse",
            AgoraError::ConnectTimeout(_) => "ConnectTimeout",
            AgoraError::Transport(_) => "Transport",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl AgoraError {
    /// Convert to a serializable representation
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }

    /// Whether this error describes bad input data rather than a failing backend.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            AgoraError::Crdt(_) | AgoraError::PayloadTooLarge { .. } | AgoraError::Json(_)
        )
    }
}
