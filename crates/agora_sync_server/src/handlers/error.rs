use agora_core::AgoraError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Errors returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Document not found")]
    NotFound,

    #[error("Authentication required")]
    RequiresAuth,

    #[error("Access denied")]
    Forbidden,

    #[error("Update of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Storage failure on {doc_id}: {source}")]
    Storage {
        doc_id: String,
        #[source]
        source: AgoraError,
    },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn storage(doc_id: &str, source: AgoraError) -> Self {
        ApiError::Storage {
            doc_id: doc_id.to_string(),
            source,
        }
    }

    /// Map an ingestion failure: bad input is the caller's fault, the rest
    /// is ours.
    pub fn from_ingest(doc_id: &str, err: AgoraError) -> Self {
        match err {
            AgoraError::PayloadTooLarge { size, max } => ApiError::PayloadTooLarge { size, max },
            err if err.is_data_error() => ApiError::InvalidUpdate(err.to_string()),
            err => ApiError::storage(doc_id, err),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RequiresAuth => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InvalidUpdate(_) => StatusCode::BAD_REQUEST,
            ApiError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Storage { .. } => {
                error!("{}", self);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::RequiresAuth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError::from_ingest(
                "d",
                AgoraError::PayloadTooLarge {
                    size: 1_000_001,
                    max: 1_000_000
                }
            )
            .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::from_ingest("d", AgoraError::Crdt("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from_ingest("d", AgoraError::DocumentNotFound("d".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
