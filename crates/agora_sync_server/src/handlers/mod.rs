pub mod api;
pub mod docs;
pub mod error;
pub mod ws;

pub use api::api_routes;
pub use docs::doc_routes;
pub use error::ApiError;
pub use ws::ws_handler;

use crate::access::{AccessDecision, AccessRequest, AccessResolver};
use crate::config::Config;
use crate::sync::{SyncState, UpdateIngest};
use agora_core::crdt::{DocumentInfo, Role};
use std::sync::Arc;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub access: Arc<dyn AccessResolver>,
    pub ingest: UpdateIngest,
    pub sync_state: Arc<SyncState>,
}

impl AppState {
    /// Resolve the caller's role on `doc`, mapping refusals to HTTP errors.
    pub fn authorize(
        &self,
        doc: &str,
        user_id: Option<&str>,
        share_token: Option<&str>,
    ) -> Result<(DocumentInfo, Role), ApiError> {
        let request = AccessRequest {
            user_id,
            share_token,
        };
        match self
            .access
            .resolve(doc, request)
            .map_err(|e| ApiError::storage(doc, e))?
        {
            AccessDecision::NotFound => Err(ApiError::NotFound),
            AccessDecision::Forbidden {
                requires_auth: true,
            } => Err(ApiError::RequiresAuth),
            AccessDecision::Forbidden { .. } => Err(ApiError::Forbidden),
            AccessDecision::Granted { document, role } => Ok((document, role)),
        }
    }
}
