use super::{ApiError, AppState};
use crate::auth::OptionalAuth;
use agora_core::crdt::{Role, SyncMessage, UpdateLogStore, load_state};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Room sender id for updates that arrive over HTTP; connection ids start at 1
const HTTP_SENDER: u64 = 0;

/// Echo of the stored payload size
pub const UPDATE_BYTES_HEADER: &str = "x-update-bytes";

/// Query parameters for document endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ShareQuery {
    /// Share token for anonymous or link-based access
    pub share: Option<String>,
}

/// Response for an accepted update
#[derive(Debug, Serialize)]
pub struct UpdateAccepted {
    pub id: i64,
    pub doc_id: String,
    pub created_at: i64,
}

/// One stored update, base64-encoded
#[derive(Debug, Serialize)]
pub struct UpdateEntry {
    pub id: i64,
    pub data: String,
    pub user_id: Option<String>,
    pub created_at: i64,
}

/// Snapshot plus tail of a document
#[derive(Debug, Serialize)]
pub struct StateResponse {
    pub doc_id: String,
    pub snapshot: Option<String>,
    pub snapshot_at: Option<i64>,
    pub updates: Vec<UpdateEntry>,
}

/// Create document routes (merged into the `/api` router)
pub fn doc_routes(state: AppState) -> Router {
    // Leave headroom so a payload just over the limit reaches our own check
    let body_limit = state.ingest.max_update_bytes().saturating_add(1024);
    Router::new()
        .route("/docs/{doc}/updates", post(post_update))
        .route("/docs/{doc}/state", get(get_state))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// POST /api/docs/{doc}/updates - Persist one binary update
async fn post_update(
    State(state): State<AppState>,
    Path(doc): Path<String>,
    Query(query): Query<ShareQuery>,
    OptionalAuth(auth): OptionalAuth,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let max = state.ingest.max_update_bytes();
    if body.len() > max {
        return Err(ApiError::PayloadTooLarge {
            size: body.len(),
            max,
        });
    }

    let user_id = auth.as_ref().map(|a| a.user.id.as_str());
    let share = query.share.as_deref();

    let (document, role) = match state.authorize(&doc, user_id, share) {
        Err(ApiError::NotFound) if share.is_none() => {
            // First write seeds the document
            if user_id.is_none() && !state.config.dev_mode {
                return Err(ApiError::RequiresAuth);
            }
            let document = state
                .ingest
                .store()
                .ensure_document(&doc, user_id)
                .map_err(|e| ApiError::storage(&doc, e))?;
            info!(
                "Created document {} on first write (owner: {:?})",
                doc, document.owner_id
            );
            let role = if document.owner_id.is_some() {
                Role::Owner
            } else {
                Role::Editor
            };
            (document, role)
        }
        other => other?,
    };

    if !role.can_write() {
        return Err(ApiError::Forbidden);
    }

    let record = state
        .ingest
        .ingest(&document.id, &body, user_id)
        .map_err(|e| ApiError::from_ingest(&document.id, e))?;
    debug!(
        "Stored update {} ({} bytes) for {} over HTTP",
        record.id,
        body.len(),
        document.id
    );

    if let Some(room) = state.sync_state.get_room(&document.id).await {
        room.broadcast(HTTP_SENDER, SyncMessage::Update(body.to_vec()).encode());
    }

    Ok((
        StatusCode::OK,
        [(UPDATE_BYTES_HEADER, body.len().to_string())],
        Json(UpdateAccepted {
            id: record.id,
            doc_id: record.doc_id,
            created_at: record.created_at,
        }),
    ))
}

/// GET /api/docs/{doc}/state - Latest snapshot and the updates after it
async fn get_state(
    State(state): State<AppState>,
    Path(doc): Path<String>,
    Query(query): Query<ShareQuery>,
    OptionalAuth(auth): OptionalAuth,
) -> Result<Json<StateResponse>, ApiError> {
    let user_id = auth.as_ref().map(|a| a.user.id.as_str());
    let (document, _role) = state.authorize(&doc, user_id, query.share.as_deref())?;

    let store: &dyn UpdateLogStore = state.ingest.store().as_ref();
    let bundle = load_state(store, &document.id).map_err(|e| ApiError::storage(&document.id, e))?;

    Ok(Json(StateResponse {
        snapshot_at: bundle.snapshot.as_ref().map(|s| s.snapshot_at),
        snapshot: bundle.snapshot.map(|s| BASE64.encode(s.state)),
        updates: bundle
            .updates
            .into_iter()
            .map(|u| UpdateEntry {
                id: u.id,
                data: BASE64.encode(u.data),
                user_id: u.user_id,
                created_at: u.created_at,
            })
            .collect(),
        doc_id: document.id,
    }))
}
