//! Agora Sync Server
//!
//! Real-time collaboration server for Agora debate graphs.
//!
//! ## Features
//!
//! - **Real-time sync**: WebSocket rooms speaking the y-sync protocol over
//!   `agora_core`'s graph document
//! - **Update log**: every accepted update is appended to SQLite and folded
//!   into a snapshot once the log grows past the compaction threshold
//! - **Presence relay**: awareness frames (cursors, editing locks, write
//!   arbitration) are fanned out and cached per document
//! - **Access control**: owners, collaborators, share links and optional
//!   development or legacy-public grants
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATABASE_PATH`: Path to SQLite database (default: ./agora_sync.db)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins
//! - `DEV_MODE`: Let anonymous callers edit (default: false)
//! - `LEGACY_PUBLIC_CUTOFF`: RFC 3339 instant; older documents are public
//! - `LOCK_TTL_MS`, `ARBITRATION_DEBOUNCE_MS`, `UNDO_CAPTURE_TIMEOUT_MS`,
//!   `CONNECT_TIMEOUT_MS`, `PRESENCE_TIMEOUT_MS`: presence and client timings
//! - `COMPACTION_THRESHOLD`, `COMPACTION_KEEP_TAIL`, `MAX_UPDATE_BYTES`:
//!   update log limits

pub mod access;
pub mod auth;
pub mod config;
pub mod db;
pub mod handlers;
pub mod sync;

pub use config::Config;

use auth::AuthExtractor;
use axum::{
    Router,
    extract::Extension,
    http::{HeaderValue, Method, header},
    routing::get,
};
use handlers::{AppState, api_routes, doc_routes, ws_handler};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the full application router
pub fn build_router(state: AppState, auth_extractor: AuthExtractor) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        // Health check
        .route("/", get(|| async { "Agora Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        // WebSocket sync endpoint
        .route("/docs/{doc}/sync", get(ws_handler).with_state(state.clone()))
        // API routes
        .nest("/api", api_routes(state.clone()).merge(doc_routes(state)))
        // Add layers
        .layer(Extension(auth_extractor))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .expose_headers([header::HeaderName::from_static(
            handlers::docs::UPDATE_BYTES_HEADER,
        )]);

    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}
