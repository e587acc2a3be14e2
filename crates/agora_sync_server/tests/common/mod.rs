#![allow(dead_code)]

use std::sync::Arc;

use agora_core::crdt::{Compactor, GraphDoc, NodeRecord, SqliteStorage};
use agora_sync_server::{
    access::{AccessPolicy, DocAccessResolver},
    auth::AuthExtractor,
    build_router,
    config::Config,
    db::{AuthRepo, init_database},
    handlers::AppState,
    sync::{SyncState, UpdateIngest},
};
use axum::Router;
use chrono::{Duration, Utc};
use rusqlite::Connection;

pub struct TestServer {
    pub app: Router,
    pub repo: Arc<AuthRepo>,
    pub store: Arc<SqliteStorage>,
    pub state: AppState,
}

impl TestServer {
    pub fn new(config: Config) -> Self {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        let repo = Arc::new(AuthRepo::new(conn));
        let store = Arc::new(
            SqliteStorage::in_memory()
                .unwrap()
                .with_max_update_bytes(config.tuning.max_update_bytes),
        );

        let access = Arc::new(DocAccessResolver::new(
            repo.clone(),
            store.clone(),
            AccessPolicy::from_config(&config),
        ));
        let state = AppState {
            ingest: UpdateIngest::new(store.clone(), Compactor::from_tuning(&config.tuning)),
            config: Arc::new(config),
            access,
            sync_state: Arc::new(SyncState::new()),
        };
        let app = build_router(state.clone(), AuthExtractor::new(repo.clone()));

        Self {
            app,
            repo,
            store,
            state,
        }
    }

    /// Create a user and return `(user_id, session_token)`.
    pub fn user(&self, name: &str) -> (String, String) {
        let user_id = self.repo.create_user(name).unwrap();
        let token = self
            .repo
            .create_session(&user_id, Utc::now() + Duration::days(1))
            .unwrap();
        (user_id, token)
    }

    /// Serve the app on an ephemeral port, returning its `ws://` base URL.
    pub async fn spawn(&self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.app.clone();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{}", addr)
    }
}

/// Update bytes creating one point node with text.
pub fn point_update(doc: &GraphDoc, id: &str, text: &str) -> Vec<u8> {
    let origin = doc.local_origin().to_string();
    let ((), update) = doc.transact_encoded(&origin, |txn| {
        txn.set_node(&NodeRecord::new(id, "point")).unwrap();
        txn.set_node_text(id, text);
    });
    update
}
