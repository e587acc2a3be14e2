use agora_core::crdt::{Compactor, SqliteStorage};
use agora_sync_server::{
    access::{AccessPolicy, DocAccessResolver},
    auth::AuthExtractor,
    build_router,
    config::Config,
    db::{AuthRepo, init_database},
    handlers::AppState,
    sync::{SyncState, UpdateIngest},
};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Agora Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Database path: {:?}", config.database_path);
    info!("CORS origins: {:?}", config.cors_origins);
    if config.dev_mode {
        info!("Development mode: anonymous callers may edit");
    }
    if let Some(cutoff) = config.legacy_public_cutoff {
        info!("Documents created before {} are publicly editable", cutoff);
    }

    // Initialize database
    let conn = match Connection::open(&config.database_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_database(&conn) {
        error!("Failed to initialize database: {}", e);
        std::process::exit(1);
    }

    // The update log shares the database file
    let store = match SqliteStorage::open(&config.database_path) {
        Ok(s) => Arc::new(s.with_max_update_bytes(config.tuning.max_update_bytes)),
        Err(e) => {
            error!("Failed to open update log: {}", e);
            std::process::exit(1);
        }
    };

    // Create shared state
    let repo = Arc::new(AuthRepo::new(conn));
    let auth_extractor = AuthExtractor::new(repo.clone());
    let access = Arc::new(DocAccessResolver::new(
        repo.clone(),
        store.clone(),
        AccessPolicy::from_config(&config),
    ));
    let ingest = UpdateIngest::new(store, Compactor::from_tuning(&config.tuning));

    let state = AppState {
        config: config.clone(),
        access,
        ingest,
        sync_state: Arc::new(
            SyncState::new().with_presence_timeout(config.tuning.presence_timeout()),
        ),
    };

    let app = build_router(state, auth_extractor);

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Start cleanup task
    let cleanup_repo = repo.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let sessions = cleanup_repo.cleanup_expired_sessions().unwrap_or(0);
            let shares = cleanup_repo.cleanup_expired_share_tokens().unwrap_or(0);
            info!(
                "Cleaned up {} expired sessions and {} expired share tokens",
                sessions, shares
            );
        }
    });

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
