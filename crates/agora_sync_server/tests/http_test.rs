//! HTTP endpoints driven through the router without a network.

mod common;

use agora_core::crdt::{GraphDoc, Role, UpdateLogStore};
use agora_sync_server::config::Config;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::{TestServer, point_update};
use tower::ServiceExt;

async fn post_update(
    server: &TestServer,
    uri: &str,
    token: Option<&str>,
    body: Vec<u8>,
) -> Response {
    let mut request = Request::builder().method("POST").uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }
    server
        .app
        .clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap()
}

async fn get(server: &TestServer, uri: &str, token: Option<&str>) -> Response {
    let mut request = Request::builder().uri(uri);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Bearer {}", token));
    }
    server
        .app
        .clone()
        .oneshot(request.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn json_body(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_and_status() {
    let server = TestServer::new(Config::default());

    let response = get(&server, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(&server, "/api/status", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active_rooms"], 0);
}

#[tokio::test]
async fn test_first_write_seeds_owned_document() {
    let server = TestServer::new(Config::default());
    let (user_id, token) = server.user("Ann");
    let update = point_update(&GraphDoc::new(), "p-1", "Hello");

    let response = post_update(&server, "/api/docs/debate-1/updates", Some(token.as_str()), update.clone()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["x-update-bytes"],
        update.len().to_string().as_str()
    );

    let document = server.store.get_document("debate-1").unwrap().unwrap();
    assert_eq!(document.owner_id.as_deref(), Some(user_id.as_str()));
    assert_eq!(server.store.count_for("debate-1").unwrap(), 1);

    // The stored record reads back through the state endpoint
    let response = get(&server, "/api/docs/debate-1/state", Some(token.as_str())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["snapshot"].is_null());
    let updates = body["updates"].as_array().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(
        BASE64.decode(updates[0]["data"].as_str().unwrap()).unwrap(),
        update
    );
    assert_eq!(updates[0]["user_id"], user_id.as_str());
}

#[tokio::test]
async fn test_anonymous_writes() {
    let update = point_update(&GraphDoc::new(), "p-1", "Hi");

    let strict = TestServer::new(Config::default());
    let response = post_update(&strict, "/api/docs/d/updates", None, update.clone()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(strict.store.get_document("d").unwrap().is_none());

    let dev = TestServer::new(Config {
        dev_mode: true,
        ..Config::default()
    });
    let response = post_update(&dev, "/api/docs/d/updates", None, update).await;
    assert_eq!(response.status(), StatusCode::OK);
    let document = dev.store.get_document("d").unwrap().unwrap();
    assert!(document.owner_id.is_none());
}

#[tokio::test]
async fn test_oversized_update_rejected() {
    let server = TestServer::new(Config::default());
    let (_, token) = server.user("Ann");

    let response = post_update(
        &server,
        "/api/docs/d/updates",
        Some(token.as_str()),
        vec![0u8; 1_000_001],
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(server.store.count_for("d").unwrap(), 0);
    assert!(server.store.get_document("d").unwrap().is_none());
}

#[tokio::test]
async fn test_undecodable_update_rejected() {
    let server = TestServer::new(Config::default());
    let (_, token) = server.user("Ann");

    let response = post_update(&server, "/api/docs/d/updates", Some(token.as_str()), vec![0xFF; 8]).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(server.store.count_for("d").unwrap(), 0);
}

#[tokio::test]
async fn test_roles_and_share_tokens() {
    let server = TestServer::new(Config::default());
    let (owner_id, owner_token) = server.user("Owner");
    let (viewer_id, viewer_token) = server.user("Viewer");
    let (_, stranger_token) = server.user("Stranger");
    let doc = GraphDoc::new();

    let response = post_update(
        &server,
        "/api/docs/d/updates",
        Some(owner_token.as_str()),
        point_update(&doc, "a", "x"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        server.store.get_document("d").unwrap().unwrap().owner_id.as_deref(),
        Some(owner_id.as_str())
    );

    server.repo.set_collaborator("d", &viewer_id, Role::Viewer).unwrap();
    let update = point_update(&doc, "b", "y");

    let response = post_update(&server, "/api/docs/d/updates", Some(viewer_token.as_str()), update.clone()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    // Viewers can still read
    let response = get(&server, "/api/docs/d/state", Some(viewer_token.as_str())).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = post_update(&server, "/api/docs/d/updates", Some(stranger_token.as_str()), update.clone()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // An editor link lets anonymous callers write
    let link = server
        .repo
        .create_share_token("d", Role::Editor, false, None)
        .unwrap();
    let uri = format!("/api/docs/d/updates?share={}", link);
    let response = post_update(&server, &uri, None, update).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.store.count_for("d").unwrap(), 2);

    // A share token never creates documents
    let uri = format!("/api/docs/other/updates?share={}", link);
    let response = post_update(&server, &uri, None, point_update(&doc, "c", "z")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_state_after_compaction() {
    let mut config = Config::default();
    config.tuning.compaction_threshold = 4;
    config.tuning.compaction_keep_tail = 1;
    let server = TestServer::new(config);
    let (_, token) = server.user("Ann");
    let doc = GraphDoc::new();

    for i in 0..5 {
        let response = post_update(
            &server,
            "/api/docs/d/updates",
            Some(token.as_str()),
            point_update(&doc, &format!("n{i}"), "text"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let body = json_body(get(&server, "/api/docs/d/state", Some(token.as_str())).await).await;
    let snapshot = BASE64.decode(body["snapshot"].as_str().unwrap()).unwrap();
    let updates = body["updates"].as_array().unwrap();
    assert_eq!(updates.len(), 1);

    let replica = GraphDoc::new();
    replica.try_apply_update(&snapshot).unwrap();
    replica
        .try_apply_update(&BASE64.decode(updates[0]["data"].as_str().unwrap()).unwrap())
        .unwrap();
    assert_eq!(replica.snapshot_view(), doc.snapshot_view());
}

#[tokio::test]
async fn test_state_of_unknown_document() {
    let server = TestServer::new(Config::default());
    let (_, token) = server.user("Ann");
    let response = get(&server, "/api/docs/missing/state", Some(token.as_str())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
