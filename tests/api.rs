//! HTTP API 集成测试

mod common;

use assistant_download_manager::config::AppConfig;
use assistant_download_manager::{server, AppState};
use axum::{
    body::{to_bytes, Body},
    http::{Method, Request, StatusCode},
    Router,
};
use common::{url, ScriptedBackend, TestEnv};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(env: &TestEnv) -> Router {
    let manager = env.open(ScriptedBackend::new());
    let config = AppConfig {
        download: env.config.clone(),
        ..Default::default()
    };
    server::build_router(AppState::with_manager(config, manager))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_create_download_starts_when_slot_free() {
    let env = TestEnv::new(1);
    let app = router(&env);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/downloads",
        Some(json!({ "url": url("report.pdf"), "priority": "high" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["status"], "downloading");
    assert_eq!(body["data"]["category"], "document");
    assert_eq!(body["data"]["priority"], "high");

    // 槽位已满，保持排队
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/downloads",
        Some(json!({ "url": url("second.zip") })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "queued");
    let queued_id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/api/v1/downloads/{}/start", queued_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], 429);
}

#[tokio::test]
async fn test_create_download_errors() {
    let env = TestEnv::new(5);
    let app = router(&env);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/downloads",
        Some(json!({ "url": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let payload = json!({ "url": url("a.zip"), "start": false });
    let (status, body) = call(&app, Method::POST, "/api/v1/downloads", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "queued");

    let (status, _) = call(&app, Method::POST, "/api/v1/downloads", Some(payload)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_list_filters_and_lookup() {
    let env = TestEnv::new(5);
    let app = router(&env);

    for name in ["a.mp3", "b.png", "c.mp3"] {
        call(
            &app,
            Method::POST,
            "/api/v1/downloads",
            Some(json!({ "url": url(name), "start": false })),
        )
        .await;
    }

    let (status, body) = call(&app, Method::GET, "/api/v1/downloads?category=audio", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (_, body) = call(&app, Method::GET, "/api/v1/downloads?q=B.PNG", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, _) = call(&app, Method::GET, "/api/v1/downloads?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::GET, "/api/v1/downloads/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(&app, Method::GET, "/api/v1/downloads/stats", None).await;
    assert_eq!(body["data"]["total"], 3);
    assert_eq!(body["data"]["queued"], 3);
}

#[tokio::test]
async fn test_task_lifecycle_routes() {
    let env = TestEnv::new(5);
    let app = router(&env);

    let (_, body) = call(
        &app,
        Method::POST,
        "/api/v1/downloads",
        Some(json!({ "url": url("life.bin") })),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (_, body) = call(&app, Method::POST, &format!("/api/v1/downloads/{}/pause", id), None).await;
    assert_eq!(body["data"]["status"], "paused");

    let (_, body) = call(&app, Method::POST, &format!("/api/v1/downloads/{}/resume", id), None).await;
    assert_eq!(body["data"]["status"], "downloading");

    let (_, body) = call(&app, Method::GET, "/api/v1/downloads/active", None).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (_, body) = call(
        &app,
        Method::PUT,
        &format!("/api/v1/downloads/{}/priority", id),
        Some(json!({ "priority": "low" })),
    )
    .await;
    assert_eq!(body["data"]["priority"], "low");

    let (_, body) = call(&app, Method::POST, &format!("/api/v1/downloads/{}/cancel", id), None).await;
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, body) = call(
        &app,
        Method::DELETE,
        "/api/v1/downloads/history?keep_completed=true",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["removed"], 1);

    let (status, _) = call(&app, Method::DELETE, &format!("/api/v1/downloads/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
}
