//! Integration tests for the controller HTTP API.
//!
//! Build request lifecycle (create, get, list, cancel) over the axum
//! router, against a real ledger and engine with empty caches.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use morph_core::protocol::PROTOCOL_VERSION;
use morph_core::Settings;
use morphd::server::{create_router, AppState};
use morphd::storage::Storage;
use morphd::BuildEngine;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

async fn create_test_app() -> (axum::Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut settings = Settings::default();
    settings.cachedir = dir.path().join("cache");
    settings.tempdir = dir.path().join("tmp");
    // The test builds point at repositories that do not exist; with
    // updates disabled they fail fast instead of trying the network.
    settings.no_git_update = true;

    let storage = Storage::new(&dir.path().join("morphd.db")).await.unwrap();
    storage.migrate_embedded().await.unwrap();
    let engine = BuildEngine::new(settings).unwrap();
    let state = Arc::new(AppState::new(Arc::new(storage), Arc::new(engine)));
    (create_router(state), dir)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn build_request_body() -> String {
    serde_json::json!({
        "protocol_version": PROTOCOL_VERSION,
        "repo": "file:///no/such/repository",
        "commit": "a".repeat(40),
        "morphology": "systems/devel.morph",
        "original_ref": "master",
    })
    .to_string()
}

async fn post(app: &axum::Router, uri: &str, body: String) -> Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn get(app: &axum::Router, uri: &str) -> Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn health_check_returns_ok() {
    let (app, _dir) = create_test_app().await;
    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn create_build_returns_id_for_detached_clients() {
    let (app, _dir) = create_test_app().await;

    let response = post(&app, "/1.0/builds", build_request_body()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_to_json(response).await;
    let id = json["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());
    assert_eq!(json["status"], "PENDING");

    // The build id works for later queries.
    let response = get(&app, &format!("/1.0/builds/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;
    assert_eq!(json["id"], id.as_str());
    assert_eq!(json["repo"], "file:///no/such/repository");
}

#[tokio::test]
async fn unresolvable_build_ends_failed() {
    let (app, _dir) = create_test_app().await;

    let response = post(&app, "/1.0/builds", build_request_body()).await;
    let id = body_to_json(response).await["id"]
        .as_str()
        .unwrap()
        .to_string();

    // The background task fails quickly: the repository cannot be
    // resolved with git updates disabled.
    let mut status = String::new();
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = get(&app, &format!("/1.0/builds/{id}")).await;
        status = body_to_json(response).await["status"]
            .as_str()
            .unwrap()
            .to_string();
        if status == "FAILED" {
            break;
        }
    }
    assert_eq!(status, "FAILED");

    let response = get(&app, &format!("/1.0/builds/{id}")).await;
    let json = body_to_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("not cached"));
}

#[tokio::test]
async fn list_builds_shows_requests() {
    let (app, _dir) = create_test_app().await;

    let response = get(&app, "/1.0/builds").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_to_json(response).await["builds"]
        .as_array()
        .unwrap()
        .is_empty());

    post(&app, "/1.0/builds", build_request_body()).await;
    let response = get(&app, "/1.0/builds").await;
    let json = body_to_json(response).await;
    assert_eq!(json["builds"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn get_unknown_build_is_not_found() {
    let (app, _dir) = create_test_app().await;
    let response = get(&app, "/1.0/builds/no-such-build").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_settles_terminal_state() {
    let (app, _dir) = create_test_app().await;

    let response = post(&app, "/1.0/builds", build_request_body()).await;
    let id = body_to_json(response).await["id"]
        .as_str()
        .unwrap()
        .to_string();

    // Whatever the race with the failing background build, the
    // request ends in a terminal state and a second cancel conflicts.
    let _ = post(&app, &format!("/1.0/builds/{id}/cancel"), String::new()).await;

    let mut terminal = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let response = get(&app, &format!("/1.0/builds/{id}")).await;
        let status = body_to_json(response).await["status"]
            .as_str()
            .unwrap()
            .to_string();
        if ["FAILED", "CANCELLED"].contains(&status.as_str()) {
            terminal = true;
            break;
        }
    }
    assert!(terminal);

    let response = post(&app, &format!("/1.0/builds/{id}/cancel"), String::new()).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn events_stream_exists_for_builds() {
    let (app, _dir) = create_test_app().await;

    let response = post(&app, "/1.0/builds", build_request_body()).await;
    let id = body_to_json(response).await["id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = get(&app, &format!("/1.0/builds/{id}/events")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(content_type.starts_with("text/event-stream"));

    let response = get(&app, "/1.0/builds/ghost/events").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
