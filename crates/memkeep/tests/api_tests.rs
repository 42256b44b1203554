//! HTTP surface tests driven through the router with `oneshot`

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use memkeep::api::create_router;
use memkeep::config::ServerConfig;
use memkeep::testing::test_engine;

fn app() -> (Router, TempDir) {
    let (engine, dir) = test_engine();
    (create_router(Arc::new(engine), &ServerConfig::default()), dir)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
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
async fn test_health() {
    let (app, _dir) = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage_mode"], "local");
}

#[tokio::test]
async fn test_save_search_forget_tools() {
    let (app, _dir) = app();

    let (status, saved) = send(
        &app,
        Method::POST,
        "/tools/save",
        Some(json!({"content": "user prefers dark mode"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["memory"]["gate"], "behavioral");
    let id = saved["memory"]["id"].as_str().unwrap().to_string();

    let (status, found) = send(
        &app,
        Method::POST,
        "/tools/search",
        Some(json!({"query": "dark mode", "limit": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["results"][0]["memory"]["id"], id.as_str());
    assert!(found["results"][0]["trace"]["final_score"].as_f64().unwrap() > 0.0);

    let (status, receipt) = send(
        &app,
        Method::POST,
        "/tools/forget",
        Some(json!({"id": id, "reason": "changed my mind"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["reason"], "changed my mind");

    let (status, body) = send(&app, Method::GET, &format!("/memories/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn test_prime_and_extract_tools() {
    let (app, _dir) = app();
    send(
        &app,
        Method::POST,
        "/tools/save",
        Some(json!({"content": "user prefers dark mode"})),
    )
    .await;

    let (status, primed) = send(
        &app,
        Method::POST,
        "/tools/prime",
        Some(json!({"message": "dark mode"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(primed["memories"].as_array().unwrap().len(), 1);
    assert!(
        primed["context"]
            .as_str()
            .unwrap()
            .contains("[behavioral, relevance=")
    );

    // no model configured, so extraction is unavailable
    let (status, body) = send(
        &app,
        Method::POST,
        "/tools/extract",
        Some(json!({"transcript": "user: remember that I use tabs"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["kind"], "classification_degraded");
}

#[tokio::test]
async fn test_validation_errors_are_structured() {
    let (app, _dir) = app();

    let (status, body) = send(&app, Method::POST, "/tools/save", Some(json!({"content": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("empty"));

    let (status, body) = send(&app, Method::POST, "/search", Some(json!({"query": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");

    let (status, body) = send(&app, Method::GET, "/memories?gate=mystery", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
}

#[tokio::test]
async fn test_memory_admin_routes() {
    let (app, _dir) = app();

    let (status, created) = send(
        &app,
        Method::POST,
        "/memories",
        Some(json!({"content": "Alice is my manager", "person": "Alice"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["memory"]["id"].as_str().unwrap().to_string();

    let (status, page) = send(&app, Method::GET, "/memories?gate=relational&limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["id"], id.as_str());

    let (status, updated) = send(
        &app,
        Method::PATCH,
        &format!("/memories/{id}"),
        Some(json!({"project": "atlas"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["memory"]["project"], "atlas");

    let (status, pinned) = send(&app, Method::POST, &format!("/memories/{id}/pin"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pinned["pinned"], true);
    let (_, unpinned) = send(&app, Method::DELETE, &format!("/memories/{id}/pin"), None).await;
    assert_eq!(unpinned["pinned"], false);

    let (status, reviewed) = send(
        &app,
        Method::PUT,
        &format!("/memories/{id}/sensitivity"),
        Some(json!({"level": "safe", "reason": "work relationship"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reviewed["sensitivity"], "safe");

    let (status, neighbors) =
        send(&app, Method::GET, &format!("/memories/{id}/neighbors?depth=2"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(neighbors["id"], id.as_str());
    assert!(neighbors["neighbors"].as_array().unwrap().is_empty());

    // forget with the reason in the query string
    let (status, _) = send(&app, Method::DELETE, &format!("/memories/{id}"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, receipt) = send(
        &app,
        Method::DELETE,
        &format!("/memories/{id}?reason=left%20the%20company"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["reason"], "left the company");
}

#[tokio::test]
async fn test_delete_with_json_body() {
    let (app, _dir) = app();
    let (_, created) = send(
        &app,
        Method::POST,
        "/memories",
        Some(json!({"content": "the build uses cargo nextest"})),
    )
    .await;
    let id = created["memory"]["id"].as_str().unwrap().to_string();

    let (status, receipt) = send(
        &app,
        Method::DELETE,
        &format!("/memories/{id}"),
        Some(json!({"reason": "switched runners"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(receipt["reason"], "switched runners");
}

#[tokio::test]
async fn test_rules_identity_and_journal() {
    let (app, _dir) = app();

    let (status, rule) = send(
        &app,
        Method::POST,
        "/rules",
        Some(json!({"condition": "standup", "enforcement": "enforce", "gate": "promissory"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let (status, updated) = send(
        &app,
        Method::PUT,
        &format!("/rules/{rule_id}"),
        Some(json!({"enforcement": "warn"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["enforcement"], "warn");

    let (_, rules) = send(&app, Method::GET, "/rules", None).await;
    assert_eq!(rules.as_array().unwrap().len(), 1);

    let (status, _) = send(&app, Method::DELETE, &format!("/rules/{rule_id}"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::DELETE, &format!("/rules/{rule_id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, identity) = send(
        &app,
        Method::PUT,
        "/identity",
        Some(json!({"sections": [{"title": "About me", "body": "Backend engineer"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(identity["sections"][0]["manual"], true);
    let (_, identity) = send(&app, Method::GET, "/identity", None).await;
    assert_eq!(identity["sections"][0]["title"], "About me");

    let (status, entry) = send(
        &app,
        Method::POST,
        "/journal/checkpoint",
        Some(json!({"summary": "wrapped up the migration plan"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(entry["kind"], "checkpoint");
    let (status, journal) = send(&app, Method::GET, "/journal?days=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(journal.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_maintenance_routes() {
    let (app, _dir) = app();
    send(
        &app,
        Method::POST,
        "/tools/save",
        Some(json!({"content": "my password is hunter22"})),
    )
    .await;

    let (status, report) = send(&app, Method::POST, "/reflect", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(report["run_id"].is_string());

    let (status, report) = send(&app, Method::POST, "/reconcile", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["failed"], 0);

    let (status, report) = send(&app, Method::POST, "/classify?force=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["examined"], 1);
    assert_eq!(report["critical"], 1);

    let (status, findings) = send(&app, Method::GET, "/pii", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(findings[0]["kinds"][0], "password");

    let (status, stats) = send(&app, Method::GET, "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_memories"], 1);
    assert_eq!(stats["vector_backend"], "memory");
    assert!(stats["last_reflection"].is_object());
}
