//! HTTP API through the axum router, without binding a socket.

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use cas_tier_router::server::api::{build_router, AppState};

use common::{fast_config, start, CountingBackend};

async fn app() -> axum::Router {
    let service = start(
        fast_config(),
        Arc::new(CountingBackend::answering(0.9)),
        Arc::new(CountingBackend::answering(0.95)),
    )
    .await;
    build_router(Arc::new(AppState::new(&service)))
}

async fn send(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

fn ingest_body() -> Value {
    json!({
        "record": {"schema": "task", "fields": {"name": "Recon", "priority": "high"}},
        "context": {"source": "ops", "timestamp": 1_700_000_000},
        "identity": "task-1"
    })
}

#[tokio::test]
async fn test_ingest_then_expand() {
    let app = app().await;

    let (status, receipt) = send(&app, Method::POST, "/v1/records", Some(ingest_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["outcome"], "inserted");
    assert_eq!(receipt["stage_sizes"], json!([61, 31, 16]));

    let key = receipt["key"].as_str().unwrap().to_string();
    let (status, record) = send(&app, Method::GET, &format!("/v1/records/{key}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record, ingest_body()["record"]);

    let (status, stats) = send(&app, Method::GET, "/v1/cas/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["entries"], 1);
    assert_eq!(stats["in_flight"], 0);
}

#[tokio::test]
async fn test_delete_then_missing() {
    let app = app().await;
    let (_, receipt) = send(&app, Method::POST, "/v1/records", Some(ingest_body())).await;
    let uri = format!("/v1/records/{}", receipt["key"].as_str().unwrap());

    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_key_is_bad_request() {
    let app = app().await;
    let (status, _) = send(&app, Method::GET, "/v1/records/not-a-key", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_field_name_is_bad_request() {
    let app = app().await;
    let body = json!({
        "record": {"schema": "task", "fields": {"callsign": "x"}},
        "context": {"source": "ops"},
        "identity": "task-1"
    });
    let (status, body) = send(&app, Method::POST, "/v1/records", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("callsign"));
}

#[tokio::test]
async fn test_execute_reports_tier_and_states() {
    let app = app().await;
    let body = json!({
        "query": {"schema": "query", "fields": {"operation": "ROUTE"}},
        "context": {"source": "ops", "timestamp": 1_700_000_000},
        "identity": "analyst-1"
    });

    let (status, outcome) = send(&app, Method::POST, "/v1/execute", Some(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["tier"], "B");
    assert_eq!(outcome["states"], json!(["classify", "try_a", "try_b", "done"]));
    assert_eq!(outcome["shared"], false);
    assert!(outcome["elapsed_ms"].is_f64());
}

#[tokio::test]
async fn test_health_and_metrics() {
    let app = app().await;
    send(
        &app,
        Method::POST,
        "/v1/execute",
        Some(json!({
            "query": {"schema": "query", "fields": {"operation": "SEND"}},
            "context": {"source": "ops"},
            "identity": "analyst-1"
        })),
    )
    .await;

    let (status, health) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "ok");

    let (status, metrics) = send(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = metrics.as_str().unwrap();
    assert!(text.contains("cas_router_tier_requests_total"));
    assert!(text.contains("cas_router_request_seconds"));
}
