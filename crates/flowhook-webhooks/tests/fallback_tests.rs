//! Integration tests for latest-result reads and the degraded fallback.

mod common;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

#[tokio::test]
async fn latest_result_is_live_when_store_answers() {
    let app = TestApp::new();
    app.ingest(&event_body_with_payload("wf-1", json!({ "answer": 42 })))
        .await;

    let response = app.get("/webhooks/workflows/wf-1/latest").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["source"], "live");
    assert_eq!(response.body["degraded"], false);
    assert!(response.body.get("age_secs").is_none());
    assert_eq!(response.body["result"]["workflow_id"], "wf-1");
    assert_eq!(response.body["result"]["payload"]["answer"], 42);
}

#[tokio::test]
async fn outage_serves_last_good_result_as_degraded() {
    let app = TestApp::new();
    app.ingest(&event_body_with_payload("wf-1", json!({ "answer": 42 })))
        .await;
    assert_eq!(
        app.get("/webhooks/workflows/wf-1/latest").await.body["source"],
        "live"
    );

    app.store.set_available(false);
    app.clock.advance_secs(90);

    let response = app.get("/webhooks/workflows/wf-1/latest").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["source"], "cache");
    assert_eq!(response.body["degraded"], true);
    assert_eq!(response.body["persistent"], false);
    assert_eq!(response.body["age_secs"], 90);
    assert_eq!(response.body["result"]["payload"]["answer"], 42);
}

#[tokio::test]
async fn fallback_keeps_serving_while_breaker_is_open() {
    let app = TestApp::new();
    app.ingest(&event_body("wf-1", "a1", 0, "success")).await;

    app.store.set_available(false);
    for _ in 0..5 {
        let response = app.get("/webhooks/workflows/wf-1/latest").await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["degraded"], true);
    }
    assert_eq!(
        app.state.store_breaker.state(),
        flowhook_webhooks::circuit_breaker::CircuitState::Open
    );
}

#[tokio::test]
async fn unknown_workflow_is_not_found() {
    let app = TestApp::new();
    let response = app.get("/webhooks/workflows/wf-unknown/latest").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.body["error"], "result_not_found");
    assert_eq!(response.body["retriable"], false);
}

#[tokio::test]
async fn outage_without_cached_result_is_unavailable() {
    let app = TestApp::new();
    app.store.set_available(false);

    let response = app.get("/webhooks/workflows/wf-1/latest").await;
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.body["error"], "dependency_unavailable");
    assert_eq!(response.body["retriable"], true);
}

#[tokio::test]
async fn malformed_workflow_id_is_bad_request() {
    let app = TestApp::new();
    let response = app.get("/webhooks/workflows/wf%201/latest").await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body["error"], "schema_invalid");
}
