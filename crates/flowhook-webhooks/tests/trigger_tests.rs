//! Integration tests for upstream workflow triggers against a mock platform.

mod common;

use axum::http::StatusCode;
use chrono::{TimeZone, Utc};
use common::*;
use flowhook_webhooks::circuit_breaker::CircuitState;
use flowhook_webhooks::ReliabilityConfig;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

async fn mount(server: &MockServer, workflow_id: &str, responder: impl wiremock::Respond + 'static) {
    Mock::given(method("POST"))
        .and(path(format!("/workflows/{workflow_id}/trigger")))
        .respond_with(responder)
        .mount(server)
        .await;
}

fn trigger_body(workflow_id: &str) -> serde_json::Value {
    json!({
        "workflow_id": workflow_id,
        "input": { "ticket": 1234 },
        "metadata": { "source": "tests" },
    })
}

// ---------------------------------------------------------------------------
// Successful triggers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trigger_is_signed_and_acknowledged() {
    let server = MockServer::start().await;
    let responder = CaptureResponder::new();
    mount(&server, "wf-1", responder.clone()).await;

    let app = TestApp::with_upstream(&server.uri());
    let response = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["workflow_id"], "wf-1");
    assert_eq!(response.body["status_code"], 200);
    assert_eq!(response.body["response"]["run_id"], "run-1");

    let requests = responder.requests();
    assert_eq!(requests.len(), 1);
    let captured = &requests[0];
    let sent: serde_json::Value = captured.body_json().unwrap();
    assert_eq!(sent["input"]["ticket"], 1234);
    assert_eq!(sent["metadata"]["source"], "tests");

    // The platform can verify the call with the shared secret.
    let header = captured.header("x-webhook-signature").unwrap();
    let (ts_part, sig_part) = header.split_once(',').unwrap();
    let ts = ts_part.strip_prefix("t=").unwrap();
    let sig = sig_part.strip_prefix("v1=").unwrap();
    assert_eq!(sig, compute_test_signature(SECRET, ts, &captured.body));
}

#[tokio::test]
async fn acknowledgement_uses_injected_clock() {
    let server = MockServer::start().await;
    let responder = CaptureResponder::new();
    mount(&server, "wf-1", responder.clone()).await;

    let app = TestApp::with_upstream(&server.uri());
    let fixed = Utc.with_ymd_and_hms(2024, 1, 28, 12, 0, 0).unwrap();
    app.clock.set(fixed);

    let response = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body["triggered_at"], "2024-01-28T12:00:00Z");

    let requests = responder.requests();
    let header = requests[0].header("x-webhook-signature").unwrap();
    assert!(header.starts_with(&format!("t={},", fixed.timestamp())));
}

#[tokio::test]
async fn api_key_is_sent_as_bearer() {
    let server = MockServer::start().await;
    let responder = CaptureResponder::new();
    mount(&server, "wf-1", responder.clone()).await;

    let app = TestApp::with_config(ReliabilityConfig {
        upstream_base_url: Some(server.uri()),
        upstream_api_key: Some("platform-key".to_string()),
        dependency_timeout_ms: 500,
        ..test_config()
    });
    app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;

    assert_eq!(
        responder.requests()[0].header("authorization"),
        Some("Bearer platform-key")
    );
}

#[tokio::test]
async fn successful_trigger_is_counted() {
    let server = MockServer::start().await;
    mount(&server, "wf-1", CaptureResponder::new()).await;

    let app = TestApp::with_upstream(&server.uri());
    app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;

    let metrics = app.get("/webhooks/metrics").await;
    assert_eq!(metrics.status, StatusCode::OK);
    let usage = metrics.body["trigger_usage"].as_array().unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0]["workflow_id"], "wf-1");
    assert_eq!(usage[0]["used"], 1);
}

// ---------------------------------------------------------------------------
// Request validation and configuration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_trigger_request_is_bad_request() {
    let app = TestApp::new();

    let no_id = app.post_json("/webhooks/triggers", &json!({ "input": {} })).await;
    assert_eq!(no_id.status, StatusCode::BAD_REQUEST);
    assert_eq!(no_id.body["error"], "schema_invalid");

    let bad_input = app
        .post_json("/webhooks/triggers", &json!({ "workflow_id": "wf-1", "input": [1] }))
        .await;
    assert_eq!(bad_input.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unconfigured_upstream_is_configuration_error() {
    let app = TestApp::with_config(ReliabilityConfig {
        upstream_base_url: None,
        ..test_config()
    });

    let response = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.body["error"], "configuration_missing");
    assert_eq!(response.body["retriable"], false);
}

// ---------------------------------------------------------------------------
// Upstream failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upstream_errors_raise_alert_and_trip_breaker() {
    let server = MockServer::start().await;
    let responder = FailingResponder::fail_times(100);
    mount(&server, "wf-1", responder.clone()).await;

    let app = TestApp::with_upstream(&server.uri());
    for _ in 0..3 {
        let response = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.body["error"], "dependency_unavailable");
    }
    assert_eq!(app.state.upstream_breaker.state(), CircuitState::Open);

    let rejected = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
    assert_eq!(rejected.body["error"], "breaker_open");
    assert!(rejected.headers.contains_key("retry-after"));
    assert_eq!(responder.attempt_count(), 3, "Open breaker must not call upstream");

    let alerts = app.state.alerts.get_active_alerts();
    let upstream = alerts
        .iter()
        .find(|a| a.rule == "upstream_failure")
        .expect("upstream failure alert");
    assert_eq!(upstream.occurrence_count, 3);
    assert!(alerts
        .iter()
        .any(|a| a.rule == "breaker_open" && a.title == "Circuit breaker upstream is open"));
}

#[tokio::test]
async fn unknown_workflow_rejection_does_not_trip_breaker() {
    let server = MockServer::start().await;
    let responder = FailingResponder::fail_times(100).with_status(404);
    mount(&server, "wf-missing", responder.clone()).await;

    let app = TestApp::with_upstream(&server.uri());
    for _ in 0..5 {
        let response = app
            .post_json("/webhooks/triggers", &trigger_body("wf-missing"))
            .await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(response.body["error"], "upstream_rejected");
        assert_eq!(response.body["retriable"], false);
    }

    assert_eq!(responder.attempt_count(), 5);
    assert_eq!(app.state.upstream_breaker.state(), CircuitState::Closed);
    assert_eq!(app.state.upstream_breaker.failure_count(), 0);
    assert_eq!(app.state.metrics.snapshot().triggers_failed, 5);
}

#[tokio::test]
async fn throttled_upstream_still_trips_breaker() {
    let server = MockServer::start().await;
    mount(&server, "wf-1", FailingResponder::fail_times(100).with_status(429)).await;

    let app = TestApp::with_upstream(&server.uri());
    for _ in 0..3 {
        let response = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    }
    assert_eq!(app.state.upstream_breaker.state(), CircuitState::Open);
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let server = MockServer::start().await;
    mount(&server, "wf-1", DelayedResponder::new(2_000)).await;

    let app = TestApp::with_upstream(&server.uri());
    let response = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;

    assert_eq!(response.status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(response.body["error"], "timeout");
    assert_eq!(response.body["retriable"], true);
    assert_eq!(app.state.upstream_breaker.failure_count(), 1);
}

#[tokio::test]
async fn upstream_recovers_after_cooldown() {
    let server = MockServer::start().await;
    mount(&server, "wf-1", FailingResponder::fail_times(3)).await;

    let app = TestApp::with_upstream(&server.uri());
    for _ in 0..3 {
        app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
    }
    assert_eq!(app.state.upstream_breaker.state(), CircuitState::Open);

    app.clock.advance_secs(31);
    for _ in 0..2 {
        let response = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
        assert_eq!(response.status, StatusCode::OK);
    }
    assert_eq!(app.state.upstream_breaker.state(), CircuitState::Closed);
}

// ---------------------------------------------------------------------------
// Daily limit
// ---------------------------------------------------------------------------

fn limited_app(base_url: &str, limit: u32) -> TestApp {
    TestApp::with_config(ReliabilityConfig {
        upstream_base_url: Some(base_url.to_string()),
        dependency_timeout_ms: 500,
        trigger_daily_limit: limit,
        ..test_config()
    })
}

#[tokio::test]
async fn daily_limit_rejects_then_admin_reset_restores() {
    let server = MockServer::start().await;
    let responder = CaptureResponder::new();
    mount(&server, "wf-1", responder.clone()).await;
    mount(&server, "wf-2", CaptureResponder::new()).await;

    let app = limited_app(&server.uri(), 2);
    for _ in 0..2 {
        assert_eq!(
            app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await.status,
            StatusCode::OK
        );
    }

    let limited = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
    assert_eq!(limited.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.body["error"], "rate_limited");
    assert_eq!(responder.request_count(), 2);

    // Budgets are per workflow.
    assert_eq!(
        app.post_json("/webhooks/triggers", &trigger_body("wf-2")).await.status,
        StatusCode::OK
    );

    let reset = app
        .admin_post("/webhooks/admin/trigger-counters/reset", Some(ADMIN_TOKEN))
        .await;
    assert_eq!(reset.status, StatusCode::OK);
    assert_eq!(reset.body["cleared"], 2);

    assert_eq!(
        app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await.status,
        StatusCode::OK
    );
}

#[tokio::test]
async fn daily_limit_raises_info_alert() {
    let server = MockServer::start().await;
    mount(&server, "wf-1", CaptureResponder::new()).await;

    let app = limited_app(&server.uri(), 1);
    app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
    app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;

    let alerts = app.state.alerts.get_active_alerts();
    let limit = alerts
        .iter()
        .find(|a| a.rule == "trigger_limit")
        .expect("trigger limit alert");
    assert_eq!(limit.title, "Daily trigger limit reached for wf-1");
}

#[tokio::test]
async fn breaker_rejection_does_not_consume_budget() {
    let server = MockServer::start().await;
    mount(&server, "wf-1", FailingResponder::fail_times(100)).await;

    let app = limited_app(&server.uri(), 5);
    for _ in 0..3 {
        app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
    }
    for _ in 0..4 {
        let response = app.post_json("/webhooks/triggers", &trigger_body("wf-1")).await;
        assert_eq!(response.body["error"], "breaker_open");
    }

    let usage = app.state.trigger_limiter.snapshot();
    assert_eq!(usage[0].used, 3);
}
