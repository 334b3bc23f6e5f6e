//! Common test utilities for flowhook-webhooks integration tests.
//!
//! Provides a fully wired in-process app driven through `oneshot`, a manual
//! clock, signing helpers and wiremock responders standing in for the agent
//! platform.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;
use wiremock::{Request as MockRequest, Respond, ResponseTemplate};

use flowhook_webhooks::{
    webhooks_router, Clock, InMemoryEventStore, ManualClock, ReliabilityConfig, ReliabilityState,
    SharedClock, WebhooksState,
};

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// Standard test secrets
pub const SECRET: &str = "whsec_test_secret_key_12345";
pub const OTHER_SECRET: &str = "whsec_another_secret_67890";
pub const ADMIN_TOKEN: &str = "admin_test_token_abcdef";

/// Configuration with every critical value present and a low breaker threshold.
pub fn test_config() -> ReliabilityConfig {
    ReliabilityConfig {
        webhook_secret: Some(SECRET.to_string()),
        upstream_base_url: Some("https://agents.example.com".to_string()),
        admin_token: Some(ADMIN_TOKEN.to_string()),
        breaker_failure_threshold: 3,
        breaker_success_threshold: 2,
        breaker_cooldown_secs: 30,
        ..ReliabilityConfig::default()
    }
}

// ---------------------------------------------------------------------------
// TestApp - wired state plus router
// ---------------------------------------------------------------------------

/// In-process application with a controllable clock and store.
pub struct TestApp {
    pub state: Arc<ReliabilityState>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryEventStore>,
    pub router: Router,
}

impl TestApp {
    /// App with [`test_config`] and no reachable upstream.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: ReliabilityConfig) -> Self {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryEventStore::new());
        let shared: SharedClock = clock.clone();
        let state = Arc::new(
            ReliabilityState::builder(config)
                .clock(shared)
                .store(store.clone())
                .build()
                .unwrap(),
        );
        let router = webhooks_router(WebhooksState::new(state.clone()));
        Self {
            state,
            clock,
            store,
            router,
        }
    }

    /// App whose upstream points at a mock server.
    pub fn with_upstream(base_url: &str) -> Self {
        Self::with_config(ReliabilityConfig {
            upstream_base_url: Some(base_url.to_string()),
            dependency_timeout_ms: 500,
            ..test_config()
        })
    }

    /// Sign `body` with [`SECRET`] at the current clock time.
    pub fn sign(&self, body: &[u8]) -> String {
        sign_with(SECRET, self.clock.now().timestamp(), body)
    }

    /// POST a signed event to the ingest endpoint.
    pub async fn ingest(&self, body: &[u8]) -> TestResponse {
        let signature = self.sign(body);
        self.ingest_with(body, Some(&signature)).await
    }

    /// POST an event with an explicit (possibly missing) signature header.
    pub async fn ingest_with(&self, body: &[u8], signature: Option<&str>) -> TestResponse {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/ingest")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("x-webhook-signature", signature);
        }
        self.send(builder.body(Body::from(body.to_vec())).unwrap())
            .await
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    pub async fn post_json(&self, uri: &str, body: &Value) -> TestResponse {
        self.send(
            Request::builder()
                .method(Method::POST)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(body).unwrap()))
                .unwrap(),
        )
        .await
    }

    /// POST to an admin route with an optional bearer token.
    pub async fn admin_post(&self, uri: &str, token: Option<&str>) -> TestResponse {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        TestResponse {
            status,
            headers,
            body,
        }
    }
}

impl Default for TestApp {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded HTTP response.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

// ---------------------------------------------------------------------------
// Event payload helpers
// ---------------------------------------------------------------------------

/// Serialized inbound event.
pub fn event_body(workflow_id: &str, agent_id: &str, offset: i64, status: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "workflow_id": workflow_id,
        "agent_id": agent_id,
        "offset": offset,
        "payload": { "summary": "done", "tokens": 42 },
        "execution_status": status,
    }))
    .unwrap()
}

/// Serialized inbound event with a custom payload.
pub fn event_body_with_payload(workflow_id: &str, payload: Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "workflow_id": workflow_id,
        "agent_id": "a1",
        "offset": 0,
        "payload": payload,
        "execution_status": "success",
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Helper functions for signatures
// ---------------------------------------------------------------------------

/// Compute HMAC-SHA256 over `{timestamp}{body}` independently of the crate.
pub fn compute_test_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");

    mac.update(timestamp.as_bytes());
    mac.update(body);

    hex::encode(mac.finalize().into_bytes())
}

/// Full `t=..,v1=..` header value.
pub fn sign_with(secret: &str, timestamp: i64, body: &[u8]) -> String {
    let ts = timestamp.to_string();
    format!("t={ts},v1={}", compute_test_signature(secret, &ts, body))
}

// ---------------------------------------------------------------------------
// CaptureResponder - records upstream calls
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    /// Parse the body as JSON.
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

/// A wiremock responder that captures incoming requests.
#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
}

impl CaptureResponder {
    /// Create a new capture responder that returns 200 OK.
    pub fn new() -> Self {
        Self::with_status(200)
    }

    /// Create a capture responder that returns a custom status code.
    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
        }
    }

    /// Get all captured requests.
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &MockRequest) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
        };
        self.requests.lock().unwrap().push(captured);
        ResponseTemplate::new(self.response_code)
            .set_body_json(serde_json::json!({ "run_id": "run-1", "status": "queued" }))
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

/// A wiremock responder that fails a specified number of times before succeeding.
#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    /// Create a responder that fails `n` times with 500, then returns 200.
    pub fn fail_times(n: u32) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code: 500,
        }
    }

    /// Fail with `code` instead of 500.
    pub fn with_status(mut self, code: u16) -> Self {
        self.failure_code = code;
        self
    }

    /// Get the current attempt count.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &MockRequest) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "queued" }))
        }
    }
}

// ---------------------------------------------------------------------------
// DelayedResponder - adds response delay
// ---------------------------------------------------------------------------

/// A wiremock responder that adds a delay before responding.
#[derive(Clone)]
pub struct DelayedResponder {
    delay_ms: u64,
}

impl DelayedResponder {
    /// Create a responder that delays for `ms` milliseconds.
    pub fn new(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Respond for DelayedResponder {
    fn respond(&self, _request: &MockRequest) -> ResponseTemplate {
        ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(self.delay_ms))
    }
}
