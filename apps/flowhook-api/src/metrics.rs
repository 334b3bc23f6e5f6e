//! Prometheus exposition of the pipeline counters.
//!
//! Serves the `prometheus_client` registry held by `WebhookMetrics` in the
//! text format at `GET /metrics` for scraping. The JSON view stays at
//! `/webhooks/metrics`.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use flowhook_webhooks::ReliabilityState;

const CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Handler for `GET /metrics`.
pub async fn metrics_handler(State(state): State<Arc<ReliabilityState>>) -> Response {
    match state.metrics.encode_prometheus() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowhook_webhooks::ReliabilityConfig;

    #[tokio::test]
    async fn test_metrics_handler_serves_text_exposition() {
        let state = Arc::new(
            ReliabilityState::builder(ReliabilityConfig::default())
                .build()
                .unwrap(),
        );
        state.metrics.record_trigger(true);

        let response = metrics_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], CONTENT_TYPE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("upstream_triggers_total{result=\"Sent\"} 1"));
        assert!(text.contains("# TYPE webhook_ingest_duration_seconds histogram"));
    }
}
