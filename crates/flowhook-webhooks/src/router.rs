//! Axum router setup for webhook endpoints.

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::handlers::{admin, alerts, health, ingest, metrics, triggers, workflows};
use crate::state::ReliabilityState;

/// Shared state for webhook handlers.
#[derive(Clone)]
pub struct WebhooksState {
    pub reliability: Arc<ReliabilityState>,
}

impl WebhooksState {
    /// Create a new webhooks state.
    pub fn new(reliability: Arc<ReliabilityState>) -> Self {
        Self { reliability }
    }
}

/// Creates the webhook router with all routes.
pub fn webhooks_router(state: WebhooksState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/webhooks/admin/health-cache/reset",
            post(admin::reset_health_cache_handler),
        )
        .route(
            "/webhooks/admin/trigger-counters/reset",
            post(admin::reset_trigger_counters_handler),
        )
        .route(
            "/webhooks/admin/breakers/reset",
            post(admin::reset_breakers_handler),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::admin_guard,
        ));

    Router::new()
        // Ingestion
        .route("/webhooks/ingest", post(ingest::ingest_handler))
        // Health and metrics
        .route("/webhooks/health", get(health::health_handler))
        .route("/webhooks/metrics", get(metrics::metrics_handler))
        // Alerts
        .route(
            "/webhooks/alerts",
            get(alerts::list_alerts_handler).post(alerts::create_alert_event_handler),
        )
        .route(
            "/webhooks/alerts/:id/resolve",
            post(alerts::resolve_alert_handler),
        )
        // Workflow results and triggers
        .route(
            "/webhooks/workflows/:workflow_id/latest",
            get(workflows::latest_result_handler),
        )
        .route("/webhooks/triggers", post(triggers::trigger_handler))
        .merge(admin_routes)
        .with_state(state)
}
