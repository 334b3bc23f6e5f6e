//! `OpenAPI` documentation for the webhook reliability API.

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::alerts::{Alert, AlertEvent, AlertStats, AlertStatus, Severity};
use crate::circuit_breaker::{BreakerSnapshot, CircuitState, FailureRecord};
use crate::error::ErrorResponse;
use crate::fallback_cache::{CacheEntry, CacheStats, FallbackRead};
use crate::handlers::{admin, alerts, health, ingest, metrics, triggers, workflows};
use crate::health::{ConfigChecks, HealthMetrics, HealthSnapshot, OverallStatus};
use crate::metrics::{MetricsSnapshot, StoreReachability, WindowCounts};
use crate::models::{ExecutionStatus, InboundEvent, IngestResponse};
use crate::rate_limiter::TriggerUsage;
use crate::services::{ResultSource, WorkflowResult};
use crate::upstream::{TriggerAck, TriggerRequest};

/// Bearer scheme for the administrative routes.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "flowhook API",
        version = "0.1.0",
        description = "Signed webhook ingestion with circuit breaking, fallback caching, alerting and health"
    ),
    paths(
        ingest::ingest_handler,
        health::health_handler,
        metrics::metrics_handler,
        alerts::list_alerts_handler,
        alerts::create_alert_event_handler,
        alerts::resolve_alert_handler,
        workflows::latest_result_handler,
        triggers::trigger_handler,
        admin::reset_health_cache_handler,
        admin::reset_trigger_counters_handler,
        admin::reset_breakers_handler,
    ),
    components(schemas(
        InboundEvent,
        ExecutionStatus,
        IngestResponse,
        ErrorResponse,
        HealthSnapshot,
        HealthMetrics,
        OverallStatus,
        ConfigChecks,
        WindowCounts,
        StoreReachability,
        MetricsSnapshot,
        BreakerSnapshot,
        CircuitState,
        FailureRecord,
        CacheEntry,
        CacheStats,
        FallbackRead,
        Alert,
        AlertEvent,
        AlertStats,
        AlertStatus,
        Severity,
        TriggerRequest,
        TriggerAck,
        TriggerUsage,
        WorkflowResult,
        ResultSource,
        metrics::MetricsResponse,
        alerts::AlertListResponse,
        alerts::AlertEventResponse,
        admin::ResetResponse,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "Ingestion", description = "Signed event ingestion"),
        (name = "Health", description = "Pipeline health snapshot"),
        (name = "Metrics", description = "Breakers, cache and counters"),
        (name = "Alerts", description = "Alert listing, submission and resolution"),
        (name = "Workflows", description = "Latest workflow results"),
        (name = "Triggers", description = "Upstream workflow triggers"),
        (name = "Admin", description = "Administrative resets"),
    )
)]
pub struct ApiDoc;
