//! HTTP handlers for alerts.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::alerts::{Alert, AlertEvent, AlertStats};
use crate::error::{ApiResult, WebhookError};
use crate::handlers::{correlation_id, parse_json};
use crate::router::WebhooksState;

/// Query parameters for listing alerts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListAlertsQuery {
    /// Also return retained resolved alerts.
    #[serde(default)]
    pub include_resolved: bool,
}

/// Alerts with aggregate statistics.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AlertListResponse {
    pub alerts: Vec<Alert>,
    pub total: usize,
    pub stats: AlertStats,
}

/// Result of submitting an alert event.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AlertEventResponse {
    /// Whether a rule classified the event.
    pub matched: bool,
    /// The created or coalesced alert.
    pub alert: Option<Alert>,
}

// ---------------------------------------------------------------------------
// Alert Handlers
// ---------------------------------------------------------------------------

/// List active alerts, most severe first.
#[utoipa::path(
    get,
    path = "/webhooks/alerts",
    tag = "Alerts",
    params(
        ("include_resolved" = Option<bool>, Query, description = "Include retained resolved alerts"),
    ),
    responses(
        (status = 200, description = "Alert list", body = AlertListResponse),
    )
)]
pub async fn list_alerts_handler(
    State(state): State<WebhooksState>,
    Query(query): Query<ListAlertsQuery>,
) -> ApiResult<Json<AlertListResponse>> {
    let alerts = &state.reliability.alerts;

    let mut list = alerts.get_active_alerts();
    if query.include_resolved {
        list.extend(alerts.get_resolved_alerts());
    }
    let total = list.len();

    Ok(Json(AlertListResponse {
        alerts: list,
        total,
        stats: alerts.get_stats(),
    }))
}

/// Submit an externally-originated alert event for classification.
#[utoipa::path(
    post,
    path = "/webhooks/alerts",
    tag = "Alerts",
    request_body = AlertEvent,
    responses(
        (status = 200, description = "Event processed", body = AlertEventResponse),
        (status = 400, description = "Invalid alert event", body = crate::error::ErrorResponse),
    )
)]
pub async fn create_alert_event_handler(
    State(state): State<WebhooksState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<AlertEventResponse>> {
    let mut event: AlertEvent = parse_json(&body)?;
    event
        .validate()
        .map_err(|e| WebhookError::SchemaInvalid(e.to_string()))?;
    if !event.details.is_object() {
        return Err(WebhookError::SchemaInvalid(
            "details must be a JSON object".to_string(),
        ));
    }
    if event.correlation_id.is_none() {
        event.correlation_id = Some(correlation_id(&headers));
    }

    let alert = state.reliability.alerts.process_event(event);

    Ok(Json(AlertEventResponse {
        matched: alert.is_some(),
        alert,
    }))
}

/// Explicitly resolve an active alert.
#[utoipa::path(
    post,
    path = "/webhooks/alerts/{id}/resolve",
    tag = "Alerts",
    params(
        ("id" = Uuid, Path, description = "Alert ID")
    ),
    responses(
        (status = 200, description = "Resolved alert", body = Alert),
        (status = 404, description = "No active alert with this id", body = crate::error::ErrorResponse),
    )
)]
pub async fn resolve_alert_handler(
    State(state): State<WebhooksState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Alert>> {
    let alert = state.reliability.alerts.resolve(id)?;
    Ok(Json(alert))
}
