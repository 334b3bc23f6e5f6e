//! Administrative reset operations.
//!
//! All routes here sit behind [`admin_guard`]: a bearer token compared in
//! constant time against `ADMIN_TOKEN`. With no token configured every
//! request is refused with 403.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::crypto::constant_time_eq;
use crate::error::{ApiResult, WebhookError};
use crate::router::WebhooksState;

/// Outcome of a reset operation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResetResponse {
    /// What was reset.
    pub target: String,
    /// Number of entries cleared; zero when there was nothing to clear.
    pub cleared: usize,
    pub reset_at: DateTime<Utc>,
}

/// Require `Authorization: Bearer <ADMIN_TOKEN>`.
pub async fn admin_guard(
    State(state): State<WebhooksState>,
    request: Request,
    next: Next,
) -> Result<Response, WebhookError> {
    let Some(expected) = state.reliability.admin_token() else {
        tracing::warn!(target: "health", "Admin request refused: no admin token configured");
        return Err(WebhookError::Forbidden);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match provided {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            Ok(next.run(request).await)
        }
        _ => Err(WebhookError::Unauthorized),
    }
}

fn reset_response(state: &WebhooksState, target: &str, cleared: usize) -> ResetResponse {
    tracing::info!(target: "health", reset = target, cleared, "Administrative reset");
    ResetResponse {
        target: target.to_string(),
        cleared,
        reset_at: state.reliability.clock.now(),
    }
}

// ---------------------------------------------------------------------------
// Reset Handlers
// ---------------------------------------------------------------------------

/// Clear the cached health snapshot.
#[utoipa::path(
    post,
    path = "/webhooks/admin/health-cache/reset",
    tag = "Admin",
    responses(
        (status = 200, description = "Health cache cleared", body = ResetResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 403, description = "Admin operations disabled"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn reset_health_cache_handler(
    State(state): State<WebhooksState>,
) -> ApiResult<Json<ResetResponse>> {
    let cleared = usize::from(state.reliability.reset_health_cache());
    Ok(Json(reset_response(&state, "health_cache", cleared)))
}

/// Clear every daily trigger counter.
#[utoipa::path(
    post,
    path = "/webhooks/admin/trigger-counters/reset",
    tag = "Admin",
    responses(
        (status = 200, description = "Trigger counters cleared", body = ResetResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 403, description = "Admin operations disabled"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn reset_trigger_counters_handler(
    State(state): State<WebhooksState>,
) -> ApiResult<Json<ResetResponse>> {
    let cleared = state.reliability.reset_trigger_counters();
    Ok(Json(reset_response(&state, "trigger_counters", cleared)))
}

/// Return both circuit breakers to Closed.
#[utoipa::path(
    post,
    path = "/webhooks/admin/breakers/reset",
    tag = "Admin",
    responses(
        (status = 200, description = "Breakers reset", body = ResetResponse),
        (status = 401, description = "Missing or wrong admin token"),
        (status = 403, description = "Admin operations disabled"),
    ),
    security(("bearer_auth" = []))
)]
pub async fn reset_breakers_handler(
    State(state): State<WebhooksState>,
) -> ApiResult<Json<ResetResponse>> {
    state.reliability.reset_breakers();
    Ok(Json(reset_response(&state, "breakers", 2)))
}
