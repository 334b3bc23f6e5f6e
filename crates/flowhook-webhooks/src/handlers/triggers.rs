//! HTTP handler for upstream workflow triggers.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};

use crate::error::CorrelatedError;
use crate::handlers::{correlation_id, parse_json};
use crate::router::WebhooksState;
use crate::upstream::{TriggerAck, TriggerRequest};

/// Start a workflow run on the agent platform.
#[utoipa::path(
    post,
    path = "/webhooks/triggers",
    tag = "Triggers",
    request_body = TriggerRequest,
    responses(
        (status = 200, description = "Trigger acknowledged by the platform", body = TriggerAck),
        (status = 400, description = "Invalid trigger request", body = crate::error::ErrorResponse),
        (status = 429, description = "Daily trigger limit reached", body = crate::error::ErrorResponse),
        (status = 500, description = "Upstream not configured", body = crate::error::ErrorResponse),
        (status = 503, description = "Upstream unavailable or breaker open", body = crate::error::ErrorResponse),
    )
)]
pub async fn trigger_handler(
    State(state): State<WebhooksState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TriggerAck>, CorrelatedError> {
    let correlation_id = correlation_id(&headers);

    let result = match parse_json::<TriggerRequest>(&body) {
        Ok(request) => {
            state
                .reliability
                .triggers
                .trigger(request, &correlation_id)
                .await
        }
        Err(e) => Err(e),
    };

    result.map(Json).map_err(|error| CorrelatedError {
        correlation_id,
        error,
    })
}
