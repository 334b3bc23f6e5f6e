//! HTTP handler for signed webhook ingestion.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};

use crate::crypto::SIGNATURE_HEADER;
use crate::error::CorrelatedError;
use crate::handlers::correlation_id;
use crate::models::IngestResponse;
use crate::router::WebhooksState;

/// Ingest a signed event from the agent platform.
///
/// Duplicate deliveries are acknowledged with `duplicate: true`.
#[utoipa::path(
    post,
    path = "/webhooks/ingest",
    tag = "Ingestion",
    request_body(content = crate::models::InboundEvent, description = "Workflow result event"),
    params(
        ("x-webhook-signature" = String, Header, description = "t=<unix-seconds>,v1=<hex-hmac>"),
        ("x-correlation-id" = Option<String>, Header, description = "Caller correlation id"),
    ),
    responses(
        (status = 200, description = "Event accepted or recognised as duplicate", body = IngestResponse),
        (status = 400, description = "Event failed schema validation", body = crate::error::ErrorResponse),
        (status = 401, description = "Signature missing, invalid or expired", body = crate::error::ErrorResponse),
        (status = 503, description = "Event Store unavailable; retry later", body = crate::error::ErrorResponse),
        (status = 504, description = "Event Store timed out; retry later", body = crate::error::ErrorResponse),
    )
)]
pub async fn ingest_handler(
    State(state): State<WebhooksState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, CorrelatedError> {
    let correlation_id = correlation_id(&headers);
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());

    match state
        .reliability
        .ingest
        .ingest(&body, signature, &correlation_id)
        .await
    {
        Ok(outcome) => Ok(Json(IngestResponse::from_outcome(&outcome, correlation_id))),
        Err(error) => Err(CorrelatedError {
            correlation_id,
            error,
        }),
    }
}
