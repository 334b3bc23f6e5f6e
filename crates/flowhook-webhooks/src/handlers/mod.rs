//! HTTP handlers for the webhook reliability API.

pub mod admin;
pub mod alerts;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod triggers;
pub mod workflows;

use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::WebhookError;

/// Request header carrying a caller-supplied correlation identifier.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

const MAX_CORRELATION_ID_LEN: usize = 128;

/// Correlation id from the request, or a fresh one when absent or unusable.
#[must_use]
pub fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| {
            !v.is_empty()
                && v.len() <= MAX_CORRELATION_ID_LEN
                && v.chars().all(|c| c.is_ascii_graphic())
        })
        .map_or_else(|| Uuid::new_v4().to_string(), str::to_string)
}

/// Parse a JSON request body, reporting failures as schema errors.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, WebhookError> {
    serde_json::from_slice(body).map_err(|e| WebhookError::SchemaInvalid(e.to_string()))
}
