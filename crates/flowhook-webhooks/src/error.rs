//! Error types for the webhook reliability pipeline.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::circuit_breaker::BreakerError;
use crate::store::StoreError;
use crate::upstream::UpstreamError;

/// Pipeline error variants.
///
/// Duplicate deliveries are not represented here: they are a successful
/// ingest outcome (see [`crate::models::IngestOutcome`]).
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid event: {0}")]
    SchemaInvalid(String),

    #[error("Dependency '{dependency}' unavailable: {reason}")]
    DependencyUnavailable { dependency: String, reason: String },

    #[error("Circuit breaker for '{dependency}' is open")]
    BreakerOpen {
        dependency: String,
        retry_after_secs: u64,
    },

    #[error("Call to '{dependency}' timed out after {timeout_ms}ms")]
    Timeout { dependency: String, timeout_ms: u64 },

    #[error("Required configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Upstream rejected the request with HTTP {status}: {reason}")]
    UpstreamRejected { status: u16, reason: String },

    #[error("Daily trigger limit ({limit}) reached for workflow {workflow_id}")]
    RateLimited { workflow_id: String, limit: u32 },

    #[error("Alert not found: {0}")]
    AlertNotFound(Uuid),

    #[error("No result recorded for workflow {0}")]
    ResultNotFound(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden")]
    Forbidden,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl WebhookError {
    /// Whether the caller may retry the same request later.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::DependencyUnavailable { .. }
                | Self::BreakerOpen { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
        )
    }

    /// Whether this error should count against a dependency's health.
    ///
    /// Breaker rejections are excluded: nothing was attempted.
    #[must_use]
    pub fn is_dependency_failure(&self) -> bool {
        matches!(
            self,
            Self::DependencyUnavailable { .. } | Self::Timeout { .. }
        )
    }

    /// HTTP status and stable error code for this variant.
    #[must_use]
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::InvalidSignature => (StatusCode::UNAUTHORIZED, "invalid_signature"),
            Self::SchemaInvalid(_) => (StatusCode::BAD_REQUEST, "schema_invalid"),
            Self::DependencyUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "dependency_unavailable")
            }
            Self::BreakerOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "breaker_open"),
            Self::Timeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            Self::ConfigurationMissing(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_missing")
            }
            Self::UpstreamRejected { .. } => (StatusCode::BAD_GATEWAY, "upstream_rejected"),
            Self::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Self::AlertNotFound(_) => (StatusCode::NOT_FOUND, "alert_not_found"),
            Self::ResultNotFound(_) => (StatusCode::NOT_FOUND, "result_not_found"),
            Self::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }

    /// Converts a breaker outcome around an Event Store call.
    pub fn from_store_call(err: BreakerError<StoreError>) -> Self {
        Self::from_breaker(err)
    }

    /// Converts a breaker outcome around an upstream call.
    pub fn from_upstream_call(err: BreakerError<UpstreamError>) -> Self {
        Self::from_breaker(err)
    }

    fn from_breaker<E: std::fmt::Display>(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open {
                breaker,
                retry_after_secs,
                ..
            } => Self::BreakerOpen {
                dependency: breaker,
                retry_after_secs,
            },
            BreakerError::Timeout {
                breaker,
                timeout_ms,
            } => Self::Timeout {
                dependency: breaker,
                timeout_ms,
            },
            BreakerError::Failed { breaker, error } => Self::DependencyUnavailable {
                dependency: breaker,
                reason: error.to_string(),
            },
        }
    }
}

/// JSON error response returned by webhook endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
    pub retriable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

fn render(err: &WebhookError, correlation_id: Option<String>) -> Response {
    let (status, error_type) = err.status_and_code();

    let body = ErrorResponse {
        error: error_type.to_string(),
        message: err.to_string(),
        status: status.as_u16(),
        retriable: err.is_retriable(),
        correlation_id,
    };

    let mut response = (status, axum::Json(body)).into_response();
    if let WebhookError::BreakerOpen {
        retry_after_secs, ..
    } = err
    {
        if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        render(&self, None)
    }
}

/// An error tagged with the request's correlation identifier.
#[derive(Debug)]
pub struct CorrelatedError {
    pub correlation_id: String,
    pub error: WebhookError,
}

impl IntoResponse for CorrelatedError {
    fn into_response(self) -> Response {
        render(&self.error, Some(self.correlation_id))
    }
}

pub type ApiResult<T> = Result<T, WebhookError>;
