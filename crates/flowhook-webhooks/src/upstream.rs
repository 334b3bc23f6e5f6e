//! Calls back into the agent platform.
//!
//! Outbound requests are signed with the same `t=...,v1=...` header format the
//! platform uses for inbound webhooks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::clock::SharedClock;
use crate::crypto::{SignatureVerifier, SIGNATURE_HEADER};
use crate::error::WebhookError;
use crate::validation::validate_identifier;

/// Maximum response body kept in error messages.
const MAX_ERROR_BODY: usize = 4096;

/// Errors raised by an upstream call.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("Upstream request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Upstream responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Could not sign upstream request: {0}")]
    Signing(String),
}

impl UpstreamError {
    /// Client errors that retrying cannot fix. 408 and 429 are transient.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Status { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            Self::Request(_) | Self::Signing(_) => false,
        }
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Request to start a workflow run on the platform.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct TriggerRequest {
    #[validate(length(min = 1, max = 255))]
    pub workflow_id: String,

    /// Input passed to the workflow run.
    #[serde(default = "empty_object")]
    #[schema(value_type = Object)]
    pub input: serde_json::Value,

    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
}

impl TriggerRequest {
    pub fn validate_request(&self) -> Result<(), WebhookError> {
        self.validate()
            .map_err(|e| WebhookError::SchemaInvalid(e.to_string()))?;
        validate_identifier("workflow_id", &self.workflow_id)?;
        if !self.input.is_object() {
            return Err(WebhookError::SchemaInvalid(
                "input must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

/// Platform acknowledgement of a trigger.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TriggerAck {
    pub workflow_id: String,
    pub status_code: u16,
    /// Parsed response body when it was JSON.
    #[schema(value_type = Option<Object>)]
    pub response: Option<serde_json::Value>,
    pub triggered_at: DateTime<Utc>,
}

/// Client for the agent platform.
#[async_trait]
pub trait UpstreamNotifier: Send + Sync {
    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerAck, UpstreamError>;
}

/// HTTP client for the agent platform.
#[derive(Clone)]
pub struct HttpUpstreamNotifier {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    signer: SignatureVerifier,
    clock: SharedClock,
}

impl std::fmt::Debug for HttpUpstreamNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpUpstreamNotifier")
            .field("base_url", &self.base_url)
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl HttpUpstreamNotifier {
    /// Build a notifier for `base_url`.
    ///
    /// Per-call deadlines are enforced by the upstream breaker; the client
    /// timeout is only a backstop.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        signer: SignatureVerifier,
        clock: SharedClock,
    ) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("flowhook/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            signer,
            clock,
        })
    }

    fn trigger_url(&self, workflow_id: &str) -> String {
        format!("{}/workflows/{workflow_id}/trigger", self.base_url)
    }
}

#[async_trait]
impl UpstreamNotifier for HttpUpstreamNotifier {
    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerAck, UpstreamError> {
        let body = serde_json::to_vec(&serde_json::json!({
            "input": request.input,
            "metadata": request.metadata,
        }))
        .map_err(|e| UpstreamError::Signing(e.to_string()))?;
        let signature = self
            .signer
            .sign(&body)
            .map_err(|e| UpstreamError::Signing(e.to_string()))?;

        let mut builder = self
            .client
            .post(self.trigger_url(&request.workflow_id))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::warn!(
                target: "upstream",
                workflow_id = %request.workflow_id,
                status = status.as_u16(),
                "Upstream rejected trigger"
            );
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        tracing::info!(
            target: "upstream",
            workflow_id = %request.workflow_id,
            status = status.as_u16(),
            "Workflow triggered upstream"
        );

        Ok(TriggerAck {
            workflow_id: request.workflow_id.clone(),
            status_code: status.as_u16(),
            response: serde_json::from_str(&text).ok(),
            triggered_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use serde_json::json;

    #[test]
    fn test_trigger_url_strips_trailing_slash() {
        let signer = SignatureVerifier::new("secret", 300, system_clock());
        let notifier = HttpUpstreamNotifier::new(
            "https://agents.example.com/api/",
            None,
            signer,
            system_clock(),
        )
        .unwrap();
        assert_eq!(
            notifier.trigger_url("wf-1"),
            "https://agents.example.com/api/workflows/wf-1/trigger"
        );
    }

    #[test]
    fn test_terminal_statuses() {
        let status = |status| UpstreamError::Status {
            status,
            body: String::new(),
        };
        assert!(status(400).is_terminal());
        assert!(status(404).is_terminal());
        assert!(status(422).is_terminal());
        assert!(!status(408).is_terminal());
        assert!(!status(429).is_terminal());
        assert!(!status(500).is_terminal());
        assert!(!status(503).is_terminal());
        assert!(!UpstreamError::Signing("x".into()).is_terminal());
    }

    #[test]
    fn test_trigger_request_validation() {
        let ok: TriggerRequest = serde_json::from_value(json!({"workflow_id": "wf-1"})).unwrap();
        assert!(ok.validate_request().is_ok());
        assert_eq!(ok.input, json!({}));

        let bad_id: TriggerRequest =
            serde_json::from_value(json!({"workflow_id": "../etc"})).unwrap();
        assert!(bad_id.validate_request().is_err());

        let bad_input: TriggerRequest =
            serde_json::from_value(json!({"workflow_id": "wf-1", "input": 5})).unwrap();
        assert!(bad_input.validate_request().is_err());
    }
}
