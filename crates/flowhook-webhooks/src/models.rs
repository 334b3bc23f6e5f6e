//! Wire and record types for inbound workflow events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::error::WebhookError;
use crate::validation::validate_identifier;

/// Execution status reported by the agent platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
    Pending,
    Timeout,
}

impl ExecutionStatus {
    /// Convert to database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Pending => "pending",
            Self::Timeout => "timeout",
        }
    }

    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "pending" => Some(Self::Pending),
            "timeout" => Some(Self::Timeout),
            _ => None,
        }
    }

    /// Whether the workflow run ended unsuccessfully.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// A result notification delivered by the agent platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, ToSchema)]
pub struct InboundEvent {
    #[validate(length(min = 1, max = 255))]
    pub workflow_id: String,

    /// The agent or tool that produced the event.
    #[validate(length(min = 1, max = 255))]
    pub agent_id: String,

    /// Advisory delivery offset; never used for ordering.
    #[serde(default)]
    #[validate(range(min = 0))]
    pub offset: Option<i64>,

    #[serde(default = "empty_object")]
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,

    pub execution_status: ExecutionStatus,

    /// Timestamp declared by the sender.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<serde_json::Value>,
}

impl InboundEvent {
    /// Parse and validate a raw JSON body.
    pub fn from_json(raw: &[u8]) -> Result<Self, WebhookError> {
        let event: Self = serde_json::from_slice(raw)
            .map_err(|e| WebhookError::SchemaInvalid(format!("Malformed JSON body: {e}")))?;
        event.validate_schema()?;
        Ok(event)
    }

    /// Field-level checks beyond what deserialization enforces.
    pub fn validate_schema(&self) -> Result<(), WebhookError> {
        self.validate()
            .map_err(|e| WebhookError::SchemaInvalid(e.to_string()))?;

        validate_identifier("workflow_id", &self.workflow_id)?;
        validate_identifier("agent_id", &self.agent_id)?;

        if !self.payload.is_object() {
            return Err(WebhookError::SchemaInvalid(
                "payload must be a JSON object".to_string(),
            ));
        }
        if let Some(metadata) = &self.metadata {
            if !metadata.is_object() {
                return Err(WebhookError::SchemaInvalid(
                    "metadata must be a JSON object".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Persisted form of an accepted event. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(flatten)]
    pub event: InboundEvent,
    pub fingerprint: String,
    pub signature_valid: bool,
    pub outcome_code: u16,
    pub error_text: Option<String>,
    pub correlation_id: String,
    pub received_at: DateTime<Utc>,
}

impl EventRecord {
    /// Build the record for a newly accepted event.
    #[must_use]
    pub fn accepted(
        event: InboundEvent,
        fingerprint: String,
        correlation_id: String,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event,
            fingerprint,
            signature_valid: true,
            outcome_code: 200,
            error_text: None,
            correlation_id,
            received_at,
        }
    }
}

/// Result of a successful ingestion.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// First delivery; the record was persisted.
    Accepted(EventRecord),
    /// Accepted under fail-open dedup while the store was unavailable. The
    /// record lives only in the fallback cache.
    Unpersisted(EventRecord),
    /// Re-delivery of an event that is already stored.
    Duplicate { fingerprint: String },
}

impl IngestOutcome {
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    #[must_use]
    pub fn is_persisted(&self) -> bool {
        !matches!(self, Self::Unpersisted(_))
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Accepted(record) | Self::Unpersisted(record) => &record.fingerprint,
            Self::Duplicate { fingerprint } => fingerprint,
        }
    }
}

/// Response body for the ingestion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct IngestResponse {
    pub accepted: bool,
    pub duplicate: bool,
    /// False when the event was accepted without reaching the Event Store.
    pub persisted: bool,
    pub correlation_id: String,
    pub fingerprint: String,
}

impl IngestResponse {
    #[must_use]
    pub fn from_outcome(outcome: &IngestOutcome, correlation_id: String) -> Self {
        Self {
            accepted: true,
            duplicate: outcome.is_duplicate(),
            persisted: outcome.is_persisted(),
            correlation_id,
            fingerprint: outcome.fingerprint().to_string(),
        }
    }
}
