//! Latest-result reads with degraded fallback.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::clock::SharedClock;
use crate::error::WebhookError;
use crate::fallback_cache::{workflow_key, AttemptRecord, FallbackCache};
use crate::store::GuardedStore;
use crate::validation::validate_identifier;

/// Where a result was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Live,
    Cache,
}

/// Latest known result for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub source: ResultSource,
    /// True when served from the fallback cache.
    pub degraded: bool,
    /// Whether the source survives a restart.
    pub persistent: bool,
    pub recorded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_secs: Option<i64>,
    /// The stored event record.
    #[schema(value_type = Object)]
    pub result: serde_json::Value,
}

/// Reads the latest result for a workflow, preferring the Event Store.
pub struct WorkflowResultService {
    store: GuardedStore,
    cache: Arc<FallbackCache>,
    clock: SharedClock,
}

impl WorkflowResultService {
    #[must_use]
    pub fn new(store: GuardedStore, cache: Arc<FallbackCache>, clock: SharedClock) -> Self {
        Self {
            store,
            cache,
            clock,
        }
    }

    /// Live result when the store answers, cached result labelled degraded
    /// when it does not. Errors only when neither is available.
    pub async fn latest(&self, workflow_id: &str) -> Result<WorkflowResult, WebhookError> {
        validate_identifier("workflow_id", workflow_id)?;
        let key = workflow_key(workflow_id);
        let started_at = self.clock.now();

        match self.store.latest_for_workflow(workflow_id).await {
            Ok(Some(record)) => {
                let result = serde_json::to_value(&record)
                    .map_err(|e| WebhookError::Internal(e.to_string()))?;
                self.cache.record(
                    &key,
                    AttemptRecord::success(started_at, self.clock.now(), result.clone()),
                );
                Ok(WorkflowResult {
                    workflow_id: workflow_id.to_string(),
                    source: ResultSource::Live,
                    degraded: false,
                    persistent: self.store.is_persistent(),
                    recorded_at: record.received_at,
                    age_secs: None,
                    result,
                })
            }
            Ok(None) => Err(WebhookError::ResultNotFound(workflow_id.to_string())),
            Err(err) => {
                self.cache.record(
                    &key,
                    AttemptRecord::failure(started_at, self.clock.now(), err.to_string()),
                );
                match self.cache.serve_fallback(&key) {
                    Some(read) => Ok(WorkflowResult {
                        workflow_id: workflow_id.to_string(),
                        source: ResultSource::Cache,
                        degraded: read.degraded,
                        persistent: read.persistent,
                        recorded_at: read.entry.recorded_at,
                        age_secs: Some(read.age_secs),
                        result: read.entry.result,
                    }),
                    None => {
                        tracing::warn!(
                            target: "fallback_cache",
                            workflow_id,
                            error = %err,
                            "Store unavailable and no cached result"
                        );
                        Err(err)
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkflowResultService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowResultService")
            .field("store", &self.store.backend())
            .field("cache_tier", &self.cache.tier_name())
            .finish()
    }
}
