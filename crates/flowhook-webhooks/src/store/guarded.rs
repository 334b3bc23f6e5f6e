//! Event Store access through the storage circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{EventStore, InsertOutcome, RangeSummary, StoreError};
use crate::circuit_breaker::{BreakerError, CircuitBreaker};
use crate::error::WebhookError;
use crate::metrics::WebhookMetrics;
use crate::models::EventRecord;

/// Wraps an [`EventStore`] so that every call runs through the storage
/// breaker with a timeout and updates the store-reachability flag.
#[derive(Clone)]
pub struct GuardedStore {
    store: Arc<dyn EventStore>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<WebhookMetrics>,
    timeout: Duration,
}

impl GuardedStore {
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<WebhookMetrics>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            breaker,
            metrics,
            timeout,
        }
    }

    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.store.is_persistent()
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn observe<T>(&self, result: Result<T, BreakerError<StoreError>>) -> Result<T, WebhookError> {
        match result {
            Ok(value) => {
                self.metrics.record_store_reachability(true, None);
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(
                    target: "webhook_ingest",
                    backend = self.store.backend(),
                    error = %err,
                    "Event store call did not complete"
                );
                self.metrics
                    .record_store_reachability(false, Some(err.to_string()));
                Err(WebhookError::from_store_call(err))
            }
        }
    }

    pub async fn insert(&self, record: &EventRecord) -> Result<InsertOutcome, WebhookError> {
        let store = self.store.clone();
        let result = self
            .breaker
            .execute(self.timeout, || async move { store.insert(record).await })
            .await;
        self.observe(result)
    }

    pub async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<EventRecord>, WebhookError> {
        let store = self.store.clone();
        let result = self
            .breaker
            .execute(self.timeout, || async move {
                store.find_by_fingerprint(fingerprint).await
            })
            .await;
        self.observe(result)
    }

    pub async fn latest_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<EventRecord>, WebhookError> {
        let store = self.store.clone();
        let result = self
            .breaker
            .execute(self.timeout, || async move {
                store.latest_for_workflow(workflow_id).await
            })
            .await;
        self.observe(result)
    }

    pub async fn summarize_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<RangeSummary, WebhookError> {
        let store = self.store.clone();
        let result = self
            .breaker
            .execute(self.timeout, || async move {
                store.summarize_range(from, to).await
            })
            .await;
        self.observe(result)
    }
}

impl std::fmt::Debug for GuardedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedStore")
            .field("backend", &self.store.backend())
            .field("breaker", &self.breaker.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
