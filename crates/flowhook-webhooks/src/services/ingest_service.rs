//! Signed-event ingestion.
//!
//! Verify signature, parse, fingerprint, dedup, persist through the storage
//! breaker, then update the fallback cache, metrics and alerts.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::alerts::{AlertAggregator, AlertEvent};
use crate::clock::SharedClock;
use crate::crypto::SignatureVerifier;
use crate::dedup::{fingerprint, DedupDecision, Deduplicator};
use crate::error::WebhookError;
use crate::fallback_cache::{workflow_key, AttemptRecord, FallbackCache, LAST_INGEST_KEY};
use crate::metrics::{IngestObservation, WebhookMetrics};
use crate::models::{EventRecord, InboundEvent, IngestOutcome};
use crate::store::{GuardedStore, InsertOutcome};

/// Service for accepting inbound webhook events exactly once.
pub struct IngestService {
    verifier: Option<SignatureVerifier>,
    dedup: Deduplicator,
    store: GuardedStore,
    cache: Arc<FallbackCache>,
    alerts: Arc<AlertAggregator>,
    metrics: Arc<WebhookMetrics>,
    clock: SharedClock,
}

impl IngestService {
    #[must_use]
    pub fn new(
        verifier: Option<SignatureVerifier>,
        dedup: Deduplicator,
        store: GuardedStore,
        cache: Arc<FallbackCache>,
        alerts: Arc<AlertAggregator>,
        metrics: Arc<WebhookMetrics>,
        clock: SharedClock,
    ) -> Self {
        Self {
            verifier,
            dedup,
            store,
            cache,
            alerts,
            metrics,
            clock,
        }
    }

    /// Ingest one raw delivery.
    ///
    /// Duplicates are a successful outcome. Client errors are never fed into
    /// the storage breaker.
    pub async fn ingest(
        &self,
        raw: &[u8],
        signature_header: Option<&str>,
        correlation_id: &str,
    ) -> Result<IngestOutcome, WebhookError> {
        let start = Instant::now();
        let result = self.process(raw, signature_header, correlation_id).await;
        self.metrics.observe_ingest_duration(start.elapsed());
        result
    }

    async fn process(
        &self,
        raw: &[u8],
        signature_header: Option<&str>,
        correlation_id: &str,
    ) -> Result<IngestOutcome, WebhookError> {
        let started_at = self.clock.now();

        let Some(verifier) = &self.verifier else {
            let err = WebhookError::ConfigurationMissing("WEBHOOK_SIGNING_SECRET".to_string());
            self.observe(None, &Err(&err));
            return Err(err);
        };

        if !verifier.verify(raw, signature_header) {
            tracing::warn!(
                target: "webhook_ingest",
                correlation_id,
                header_present = signature_header.is_some(),
                "Rejected webhook with invalid signature"
            );
            let err = WebhookError::InvalidSignature;
            self.observe(Some(false), &Err(&err));
            self.alerts.process_event(
                AlertEvent::new(
                    "signature_invalid",
                    "security",
                    "Inbound webhook failed signature verification",
                )
                .with_correlation_id(correlation_id),
            );
            return Err(err);
        }

        let event = match InboundEvent::from_json(raw) {
            Ok(event) => event,
            Err(err) => {
                tracing::info!(
                    target: "webhook_ingest",
                    correlation_id,
                    error = %err,
                    "Rejected malformed webhook"
                );
                self.observe(Some(true), &Err(&err));
                self.alerts.process_event(
                    AlertEvent::new("schema_invalid", "ingest", err.to_string())
                        .with_correlation_id(correlation_id),
                );
                return Err(err);
            }
        };

        let fp = fingerprint(&event);

        let decision = match self.dedup.check(&fp).await {
            Ok(DedupDecision::Duplicate) => {
                return Ok(self.duplicate(fp, correlation_id));
            }
            Ok(decision) => decision,
            Err(err) => return Err(self.store_failed(err, started_at, correlation_id)),
        };

        let record = EventRecord::accepted(event, fp, correlation_id.to_string(), started_at);

        match self.store.insert(&record).await {
            Ok(InsertOutcome::AlreadyExists) => Ok(self.duplicate(record.fingerprint, correlation_id)),
            Ok(InsertOutcome::Inserted) => Ok(self.accepted(record, true)),
            Err(err) if decision == DedupDecision::AssumedNew => {
                Ok(self.accepted_unpersisted(record, &err))
            }
            Err(err) => Err(self.store_failed(err, started_at, correlation_id)),
        }
    }

    /// Fail-open acceptance: the sender gets a 200 and the event is kept in
    /// the fallback cache.
    fn accepted_unpersisted(&self, record: EventRecord, err: &WebhookError) -> IngestOutcome {
        tracing::error!(
            target: "webhook_ingest",
            correlation_id = %record.correlation_id,
            workflow_id = %record.event.workflow_id,
            fingerprint = %record.fingerprint,
            error = %err,
            "Event store unavailable, event accepted without persistence"
        );
        self.alerts.process_event(
            AlertEvent::new(
                "storage_failure",
                "storage",
                format!("Event accepted without persistence: {err}"),
            )
            .with_details(serde_json::json!({
                "fingerprint": record.fingerprint,
                "workflow_id": record.event.workflow_id,
                "persisted": false,
            }))
            .with_correlation_id(record.correlation_id.clone()),
        );
        self.metrics.record_unpersisted();
        self.accepted(record, false)
    }

    fn accepted(&self, record: EventRecord, persisted: bool) -> IngestOutcome {
        let ended_at = self.clock.now();
        self.observe(Some(true), &Ok(false));

        match serde_json::to_value(&record) {
            Ok(value) => {
                let attempt = AttemptRecord::success(record.received_at, ended_at, value);
                self.cache
                    .record(&workflow_key(&record.event.workflow_id), attempt.clone());
                self.cache.record(LAST_INGEST_KEY, attempt);
            }
            Err(e) => {
                tracing::warn!(
                    target: "fallback_cache",
                    fingerprint = %record.fingerprint,
                    error = %e,
                    "Could not cache accepted event"
                );
            }
        }

        if record.event.execution_status.is_failure() {
            self.alerts.process_event(
                AlertEvent::new(
                    "workflow_failure",
                    "workflow",
                    format!(
                        "Agent {} reported {}",
                        record.event.agent_id, record.event.execution_status
                    ),
                )
                .with_details(serde_json::json!({
                    "workflow_id": record.event.workflow_id,
                    "agent_id": record.event.agent_id,
                    "execution_status": record.event.execution_status,
                }))
                .with_correlation_id(record.correlation_id.clone()),
            );
        }

        tracing::info!(
            target: "webhook_ingest",
            correlation_id = %record.correlation_id,
            workflow_id = %record.event.workflow_id,
            agent_id = %record.event.agent_id,
            fingerprint = %record.fingerprint,
            execution_status = %record.event.execution_status,
            persisted,
            "Webhook event accepted"
        );

        if persisted {
            IngestOutcome::Accepted(record)
        } else {
            IngestOutcome::Unpersisted(record)
        }
    }

    fn duplicate(&self, fingerprint: String, correlation_id: &str) -> IngestOutcome {
        self.observe(Some(true), &Ok(true));
        tracing::info!(
            target: "webhook_ingest",
            correlation_id,
            fingerprint = %fingerprint,
            "Duplicate webhook delivery ignored"
        );
        IngestOutcome::Duplicate { fingerprint }
    }

    fn store_failed(
        &self,
        err: WebhookError,
        started_at: DateTime<Utc>,
        correlation_id: &str,
    ) -> WebhookError {
        self.observe(Some(true), &Err(&err));
        self.cache.record(
            LAST_INGEST_KEY,
            AttemptRecord::failure(started_at, self.clock.now(), err.to_string()),
        );

        // Breaker rejections are covered by the breaker_open alert.
        if err.is_dependency_failure() {
            self.alerts.process_event(
                AlertEvent::new("storage_failure", "storage", err.to_string())
                    .with_correlation_id(correlation_id),
            );
        }

        tracing::error!(
            target: "webhook_ingest",
            correlation_id,
            error = %err,
            retriable = err.is_retriable(),
            "Webhook could not be persisted"
        );
        err
    }

    fn observe(&self, signature_valid: Option<bool>, outcome: &Result<bool, &WebhookError>) {
        let (outcome_code, duplicate) = match outcome {
            Ok(duplicate) => (200, *duplicate),
            Err(err) => (err.status_and_code().0.as_u16(), false),
        };
        self.metrics.record_ingest(IngestObservation {
            signature_valid,
            outcome_code,
            duplicate,
        });
    }
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("signing_configured", &self.verifier.is_some())
            .field("dedup_fail_open", &self.dedup.fail_open())
            .finish_non_exhaustive()
    }
}
