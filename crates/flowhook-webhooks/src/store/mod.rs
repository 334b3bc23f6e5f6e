//! Event Store interface and implementations.
//!
//! - [`InMemoryEventStore`]: process-local store, also used by tests
//! - [`PgEventStore`]: `PostgreSQL` table keyed by fingerprint
//! - [`GuardedStore`]: any store behind the storage circuit breaker

mod guarded;
mod memory;
mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::EventRecord;

pub use guarded::GuardedStore;
pub use memory::InMemoryEventStore;
pub use postgres::PgEventStore;

/// Errors raised by an Event Store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Event store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored record could not be decoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stored record is invalid: {0}")]
    InvalidRecord(String),
}

/// Result of inserting a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same fingerprint already exists.
    AlreadyExists,
}

/// Aggregate over the records received in a time range.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RangeSummary {
    pub total: u64,
    /// Count per execution status.
    pub by_status: BTreeMap<String, u64>,
    pub first_received_at: Option<DateTime<Utc>>,
    pub last_received_at: Option<DateTime<Utc>>,
}

impl RangeSummary {
    #[must_use]
    pub fn from_records(records: &[EventRecord]) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.total += 1;
            *summary
                .by_status
                .entry(record.event.execution_status.as_str().to_string())
                .or_default() += 1;
            summary.first_received_at = Some(
                summary
                    .first_received_at
                    .map_or(record.received_at, |t| t.min(record.received_at)),
            );
            summary.last_received_at = Some(
                summary
                    .last_received_at
                    .map_or(record.received_at, |t| t.max(record.received_at)),
            );
        }
        summary
    }
}

/// Durable append-only storage for accepted events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Short backend name for logs and health output.
    fn backend(&self) -> &'static str;

    /// Whether records survive a process restart.
    fn is_persistent(&self) -> bool;

    /// Insert a record; a fingerprint conflict is reported, not raised.
    async fn insert(&self, record: &EventRecord) -> Result<InsertOutcome, StoreError>;

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<EventRecord>, StoreError>;

    /// Records with `from <= received_at < to`, oldest first.
    async fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StoreError>;

    async fn summarize_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<RangeSummary, StoreError> {
        let records = self.query_range(from, to).await?;
        Ok(RangeSummary::from_records(&records))
    }

    /// Most recently received record for a workflow.
    async fn latest_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<EventRecord>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, InboundEvent};
    use chrono::Duration;

    fn record(status: ExecutionStatus, at: DateTime<Utc>) -> EventRecord {
        EventRecord::accepted(
            InboundEvent {
                workflow_id: "wf-1".into(),
                agent_id: "a1".into(),
                offset: None,
                payload: serde_json::json!({}),
                execution_status: status,
                timestamp: None,
                metadata: None,
            },
            "f".repeat(64),
            "corr".into(),
            at,
        )
    }

    #[test]
    fn test_range_summary_counts_statuses() {
        let now = Utc::now();
        let earlier = now - Duration::minutes(5);
        let summary = RangeSummary::from_records(&[
            record(ExecutionStatus::Success, now),
            record(ExecutionStatus::Failure, earlier),
            record(ExecutionStatus::Success, earlier),
        ]);

        assert_eq!(summary.total, 3);
        assert_eq!(summary.by_status.get("success"), Some(&2));
        assert_eq!(summary.by_status.get("failure"), Some(&1));
        assert_eq!(summary.first_received_at, Some(earlier));
        assert_eq!(summary.last_received_at, Some(now));
    }

    #[test]
    fn test_empty_summary() {
        let summary = RangeSummary::from_records(&[]);
        assert_eq!(summary.total, 0);
        assert!(summary.last_received_at.is_none());
    }
}
