//! `PostgreSQL`-backed Event Store.
//!
//! Records live in `webhook_events` with the fingerprint as primary key, so
//! the database enforces exactly-once storage even when two deliveries of the
//! same event race past the deduplication check.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{EventStore, InsertOutcome, StoreError};
use crate::models::{EventRecord, ExecutionStatus, InboundEvent};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS webhook_events (
        fingerprint      TEXT PRIMARY KEY,
        workflow_id      TEXT NOT NULL,
        agent_id         TEXT NOT NULL,
        event_offset     BIGINT,
        payload          JSONB NOT NULL,
        execution_status TEXT NOT NULL,
        declared_at      TIMESTAMPTZ,
        metadata         JSONB,
        signature_valid  BOOLEAN NOT NULL,
        outcome_code     INTEGER NOT NULL,
        error_text       TEXT,
        correlation_id   TEXT NOT NULL,
        received_at      TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_events_received_at
        ON webhook_events (received_at)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_webhook_events_workflow
        ON webhook_events (workflow_id, received_at DESC)
    ",
];

const COLUMNS: &str = "fingerprint, workflow_id, agent_id, event_offset, payload, \
     execution_status, declared_at, metadata, signature_valid, outcome_code, \
     error_text, correlation_id, received_at";

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    fingerprint: String,
    workflow_id: String,
    agent_id: String,
    event_offset: Option<i64>,
    payload: serde_json::Value,
    execution_status: String,
    declared_at: Option<DateTime<Utc>>,
    metadata: Option<serde_json::Value>,
    signature_valid: bool,
    outcome_code: i32,
    error_text: Option<String>,
    correlation_id: String,
    received_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for EventRecord {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let execution_status = ExecutionStatus::parse(&row.execution_status).ok_or_else(|| {
            StoreError::InvalidRecord(format!(
                "unknown execution status '{}'",
                row.execution_status
            ))
        })?;
        let outcome_code = u16::try_from(row.outcome_code).map_err(|_| {
            StoreError::InvalidRecord(format!("outcome code {} out of range", row.outcome_code))
        })?;

        Ok(Self {
            event: InboundEvent {
                workflow_id: row.workflow_id,
                agent_id: row.agent_id,
                offset: row.event_offset,
                payload: row.payload,
                execution_status,
                timestamp: row.declared_at,
                metadata: row.metadata,
            },
            fingerprint: row.fingerprint,
            signature_valid: row.signature_valid,
            outcome_code,
            error_text: row.error_text,
            correlation_id: row.correlation_id,
            received_at: row.received_at,
        })
    }
}

/// Event Store backed by a `PostgreSQL` pool.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!(target: "webhook_ingest", "Event store schema ready");
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    async fn insert(&self, record: &EventRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO webhook_events (
                fingerprint, workflow_id, agent_id, event_offset, payload,
                execution_status, declared_at, metadata, signature_valid,
                outcome_code, error_text, correlation_id, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (fingerprint) DO NOTHING
            ",
        )
        .bind(&record.fingerprint)
        .bind(&record.event.workflow_id)
        .bind(&record.event.agent_id)
        .bind(record.event.offset)
        .bind(&record.event.payload)
        .bind(record.event.execution_status.as_str())
        .bind(record.event.timestamp)
        .bind(&record.event.metadata)
        .bind(record.signature_valid)
        .bind(i32::from(record.outcome_code))
        .bind(&record.error_text)
        .bind(&record.correlation_id)
        .bind(record.received_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<EventRecord>, StoreError> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM webhook_events WHERE fingerprint = $1"
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EventRecord::try_from).transpose()
    }

    async fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM webhook_events \
             WHERE received_at >= $1 AND received_at < $2 \
             ORDER BY received_at ASC"
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRecord::try_from).collect()
    }

    async fn summarize_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<super::RangeSummary, StoreError> {
        let rows: Vec<(String, i64, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> =
            sqlx::query_as(
                r"
                SELECT execution_status, COUNT(*), MIN(received_at), MAX(received_at)
                FROM webhook_events
                WHERE received_at >= $1 AND received_at < $2
                GROUP BY execution_status
                ",
            )
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?;

        let mut summary = super::RangeSummary::default();
        for (status, count, first, last) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            summary.total += count;
            summary.by_status.insert(status, count);
            summary.first_received_at = match (summary.first_received_at, first) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            summary.last_received_at = match (summary.last_received_at, last) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        Ok(summary)
    }

    async fn latest_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<EventRecord>, StoreError> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM webhook_events \
             WHERE workflow_id = $1 ORDER BY received_at DESC LIMIT 1"
        ))
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EventRecord::try_from).transpose()
    }
}
