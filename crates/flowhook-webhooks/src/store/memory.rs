//! In-process Event Store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{EventStore, InsertOutcome, StoreError};
use crate::models::EventRecord;

/// Event Store held in memory.
///
/// Availability can be toggled to simulate an outage; while unavailable every
/// call fails with [`StoreError::Unavailable`].
#[derive(Debug)]
pub struct InMemoryEventStore {
    records: RwLock<HashMap<String, EventRecord>>,
    available: AtomicBool,
    calls: AtomicU64,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            calls: AtomicU64::new(0),
        }
    }
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of calls that reached this store, failed ones included.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    async fn insert(&self, record: &EventRecord) -> Result<InsertOutcome, StoreError> {
        self.enter()?;
        let mut records = self.records.write();
        if records.contains_key(&record.fingerprint) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<EventRecord>, StoreError> {
        self.enter()?;
        Ok(self.records.read().get(fingerprint).cloned())
    }

    async fn query_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.enter()?;
        let mut matched: Vec<EventRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.received_at >= from && r.received_at < to)
            .cloned()
            .collect();
        matched.sort_by_key(|r| r.received_at);
        Ok(matched)
    }

    async fn latest_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Option<EventRecord>, StoreError> {
        self.enter()?;
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.event.workflow_id == workflow_id)
            .max_by_key(|r| r.received_at)
            .cloned())
    }
}
