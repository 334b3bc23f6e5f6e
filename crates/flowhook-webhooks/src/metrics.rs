//! Ingestion and trigger counters.
//!
//! Lifetime counters and the ingest latency histogram live in a
//! `prometheus_client` registry and are exposed in text form. Observations
//! are also bucketed per minute over the last 24 hours, which is what the
//! health aggregator's rates are computed over.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, histogram::Histogram},
    registry::Registry,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::clock::SharedClock;

/// Width of the rolling window, in minutes.
pub const WINDOW_MINUTES: i64 = 24 * 60;

/// One ingestion request as seen by the metrics layer.
#[derive(Debug, Clone, Copy)]
pub struct IngestObservation {
    /// `None` when the request never reached signature verification.
    pub signature_valid: Option<bool>,
    /// HTTP-equivalent outcome code returned to the sender.
    pub outcome_code: u16,
    pub duplicate: bool,
}

impl IngestObservation {
    /// Outcomes below 400 are successful; duplicates included.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome_code < 400
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct MinuteBucket {
    minute: i64,
    received: u64,
    successful: u64,
    failed: u64,
    duplicates: u64,
    signature_checks: u64,
    signature_valid: u64,
}

/// Counts over the rolling window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct WindowCounts {
    pub received: u64,
    pub successful: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub signature_checks: u64,
    pub signature_valid: u64,
}

impl WindowCounts {
    /// Valid signatures over checked signatures; 1.0 when nothing was checked.
    #[must_use]
    pub fn signature_valid_rate(&self) -> f64 {
        if self.signature_checks == 0 {
            1.0
        } else {
            self.signature_valid as f64 / self.signature_checks as f64
        }
    }

    /// Failed requests over received requests; 0.0 when idle.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.received == 0 {
            0.0
        } else {
            self.failed as f64 / self.received as f64
        }
    }
}

/// Last known reachability of the Event Store.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct StoreReachability {
    /// `None` until the first call or probe completes.
    pub reachable: Option<bool>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl StoreReachability {
    /// Unknown reachability is treated as reachable.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.reachable.unwrap_or(true)
    }
}

/// Serializable view of all counters.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MetricsSnapshot {
    pub window_24h: WindowCounts,
    pub total_received: u64,
    /// Successful requests, duplicates included.
    pub total_accepted: u64,
    pub total_duplicates: u64,
    pub total_failed: u64,
    /// Accepted under fail-open dedup without reaching the Event Store.
    pub total_unpersisted: u64,
    pub triggers_sent: u64,
    pub triggers_failed: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub store: StoreReachability,
}

/// Outcome label for ingestion requests.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum IngestResult {
    Accepted,
    Duplicate,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IngestLabels {
    pub result: IngestResult,
}

/// Outcome label for upstream trigger calls.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TriggerResult {
    Sent,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TriggerLabels {
    pub result: TriggerResult,
}

/// Prometheus metric families for the pipeline.
pub struct PipelineCounters {
    /// Ingestion requests, labeled by result.
    pub ingest_requests_total: Family<IngestLabels, Counter>,
    pub ingest_unpersisted_total: Counter,
    /// Wall-clock time spent handling one ingestion request.
    pub ingest_duration_seconds: Histogram,
    /// Upstream trigger calls, labeled by result.
    pub upstream_triggers_total: Family<TriggerLabels, Counter>,
}

impl PipelineCounters {
    fn new() -> Self {
        Self {
            ingest_requests_total: Family::default(),
            ingest_unpersisted_total: Counter::default(),
            ingest_duration_seconds: Histogram::new(
                [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0].into_iter(),
            ),
            upstream_triggers_total: Family::default(),
        }
    }

    fn register(&self, registry: &mut Registry) {
        registry.register(
            "webhook_ingest_requests",
            "Total number of webhook ingestion requests",
            self.ingest_requests_total.clone(),
        );
        registry.register(
            "webhook_ingest_unpersisted",
            "Events accepted without reaching the event store",
            self.ingest_unpersisted_total.clone(),
        );
        registry.register(
            "webhook_ingest_duration_seconds",
            "Webhook ingestion duration in seconds",
            self.ingest_duration_seconds.clone(),
        );
        registry.register(
            "upstream_triggers",
            "Total number of upstream workflow trigger calls",
            self.upstream_triggers_total.clone(),
        );
    }

    fn ingest_count(&self, result: IngestResult) -> u64 {
        self.ingest_requests_total
            .get_or_create(&IngestLabels { result })
            .get()
    }

    fn trigger_count(&self, result: TriggerResult) -> u64 {
        self.upstream_triggers_total
            .get_or_create(&TriggerLabels { result })
            .get()
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    buckets: VecDeque<MinuteBucket>,
    last_event_at: Option<DateTime<Utc>>,
    store: StoreReachability,
}

impl MetricsInner {
    fn prune(&mut self, current_minute: i64) {
        while self
            .buckets
            .front()
            .is_some_and(|b| b.minute <= current_minute - WINDOW_MINUTES)
        {
            self.buckets.pop_front();
        }
    }

    fn bucket_mut(&mut self, minute: i64) -> &mut MinuteBucket {
        let needs_new = self.buckets.back().map_or(true, |b| b.minute < minute);
        if needs_new {
            self.buckets.push_back(MinuteBucket {
                minute,
                ..MinuteBucket::default()
            });
        }
        // Observations stamped in an earlier minute than the newest bucket
        // land in the newest bucket; the clock is monotonic in practice.
        let last = self.buckets.len() - 1;
        &mut self.buckets[last]
    }
}

fn minute_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}

/// Process-wide ingestion counters.
pub struct WebhookMetrics {
    clock: SharedClock,
    counters: PipelineCounters,
    registry: Registry,
    inner: Mutex<MetricsInner>,
}

impl WebhookMetrics {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        let counters = PipelineCounters::new();
        let mut registry = Registry::default();
        counters.register(&mut registry);
        Self {
            clock,
            counters,
            registry,
            inner: Mutex::new(MetricsInner::default()),
        }
    }

    /// Record one ingestion request.
    pub fn record_ingest(&self, observation: IngestObservation) {
        let now = self.clock.now();
        let minute = minute_of(now);
        let success = observation.is_success();

        let result = match (success, observation.duplicate) {
            (false, _) => IngestResult::Failed,
            (true, true) => IngestResult::Duplicate,
            (true, false) => IngestResult::Accepted,
        };
        self.counters
            .ingest_requests_total
            .get_or_create(&IngestLabels { result })
            .inc();

        let mut inner = self.inner.lock();
        inner.prune(minute);
        if success {
            inner.last_event_at = Some(now);
        }

        let bucket = inner.bucket_mut(minute);
        bucket.received += 1;
        if success {
            bucket.successful += 1;
        } else {
            bucket.failed += 1;
        }
        if observation.duplicate {
            bucket.duplicates += 1;
        }
        if let Some(valid) = observation.signature_valid {
            bucket.signature_checks += 1;
            if valid {
                bucket.signature_valid += 1;
            }
        }
    }

    /// Record how long one ingestion request took.
    pub fn observe_ingest_duration(&self, elapsed: Duration) {
        self.counters
            .ingest_duration_seconds
            .observe(elapsed.as_secs_f64());
    }

    /// Record an event accepted without persistence.
    pub fn record_unpersisted(&self) {
        self.counters.ingest_unpersisted_total.inc();
    }

    /// Record the outcome of an upstream trigger call.
    pub fn record_trigger(&self, success: bool) {
        let result = if success {
            TriggerResult::Sent
        } else {
            TriggerResult::Failed
        };
        self.counters
            .upstream_triggers_total
            .get_or_create(&TriggerLabels { result })
            .inc();
    }

    /// Encode the registry in the Prometheus text exposition format.
    pub fn encode_prometheus(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }

    /// Record the outcome of an Event Store call or probe.
    pub fn record_store_reachability(&self, reachable: bool, error: Option<String>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let changed = inner.store.reachable != Some(reachable);
        inner.store = StoreReachability {
            reachable: Some(reachable),
            last_checked_at: Some(now),
            last_error: error,
        };
        drop(inner);

        if changed {
            if reachable {
                tracing::info!(target: "health", "Event store reachable");
            } else {
                tracing::warn!(target: "health", "Event store marked unreachable");
            }
        }
    }

    #[must_use]
    pub fn store_reachability(&self) -> StoreReachability {
        self.inner.lock().store.clone()
    }

    /// Counts over the last 24 hours.
    #[must_use]
    pub fn window_counts(&self) -> WindowCounts {
        let minute = minute_of(self.clock.now());
        let mut inner = self.inner.lock();
        inner.prune(minute);
        inner
            .buckets
            .iter()
            .fold(WindowCounts::default(), |mut acc, b| {
                acc.received += b.received;
                acc.successful += b.successful;
                acc.failed += b.failed;
                acc.duplicates += b.duplicates;
                acc.signature_checks += b.signature_checks;
                acc.signature_valid += b.signature_valid;
                acc
            })
    }

    /// Time of the most recent successfully handled event.
    #[must_use]
    pub fn last_event_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_event_at
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let window_24h = self.window_counts();
        let c = &self.counters;
        let accepted = c.ingest_count(IngestResult::Accepted);
        let duplicates = c.ingest_count(IngestResult::Duplicate);
        let failed = c.ingest_count(IngestResult::Failed);
        let inner = self.inner.lock();
        MetricsSnapshot {
            window_24h,
            total_received: accepted + duplicates + failed,
            total_accepted: accepted + duplicates,
            total_duplicates: duplicates,
            total_failed: failed,
            total_unpersisted: c.ingest_unpersisted_total.get(),
            triggers_sent: c.trigger_count(TriggerResult::Sent),
            triggers_failed: c.trigger_count(TriggerResult::Failed),
            last_event_at: inner.last_event_at,
            store: inner.store.clone(),
        }
    }
}

impl std::fmt::Debug for WebhookMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn metrics() -> (WebhookMetrics, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (WebhookMetrics::new(clock.clone()), clock)
    }

    fn ok() -> IngestObservation {
        IngestObservation {
            signature_valid: Some(true),
            outcome_code: 200,
            duplicate: false,
        }
    }

    #[test]
    fn test_empty_rates() {
        let (m, _) = metrics();
        let counts = m.window_counts();
        assert!((counts.signature_valid_rate() - 1.0).abs() < f64::EPSILON);
        assert!(counts.error_rate().abs() < f64::EPSILON);
        assert!(m.last_event_at().is_none());
    }

    #[test]
    fn test_rates_over_window() {
        let (m, clock) = metrics();
        for _ in 0..8 {
            m.record_ingest(ok());
        }
        m.record_ingest(IngestObservation {
            signature_valid: Some(false),
            outcome_code: 401,
            duplicate: false,
        });
        m.record_ingest(IngestObservation {
            signature_valid: None,
            outcome_code: 500,
            duplicate: false,
        });

        let counts = m.window_counts();
        assert_eq!(counts.received, 10);
        assert_eq!(counts.failed, 2);
        assert!((counts.error_rate() - 0.2).abs() < 1e-9);
        assert!((counts.signature_valid_rate() - 8.0 / 9.0).abs() < 1e-9);
        assert_eq!(m.last_event_at(), Some(clock.now()));
    }

    #[test]
    fn test_duplicates_count_as_success() {
        let (m, _) = metrics();
        m.record_ingest(IngestObservation {
            duplicate: true,
            ..ok()
        });
        let snapshot = m.snapshot();
        assert_eq!(snapshot.total_duplicates, 1);
        assert_eq!(snapshot.total_accepted, 1);
        assert!(snapshot.last_event_at.is_some());
    }

    #[test]
    fn test_old_buckets_expire() {
        let (m, clock) = metrics();
        m.record_ingest(IngestObservation {
            outcome_code: 500,
            ..ok()
        });
        clock.advance_secs(WINDOW_MINUTES * 60 + 60);
        m.record_ingest(ok());

        let counts = m.window_counts();
        assert_eq!(counts.received, 1);
        assert_eq!(counts.failed, 0);
        assert_eq!(m.snapshot().total_failed, 1);
    }

    #[test]
    fn test_trigger_and_unpersisted_counters() {
        let (m, _) = metrics();
        m.record_trigger(true);
        m.record_trigger(true);
        m.record_trigger(false);
        m.record_unpersisted();

        let snapshot = m.snapshot();
        assert_eq!(snapshot.triggers_sent, 2);
        assert_eq!(snapshot.triggers_failed, 1);
        assert_eq!(snapshot.total_unpersisted, 1);
    }

    #[test]
    fn test_prometheus_text_exposition() {
        let (m, _) = metrics();
        m.record_ingest(ok());
        m.record_ingest(IngestObservation {
            duplicate: true,
            ..ok()
        });
        m.observe_ingest_duration(Duration::from_millis(3));
        m.record_trigger(false);

        let text = m.encode_prometheus().unwrap();
        assert!(text.contains("webhook_ingest_requests_total{result=\"Accepted\"} 1"));
        assert!(text.contains("webhook_ingest_requests_total{result=\"Duplicate\"} 1"));
        assert!(text.contains("webhook_ingest_duration_seconds_count 1"));
        assert!(text.contains("upstream_triggers_total{result=\"Failed\"} 1"));
        assert!(text.ends_with("# EOF\n"));
    }

    #[test]
    fn test_store_reachability() {
        let (m, clock) = metrics();
        assert!(m.store_reachability().is_reachable());

        m.record_store_reachability(false, Some("connection refused".into()));
        let status = m.store_reachability();
        assert_eq!(status.reachable, Some(false));
        assert_eq!(status.last_checked_at, Some(clock.now()));
        assert!(!status.is_reachable());
    }
}
