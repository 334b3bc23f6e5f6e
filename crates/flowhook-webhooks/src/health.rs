//! Health aggregation.
//!
//! Rolling counters, configuration checks, breaker state and cache freshness
//! are folded into one [`OverallStatus`] by an ordered decision table. The
//! result is cached briefly, longer while degraded, and computing it never
//! touches the Event Store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::alerts::{AlertAggregator, AlertEvent, AlertStats, ERROR_RATE_TITLE};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::clock::SharedClock;
use crate::fallback_cache::{CacheStats, FallbackCache, FallbackRead, LAST_INGEST_KEY};
use crate::metrics::{StoreReachability, WebhookMetrics, WindowCounts};

/// Default fresh lifetime of a cached snapshot.
pub const DEFAULT_CACHE_TTL_SECS: i64 = 30;

/// Lifetime of a cached snapshot while degraded.
pub const DEFAULT_DEGRADED_CACHE_TTL_SECS: i64 = 300;

/// Overall pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Green,
    Yellow,
    Red,
    /// Primary storage is unavailable; consumers should expect cached data.
    Degraded,
}

impl OverallStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Red => "red",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence of configuration the pipeline depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConfigChecks {
    pub webhook_secret_configured: bool,
    pub upstream_url_configured: bool,
    pub database_configured: bool,
    pub admin_token_configured: bool,
}

impl ConfigChecks {
    /// Signing secret and upstream URL are required; the rest is optional.
    #[must_use]
    pub fn critical_configured(&self) -> bool {
        self.webhook_secret_configured && self.upstream_url_configured
    }
}

/// Thresholds used by the decision table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthThresholds {
    pub green_max_minutes_since_last: i64,
    pub green_min_signature_rate: f64,
    pub green_max_error_rate: f64,
    pub yellow_min_signature_rate: f64,
    pub yellow_max_error_rate: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            green_max_minutes_since_last: 10,
            green_min_signature_rate: 0.98,
            green_max_error_rate: 0.02,
            yellow_min_signature_rate: 0.90,
            yellow_max_error_rate: 0.05,
        }
    }
}

/// Inputs to the decision table.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub store_reachable: bool,
    pub config: ConfigChecks,
    pub has_traffic: bool,
    pub minutes_since_last: Option<i64>,
    pub signature_valid_rate: f64,
    pub error_rate_24h: f64,
}

/// One row of the decision table.
pub struct HealthRule {
    pub name: &'static str,
    pub status: OverallStatus,
    pub reason: &'static str,
    pub predicate: fn(&HealthInputs, &HealthThresholds) -> bool,
}

impl std::fmt::Debug for HealthRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthRule")
            .field("name", &self.name)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Ordered decision table. First match wins; the last row always matches.
pub const HEALTH_RULES: &[HealthRule] = &[
    HealthRule {
        name: "store_unreachable",
        status: OverallStatus::Degraded,
        reason: "storage unavailable, serving cached/file fallback",
        predicate: |i, _| !i.store_reachable,
    },
    HealthRule {
        name: "config_missing",
        status: OverallStatus::Red,
        reason: "critical configuration missing",
        predicate: |i, _| !i.config.critical_configured(),
    },
    HealthRule {
        name: "no_traffic",
        status: OverallStatus::Yellow,
        reason: "configuration valid, no traffic yet",
        predicate: |i, _| !i.has_traffic,
    },
    HealthRule {
        name: "healthy",
        status: OverallStatus::Green,
        reason: "receiving valid events within tolerance",
        predicate: |i, t| {
            i.minutes_since_last
                .is_some_and(|m| m <= t.green_max_minutes_since_last)
                && i.signature_valid_rate >= t.green_min_signature_rate
                && i.error_rate_24h <= t.green_max_error_rate
        },
    },
    HealthRule {
        name: "elevated",
        status: OverallStatus::Yellow,
        reason: "stale traffic or elevated signature/error rates",
        predicate: |i, t| {
            i.signature_valid_rate >= t.yellow_min_signature_rate
                && i.error_rate_24h <= t.yellow_max_error_rate
        },
    },
    HealthRule {
        name: "failing",
        status: OverallStatus::Red,
        reason: "signature or error rate beyond tolerance",
        predicate: |_, _| true,
    },
];

/// Evaluate the decision table.
#[must_use]
pub fn evaluate(inputs: &HealthInputs, thresholds: &HealthThresholds) -> &'static HealthRule {
    HEALTH_RULES
        .iter()
        .find(|rule| (rule.predicate)(inputs, thresholds))
        .unwrap_or(&HEALTH_RULES[HEALTH_RULES.len() - 1])
}

/// Supporting detail attached to a snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct HealthMetrics {
    pub window_24h: WindowCounts,
    pub total_received: u64,
    pub store_backend: String,
    pub store: StoreReachability,
    pub breakers: Vec<BreakerSnapshot>,
    pub alerts: AlertStats,
    pub cache: BTreeMap<String, CacheStats>,
    pub cache_persistent: bool,
}

/// Point-in-time health of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthSnapshot {
    pub overall_status: OverallStatus,
    pub status_reason: String,
    pub last_webhook_minutes_ago: Option<i64>,
    pub signature_valid_rate: f64,
    pub error_rate_24h: f64,
    pub config_checks: ConfigChecks,
    pub metrics: HealthMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_data: Option<FallbackRead>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<String>,
    pub generated_at: DateTime<Utc>,
    /// Whether this response was served from the snapshot cache.
    pub cached: bool,
}

impl HealthSnapshot {
    /// Snapshot returned when health could not be computed at all.
    #[must_use]
    pub fn emergency(error: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            overall_status: OverallStatus::Degraded,
            status_reason: "health computation failed".to_string(),
            last_webhook_minutes_ago: None,
            signature_valid_rate: 0.0,
            error_rate_24h: 0.0,
            config_checks: ConfigChecks::default(),
            metrics: HealthMetrics::default(),
            fallback_data: None,
            error_details: Some(error.into()),
            generated_at: now,
            cached: false,
        }
    }
}

/// Shared state read by the aggregator.
#[derive(Clone)]
pub struct HealthSources {
    pub metrics: Arc<WebhookMetrics>,
    pub breakers: Vec<Arc<CircuitBreaker>>,
    pub alerts: Arc<AlertAggregator>,
    pub cache: Arc<FallbackCache>,
    pub store_backend: &'static str,
}

/// Computes and caches [`HealthSnapshot`]s.
pub struct HealthAggregator {
    sources: HealthSources,
    config_checks: ConfigChecks,
    thresholds: HealthThresholds,
    ttl: Duration,
    degraded_ttl: Duration,
    clock: SharedClock,
    cached: Mutex<Option<HealthSnapshot>>,
}

impl HealthAggregator {
    #[must_use]
    pub fn new(sources: HealthSources, config_checks: ConfigChecks, clock: SharedClock) -> Self {
        Self {
            sources,
            config_checks,
            thresholds: HealthThresholds::default(),
            ttl: Duration::seconds(DEFAULT_CACHE_TTL_SECS),
            degraded_ttl: Duration::seconds(DEFAULT_DEGRADED_CACHE_TTL_SECS),
            clock,
            cached: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    #[must_use]
    pub fn with_cache_ttl(mut self, ttl: Duration, degraded_ttl: Duration) -> Self {
        self.ttl = ttl;
        self.degraded_ttl = degraded_ttl;
        self
    }

    #[must_use]
    pub fn config_checks(&self) -> ConfigChecks {
        self.config_checks
    }

    /// Current snapshot, from cache when still fresh.
    pub fn compute_snapshot(&self) -> HealthSnapshot {
        let now = self.clock.now();
        if let Some(cached) = self.cached.lock().as_ref() {
            let ttl = if cached.overall_status == OverallStatus::Degraded {
                self.degraded_ttl
            } else {
                self.ttl
            };
            if now - cached.generated_at < ttl {
                let mut hit = cached.clone();
                hit.cached = true;
                return hit;
            }
        }

        let snapshot = self.build(now);
        self.feed_error_rate(&snapshot);
        *self.cached.lock() = Some(snapshot.clone());
        snapshot
    }

    /// Drop the cached snapshot. Returns whether one was cached.
    pub fn invalidate_cache(&self) -> bool {
        let cleared = self.cached.lock().take().is_some();
        tracing::info!(target: "health", cleared, "Health snapshot cache reset");
        cleared
    }

    fn build(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let sources = &self.sources;
        let metrics = sources.metrics.snapshot();
        let window = metrics.window_24h;

        let last_webhook_minutes_ago = metrics
            .last_event_at
            .map(|at| (now - at).num_minutes().max(0));

        let inputs = HealthInputs {
            store_reachable: metrics.store.is_reachable(),
            config: self.config_checks,
            has_traffic: metrics.total_received > 0,
            minutes_since_last: last_webhook_minutes_ago,
            signature_valid_rate: window.signature_valid_rate(),
            error_rate_24h: window.error_rate(),
        };
        let rule = evaluate(&inputs, &self.thresholds);

        let fallback_data = if rule.status == OverallStatus::Degraded {
            sources.cache.serve_fallback(LAST_INGEST_KEY)
        } else {
            None
        };

        let error_details = if rule.status == OverallStatus::Degraded {
            metrics.store.last_error.clone()
        } else {
            None
        };

        tracing::debug!(
            target: "health",
            status = %rule.status,
            rule = rule.name,
            signature_valid_rate = inputs.signature_valid_rate,
            error_rate_24h = inputs.error_rate_24h,
            "Health snapshot computed"
        );

        HealthSnapshot {
            overall_status: rule.status,
            status_reason: rule.reason.to_string(),
            last_webhook_minutes_ago,
            signature_valid_rate: inputs.signature_valid_rate,
            error_rate_24h: inputs.error_rate_24h,
            config_checks: self.config_checks,
            metrics: HealthMetrics {
                window_24h: window,
                total_received: metrics.total_received,
                store_backend: sources.store_backend.to_string(),
                store: metrics.store,
                breakers: sources.breakers.iter().map(|b| b.snapshot()).collect(),
                alerts: sources.alerts.get_stats(),
                cache: sources.cache.all_stats(),
                cache_persistent: sources.cache.is_persistent(),
            },
            fallback_data,
            error_details,
            generated_at: now,
            cached: false,
        }
    }

    fn feed_error_rate(&self, snapshot: &HealthSnapshot) {
        let event = AlertEvent::new(
            "error_rate",
            "health",
            format!(
                "24h error rate is {:.1}%",
                snapshot.error_rate_24h * 100.0
            ),
        )
        .with_details(serde_json::json!({
            "value": snapshot.error_rate_24h,
            "received": snapshot.metrics.window_24h.received,
        }));

        if self.sources.alerts.process_event(event).is_none() {
            self.sources
                .alerts
                .resolve_matching("health", ERROR_RATE_TITLE);
        }
    }
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("thresholds", &self.thresholds)
            .field("config_checks", &self.config_checks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::metrics::IngestObservation;

    fn all_config() -> ConfigChecks {
        ConfigChecks {
            webhook_secret_configured: true,
            upstream_url_configured: true,
            database_configured: true,
            admin_token_configured: true,
        }
    }

    fn healthy_inputs() -> HealthInputs {
        HealthInputs {
            store_reachable: true,
            config: all_config(),
            has_traffic: true,
            minutes_since_last: Some(0),
            signature_valid_rate: 1.0,
            error_rate_24h: 0.0,
        }
    }

    fn status(inputs: &HealthInputs) -> OverallStatus {
        evaluate(inputs, &HealthThresholds::default()).status
    }

    #[test]
    fn test_row_store_unreachable_is_degraded() {
        let inputs = HealthInputs {
            store_reachable: false,
            ..healthy_inputs()
        };
        assert_eq!(status(&inputs), OverallStatus::Degraded);
    }

    #[test]
    fn test_row_missing_config_is_red() {
        let mut inputs = healthy_inputs();
        inputs.config.upstream_url_configured = false;
        assert_eq!(status(&inputs), OverallStatus::Red);

        // Optional configuration does not matter.
        let mut inputs = healthy_inputs();
        inputs.config.database_configured = false;
        inputs.config.admin_token_configured = false;
        assert_eq!(status(&inputs), OverallStatus::Green);
    }

    #[test]
    fn test_row_no_traffic_is_yellow() {
        let inputs = HealthInputs {
            has_traffic: false,
            minutes_since_last: None,
            ..healthy_inputs()
        };
        let rule = evaluate(&inputs, &HealthThresholds::default());
        assert_eq!(rule.status, OverallStatus::Yellow);
        assert_eq!(rule.name, "no_traffic");
    }

    #[test]
    fn test_row_green() {
        let inputs = HealthInputs {
            minutes_since_last: Some(10),
            signature_valid_rate: 0.98,
            error_rate_24h: 0.02,
            ..healthy_inputs()
        };
        assert_eq!(status(&inputs), OverallStatus::Green);
    }

    #[test]
    fn test_row_yellow_on_stale_or_elevated() {
        let stale = HealthInputs {
            minutes_since_last: Some(11),
            ..healthy_inputs()
        };
        assert_eq!(status(&stale), OverallStatus::Yellow);

        let elevated = HealthInputs {
            signature_valid_rate: 0.95,
            error_rate_24h: 0.04,
            ..healthy_inputs()
        };
        assert_eq!(status(&elevated), OverallStatus::Yellow);
    }

    #[test]
    fn test_row_red_otherwise() {
        let bad_sigs = HealthInputs {
            signature_valid_rate: 0.5,
            ..healthy_inputs()
        };
        assert_eq!(status(&bad_sigs), OverallStatus::Red);

        let bad_errors = HealthInputs {
            error_rate_24h: 0.2,
            ..healthy_inputs()
        };
        assert_eq!(status(&bad_errors), OverallStatus::Red);
    }

    #[test]
    fn test_store_unreachable_takes_precedence_over_config() {
        let mut inputs = healthy_inputs();
        inputs.store_reachable = false;
        inputs.config = ConfigChecks::default();
        assert_eq!(status(&inputs), OverallStatus::Degraded);
    }

    #[test]
    fn test_overall_status_serialize() {
        assert_eq!(
            serde_json::to_string(&OverallStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&OverallStatus::Green).unwrap(),
            "\"green\""
        );
    }

    #[test]
    fn test_emergency_snapshot() {
        let snapshot = HealthSnapshot::emergency("boom", Utc::now());
        assert_eq!(snapshot.overall_status, OverallStatus::Degraded);
        assert!(!snapshot.config_checks.webhook_secret_configured);
        assert_eq!(snapshot.error_details.as_deref(), Some("boom"));
    }

    fn aggregator() -> (HealthAggregator, Arc<WebhookMetrics>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let metrics = Arc::new(WebhookMetrics::new(clock.clone()));
        let sources = HealthSources {
            metrics: metrics.clone(),
            breakers: vec![Arc::new(CircuitBreaker::new(
                "event_store",
                CircuitBreakerConfig::default(),
                clock.clone(),
            ))],
            alerts: Arc::new(AlertAggregator::new(clock.clone())),
            cache: Arc::new(FallbackCache::in_memory(clock.clone())),
            store_backend: "memory",
        };
        (
            HealthAggregator::new(sources, all_config(), clock.clone()),
            metrics,
            clock,
        )
    }

    #[test]
    fn test_snapshot_is_cached_until_ttl() {
        let (agg, metrics, clock) = aggregator();
        let first = agg.compute_snapshot();
        assert_eq!(first.overall_status, OverallStatus::Yellow);
        assert!(!first.cached);

        metrics.record_ingest(IngestObservation {
            signature_valid: Some(true),
            outcome_code: 200,
            duplicate: false,
        });
        let second = agg.compute_snapshot();
        assert!(second.cached);
        assert_eq!(second.overall_status, OverallStatus::Yellow);

        clock.advance_secs(DEFAULT_CACHE_TTL_SECS);
        let third = agg.compute_snapshot();
        assert!(!third.cached);
        assert_eq!(third.overall_status, OverallStatus::Green);
    }

    #[test]
    fn test_degraded_snapshot_cached_longer() {
        let (agg, metrics, clock) = aggregator();
        metrics.record_store_reachability(false, Some("refused".into()));
        let first = agg.compute_snapshot();
        assert_eq!(first.overall_status, OverallStatus::Degraded);
        assert_eq!(first.error_details.as_deref(), Some("refused"));

        metrics.record_store_reachability(true, None);
        clock.advance_secs(DEFAULT_CACHE_TTL_SECS + 1);
        assert!(agg.compute_snapshot().cached);

        assert!(agg.invalidate_cache());
        assert_eq!(agg.compute_snapshot().overall_status, OverallStatus::Yellow);
    }

    #[test]
    fn test_error_rate_raises_and_clears_alert() {
        let (agg, metrics, clock) = aggregator();
        for code in [200, 500, 500, 200] {
            metrics.record_ingest(IngestObservation {
                signature_valid: Some(true),
                outcome_code: code,
                duplicate: false,
            });
        }
        agg.compute_snapshot();
        let active = agg.sources.alerts.get_active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, ERROR_RATE_TITLE);

        clock.advance_secs(25 * 3600);
        agg.compute_snapshot();
        assert!(agg.sources.alerts.get_active_alerts().is_empty());
    }
}
