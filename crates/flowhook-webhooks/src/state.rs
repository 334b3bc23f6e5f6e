//! Process-wide reliability state.
//!
//! One [`ReliabilityState`] owns every breaker, the fallback cache, the alert
//! collection, the counters and the health snapshot cache. It is created at
//! startup and reset only through the explicit administrative operations.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;

use crate::alerts::{AlertAggregator, AlertingBreakerObserver};
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::{system_clock, SharedClock};
use crate::config::ReliabilityConfig;
use crate::crypto::SignatureVerifier;
use crate::dedup::Deduplicator;
use crate::error::WebhookError;
use crate::fallback_cache::{CacheTier, FallbackCache, MemoryTier};
use crate::health::{HealthAggregator, HealthSources};
use crate::metrics::WebhookMetrics;
use crate::rate_limiter::DailyTriggerLimiter;
use crate::services::{IngestService, TriggerService, WorkflowResultService};
use crate::store::{EventStore, GuardedStore, InMemoryEventStore};
use crate::upstream::{HttpUpstreamNotifier, UpstreamNotifier};

/// Breaker name for the Event Store.
pub const STORE_BREAKER: &str = "event_store";

/// Breaker name for the agent platform.
pub const UPSTREAM_BREAKER: &str = "upstream";

/// Single owner of all shared pipeline state.
pub struct ReliabilityState {
    pub clock: SharedClock,
    pub store: GuardedStore,
    pub store_breaker: Arc<CircuitBreaker>,
    pub upstream_breaker: Arc<CircuitBreaker>,
    pub cache: Arc<FallbackCache>,
    pub alerts: Arc<AlertAggregator>,
    pub metrics: Arc<WebhookMetrics>,
    pub health: Arc<HealthAggregator>,
    pub trigger_limiter: Arc<DailyTriggerLimiter>,
    pub ingest: IngestService,
    pub results: WorkflowResultService,
    pub triggers: TriggerService,
    admin_token: Option<String>,
}

impl ReliabilityState {
    #[must_use]
    pub fn builder(config: ReliabilityConfig) -> ReliabilityStateBuilder {
        ReliabilityStateBuilder::new(config)
    }

    #[must_use]
    pub fn admin_token(&self) -> Option<&str> {
        self.admin_token.as_deref()
    }

    /// Drop the cached health snapshot.
    pub fn reset_health_cache(&self) -> bool {
        self.health.invalidate_cache()
    }

    /// Clear every daily trigger counter.
    pub fn reset_trigger_counters(&self) -> usize {
        let cleared = self.trigger_limiter.reset();
        tracing::info!(target: "upstream", cleared, "Daily trigger counters reset");
        cleared
    }

    /// Return both breakers to Closed.
    pub fn reset_breakers(&self) {
        self.store_breaker.reset();
        self.upstream_breaker.reset();
    }
}

impl std::fmt::Debug for ReliabilityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliabilityState")
            .field("store", &self.store)
            .field("store_breaker", &self.store_breaker)
            .field("upstream_breaker", &self.upstream_breaker)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ReliabilityState`].
///
/// Defaults: system clock, in-memory store, in-memory cache tier, HTTP
/// notifier when an upstream URL and a signing secret are configured.
pub struct ReliabilityStateBuilder {
    config: ReliabilityConfig,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn EventStore>>,
    cache_tier: Option<Arc<dyn CacheTier>>,
    upstream: Option<Arc<dyn UpstreamNotifier>>,
}

impl ReliabilityStateBuilder {
    #[must_use]
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            clock: None,
            store: None,
            cache_tier: None,
            upstream: None,
        }
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn cache_tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.cache_tier = Some(tier);
        self
    }

    #[must_use]
    pub fn upstream(mut self, notifier: Arc<dyn UpstreamNotifier>) -> Self {
        self.upstream = Some(notifier);
        self
    }

    pub fn build(self) -> Result<ReliabilityState, WebhookError> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(system_clock);
        let timeout = config.dependency_timeout();

        let alerts = Arc::new(
            AlertAggregator::new(clock.clone())
                .with_silence_timeout(ChronoDuration::seconds(
                    i64::try_from(config.alert_silence_timeout_secs).unwrap_or(i64::MAX / 1000),
                ))
                .with_max_active(config.alert_max_active),
        );
        let observer = Arc::new(AlertingBreakerObserver::new(alerts.clone()));

        let store_breaker = Arc::new(
            CircuitBreaker::new(STORE_BREAKER, config.breaker_config(), clock.clone())
                .with_observer(observer.clone()),
        );
        let upstream_breaker = Arc::new(
            CircuitBreaker::new(UPSTREAM_BREAKER, config.breaker_config(), clock.clone())
                .with_observer(observer),
        );

        let metrics = Arc::new(WebhookMetrics::new(clock.clone()));
        let backend: Arc<dyn EventStore> = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let store_backend = backend.backend();
        let store = GuardedStore::new(backend, store_breaker.clone(), metrics.clone(), timeout);

        let tier: Arc<dyn CacheTier> = self
            .cache_tier
            .unwrap_or_else(|| Arc::new(MemoryTier::new()));
        let cache = Arc::new(FallbackCache::new(
            tier,
            config.fallback_cache_capacity,
            clock.clone(),
        ));

        let verifier = config.webhook_secret.as_ref().map(|secret| {
            SignatureVerifier::new(secret.clone(), config.signature_tolerance_secs, clock.clone())
        });

        let upstream = match (self.upstream, &config.upstream_base_url, &verifier) {
            (Some(notifier), _, _) => Some(notifier),
            (None, Some(url), Some(signer)) => {
                let notifier =
                    HttpUpstreamNotifier::new(
                        url.clone(),
                        config.upstream_api_key.clone(),
                        signer.clone(),
                        clock.clone(),
                    )
                    .map_err(|e| {
                        WebhookError::Internal(format!("Failed to build upstream client: {e}"))
                    })?;
                Some(Arc::new(notifier) as Arc<dyn UpstreamNotifier>)
            }
            _ => None,
        };

        let health = Arc::new(
            HealthAggregator::new(
                HealthSources {
                    metrics: metrics.clone(),
                    breakers: vec![store_breaker.clone(), upstream_breaker.clone()],
                    alerts: alerts.clone(),
                    cache: cache.clone(),
                    store_backend,
                },
                config.config_checks(),
                clock.clone(),
            )
            .with_cache_ttl(
                ChronoDuration::seconds(
                    i64::try_from(config.health_cache_ttl_secs).unwrap_or(i64::MAX / 1000),
                ),
                ChronoDuration::seconds(
                    i64::try_from(config.health_degraded_cache_ttl_secs)
                        .unwrap_or(i64::MAX / 1000),
                ),
            ),
        );

        let trigger_limiter = Arc::new(DailyTriggerLimiter::new(
            config.trigger_daily_limit,
            clock.clone(),
        ));

        let ingest = IngestService::new(
            verifier,
            Deduplicator::new(store.clone(), config.dedup_fail_open),
            store.clone(),
            cache.clone(),
            alerts.clone(),
            metrics.clone(),
            clock.clone(),
        );
        let results = WorkflowResultService::new(store.clone(), cache.clone(), clock.clone());
        let triggers = TriggerService::new(
            upstream,
            upstream_breaker.clone(),
            trigger_limiter.clone(),
            cache.clone(),
            alerts.clone(),
            metrics.clone(),
            clock.clone(),
            timeout,
        );

        tracing::info!(
            target: "health",
            store_backend,
            cache_tier = cache.tier_name(),
            dedup_fail_open = config.dedup_fail_open,
            "Reliability state initialized"
        );

        Ok(ReliabilityState {
            clock,
            store,
            store_breaker,
            upstream_breaker,
            cache,
            alerts,
            metrics,
            health,
            trigger_limiter,
            ingest,
            results,
            triggers,
            admin_token: config.admin_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::clock::ManualClock;

    fn config() -> ReliabilityConfig {
        ReliabilityConfig {
            webhook_secret: Some("whsec_test".into()),
            upstream_base_url: Some("https://agents.example.com".into()),
            ..ReliabilityConfig::default()
        }
    }

    #[test]
    fn test_build_defaults() {
        let state = ReliabilityState::builder(config()).build().unwrap();
        assert_eq!(state.store.backend(), "memory");
        assert!(!state.cache.is_persistent());
        assert!(state.admin_token().is_none());
        assert!(state.health.config_checks().critical_configured());
    }

    #[tokio::test]
    async fn test_breaker_trip_raises_alert_and_reset_resolves() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = Arc::new(InMemoryEventStore::new());
        let state = ReliabilityState::builder(ReliabilityConfig {
            breaker_failure_threshold: 1,
            ..config()
        })
        .clock(clock)
        .store(store.clone())
        .build()
        .unwrap();

        store.set_available(false);
        assert!(state.store.find_by_fingerprint("x").await.is_err());
        assert_eq!(state.store_breaker.state(), CircuitState::Open);

        let active = state.alerts.get_active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].title, "Circuit breaker event_store is open");

        state.reset_breakers();
        assert_eq!(state.store_breaker.state(), CircuitState::Closed);
        assert!(state.alerts.get_active_alerts().is_empty());
    }
}
