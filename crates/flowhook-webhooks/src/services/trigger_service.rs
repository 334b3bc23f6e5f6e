//! Upstream workflow triggers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::alerts::{AlertAggregator, AlertEvent};
use crate::circuit_breaker::CircuitBreaker;
use crate::clock::SharedClock;
use crate::error::WebhookError;
use crate::fallback_cache::{trigger_key, AttemptRecord, FallbackCache};
use crate::metrics::WebhookMetrics;
use crate::rate_limiter::{DailyTriggerLimiter, RateLimitResult};
use crate::upstream::{TriggerAck, TriggerRequest, UpstreamError, UpstreamNotifier};

/// Calls the agent platform through the upstream breaker, within a daily
/// per-workflow budget.
pub struct TriggerService {
    notifier: Option<Arc<dyn UpstreamNotifier>>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<DailyTriggerLimiter>,
    cache: Arc<FallbackCache>,
    alerts: Arc<AlertAggregator>,
    metrics: Arc<WebhookMetrics>,
    clock: SharedClock,
    timeout: Duration,
}

impl TriggerService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        notifier: Option<Arc<dyn UpstreamNotifier>>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<DailyTriggerLimiter>,
        cache: Arc<FallbackCache>,
        alerts: Arc<AlertAggregator>,
        metrics: Arc<WebhookMetrics>,
        clock: SharedClock,
        timeout: Duration,
    ) -> Self {
        Self {
            notifier,
            breaker,
            limiter,
            cache,
            alerts,
            metrics,
            clock,
            timeout,
        }
    }

    pub async fn trigger(
        &self,
        request: TriggerRequest,
        correlation_id: &str,
    ) -> Result<TriggerAck, WebhookError> {
        request.validate_request()?;

        let Some(notifier) = self.notifier.clone() else {
            return Err(WebhookError::ConfigurationMissing(
                "UPSTREAM_BASE_URL".to_string(),
            ));
        };

        if let RateLimitResult::Limited { limit } = self.limiter.try_acquire(&request.workflow_id) {
            self.alerts.process_event(
                AlertEvent::new(
                    "trigger_limit",
                    "upstream",
                    format!("Daily trigger limit of {limit} reached"),
                )
                .with_details(serde_json::json!({ "workflow_id": request.workflow_id }))
                .with_correlation_id(correlation_id),
            );
            return Err(WebhookError::RateLimited {
                workflow_id: request.workflow_id,
                limit,
            });
        }

        let key = trigger_key(&request.workflow_id);
        let started_at = self.clock.now();
        // Terminal rejections complete the breaker call successfully so a bad
        // workflow id cannot open the breaker for every workflow.
        let result = self
            .breaker
            .execute(self.timeout, || {
                let request = &request;
                async move {
                    match notifier.trigger(request).await {
                        Err(err) if err.is_terminal() => Ok(Err(err)),
                        other => other.map(Ok),
                    }
                }
            })
            .await;

        match result {
            Ok(Ok(ack)) => {
                self.metrics.record_trigger(true);
                if let Ok(value) = serde_json::to_value(&ack) {
                    self.cache
                        .record(&key, AttemptRecord::success(started_at, self.clock.now(), value));
                }
                Ok(ack)
            }
            Ok(Err(rejection)) => {
                self.record_failure(&key, started_at, &rejection.to_string(), &request, correlation_id);
                let (status, reason) = match rejection {
                    UpstreamError::Status { status, body } => (status, body),
                    other => (0, other.to_string()),
                };
                Err(WebhookError::UpstreamRejected { status, reason })
            }
            Err(err) if err.is_open() => {
                // Nothing was sent, so the call does not consume budget.
                self.limiter.release(&request.workflow_id);
                Err(WebhookError::from_upstream_call(err))
            }
            Err(err) => {
                self.record_failure(&key, started_at, &err.to_string(), &request, correlation_id);
                Err(WebhookError::from_upstream_call(err))
            }
        }
    }

    fn record_failure(
        &self,
        key: &str,
        started_at: DateTime<Utc>,
        error: &str,
        request: &TriggerRequest,
        correlation_id: &str,
    ) {
        self.metrics.record_trigger(false);
        self.cache.record(
            key,
            AttemptRecord::failure(started_at, self.clock.now(), error),
        );
        self.alerts.process_event(
            AlertEvent::new("upstream_failure", "upstream", error)
                .with_details(serde_json::json!({ "workflow_id": request.workflow_id }))
                .with_correlation_id(correlation_id),
        );
        tracing::warn!(
            target: "upstream",
            correlation_id,
            workflow_id = %request.workflow_id,
            error,
            "Upstream trigger failed"
        );
    }
}

impl std::fmt::Debug for TriggerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerService")
            .field("configured", &self.notifier.is_some())
            .field("breaker", &self.breaker.name())
            .field("daily_limit", &self.limiter.daily_limit())
            .finish_non_exhaustive()
    }
}
