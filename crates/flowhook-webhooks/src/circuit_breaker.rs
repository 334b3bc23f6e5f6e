//! Circuit breaker guarding calls to unreliable dependencies.
//!
//! One breaker exists per protected dependency (the Event Store and the
//! upstream agent platform). Calls go through [`CircuitBreaker::execute`],
//! which fails fast while the breaker is open, lets a bounded number of probes
//! through once the cooldown has elapsed, and applies exponential backoff to
//! the cooldown when probes keep failing.
//!
//! Only the state transition is synchronized; the guarded call itself runs
//! without holding any lock.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::clock::SharedClock;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls proceed.
    #[default]
    Closed,
    /// Dependency considered down - calls rejected immediately.
    Open,
    /// Testing recovery - a bounded number of probe calls allowed.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening.
    pub failure_threshold: u32,
    /// Consecutive probe successes in HalfOpen before closing.
    pub success_threshold: u32,
    /// Cooldown after the first trip.
    pub cooldown_secs: u64,
    /// Upper bound for the cooldown after repeated trips.
    pub max_cooldown_secs: u64,
    /// Concurrent probe calls admitted while HalfOpen.
    pub half_open_max_calls: u32,
    /// Number of recent call outcomes used for the uptime percentage.
    pub uptime_window: usize,
    /// Maximum number of recent failures kept for diagnostics.
    pub max_failure_history: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_secs: 30,
            max_cooldown_secs: 300,
            half_open_max_calls: 1,
            uptime_window: 100,
            max_failure_history: 10,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, secs: u64) -> Self {
        self.cooldown_secs = secs;
        self
    }

    #[must_use]
    pub fn with_max_cooldown(mut self, secs: u64) -> Self {
        self.max_cooldown_secs = secs;
        self
    }

    #[must_use]
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls.max(1);
        self
    }

    #[must_use]
    pub fn with_uptime_window(mut self, size: usize) -> Self {
        self.uptime_window = size.max(1);
        self
    }

    /// Cooldown applied after the `trip`-th consecutive trip (1-based).
    ///
    /// Doubles per trip, capped at `max_cooldown_secs`.
    #[must_use]
    pub fn cooldown_for_trip(&self, trip: u32) -> u64 {
        let exponent = trip.saturating_sub(1).min(32);
        let scaled = self.cooldown_secs.saturating_mul(1u64 << exponent);
        scaled.min(self.max_cooldown_secs.max(self.cooldown_secs))
    }
}

/// Record of a single failed call for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// Outcome of a call routed through the breaker that did not succeed.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Short-circuited: the dependency was not called.
    Open {
        breaker: String,
        next_attempt_at: Option<DateTime<Utc>>,
        retry_after_secs: u64,
    },
    /// The caller-supplied timeout elapsed.
    Timeout { breaker: String, timeout_ms: u64 },
    /// The dependency was called and returned an error.
    Failed { breaker: String, error: E },
}

impl<E> BreakerError<E> {
    /// Whether the call was rejected without touching the dependency.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { breaker, .. } => write!(f, "circuit breaker '{breaker}' is open"),
            Self::Timeout {
                breaker,
                timeout_ms,
            } => write!(f, "call through '{breaker}' timed out after {timeout_ms}ms"),
            Self::Failed { breaker, error } => write!(f, "call through '{breaker}' failed: {error}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for BreakerError<E> {}

/// Read-only view of a breaker for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub uptime_percentage: f64,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    /// Consecutive trips since the breaker last closed.
    pub trip_count: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub recent_failures: Vec<FailureRecord>,
}

/// Receives breaker state transitions.
///
/// Invoked after the transition is committed and the breaker lock released.
pub trait BreakerObserver: Send + Sync {
    fn on_transition(&self, from: CircuitState, to: CircuitState, snapshot: &BreakerSnapshot);
}

#[derive(Debug, Default)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    trip_count: u32,
    /// Bumped on every transition; permits from an older generation do not
    /// drive transitions.
    generation: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    recent_outcomes: VecDeque<bool>,
    recent_failures: VecDeque<FailureRecord>,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerInner {
    fn push_outcome(&mut self, success: bool, window: usize) {
        self.recent_outcomes.push_back(success);
        while self.recent_outcomes.len() > window {
            self.recent_outcomes.pop_front();
        }
    }

    fn uptime_percentage(&self) -> f64 {
        if self.recent_outcomes.is_empty() {
            return 100.0;
        }
        let successes = self.recent_outcomes.iter().filter(|ok| **ok).count();
        successes as f64 / self.recent_outcomes.len() as f64 * 100.0
    }

    fn transition(&mut self, to: CircuitState) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        (from, to)
    }
}

/// Permit for a single admitted call.
///
/// A probe permit dropped without being settled (for example when the
/// caller's future is cancelled) gives its HalfOpen slot back.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    generation: u64,
    settled: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut inner = self.breaker.inner.lock();
            if inner.generation == self.generation && inner.state == CircuitState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            }
        }
    }
}

/// Circuit breaker for a single protected dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    observer: Option<Arc<dyn BreakerObserver>>,
}

impl CircuitBreaker {
    /// Create a new breaker in the Closed state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner::default()),
            observer: None,
        }
    }

    /// Attach an observer notified of every state transition.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current committed state.
    ///
    /// An Open breaker whose cooldown has elapsed still reports Open until
    /// the next call is admitted as a probe.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Run `operation` through the breaker with a caller-supplied timeout.
    ///
    /// Rejections while open never count as failures. Timeouts and operation
    /// errors do.
    pub async fn execute<T, E, F, Fut>(
        &self,
        timeout: StdDuration,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut permit = self.try_acquire().map_err(|(next_attempt_at, retry_after_secs)| {
            BreakerError::Open {
                breaker: self.name.clone(),
                next_attempt_at,
                retry_after_secs,
            }
        })?;

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success(&mut permit);
                Ok(value)
            }
            Ok(Err(error)) => {
                self.on_failure(&mut permit, error.to_string());
                Err(BreakerError::Failed {
                    breaker: self.name.clone(),
                    error,
                })
            }
            Err(_) => {
                let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
                self.on_failure(&mut permit, format!("timed out after {timeout_ms}ms"));
                Err(BreakerError::Timeout {
                    breaker: self.name.clone(),
                    timeout_ms,
                })
            }
        }
    }

    /// Admit or reject a call. On rejection returns the next attempt time and
    /// a retry hint in seconds.
    fn try_acquire(&self) -> Result<CallPermit<'_>, (Option<DateTime<Utc>>, u64)> {
        let now = self.clock.now();
        let mut transition = None;

        let result = {
            let mut inner = self.inner.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.total_calls += 1;
                    Ok((false, inner.generation))
                }
                CircuitState::Open => match inner.next_attempt_at {
                    Some(next) if now < next => {
                        inner.rejected_calls += 1;
                        let wait = (next - now).num_milliseconds().max(0);
                        let retry_after = u64::try_from((wait + 999) / 1000).unwrap_or(1).max(1);
                        Err((Some(next), retry_after))
                    }
                    _ => {
                        transition = Some(inner.transition(CircuitState::HalfOpen));
                        inner.success_count = 0;
                        inner.half_open_in_flight = 1;
                        inner.total_calls += 1;
                        Ok((true, inner.generation))
                    }
                },
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max_calls {
                        inner.half_open_in_flight += 1;
                        inner.total_calls += 1;
                        Ok((true, inner.generation))
                    } else {
                        inner.rejected_calls += 1;
                        Err((None, 1))
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            tracing::info!(
                target: "circuit_breaker",
                breaker = %self.name,
                "Circuit breaker transitioning to half-open for probe"
            );
            self.notify(from, to);
        }

        match result {
            Ok((probe, generation)) => Ok(CallPermit {
                breaker: self,
                probe,
                generation,
                settled: false,
            }),
            Err(rejection) => {
                tracing::debug!(
                    target: "circuit_breaker",
                    breaker = %self.name,
                    "Call rejected by open circuit breaker"
                );
                Err(rejection)
            }
        }
    }

    fn on_success(&self, permit: &mut CallPermit<'_>) {
        permit.settled = true;
        let now = self.clock.now();
        let mut transition = None;

        {
            let mut inner = self.inner.lock();
            inner.last_success_at = Some(now);
            inner.push_outcome(true, self.config.uptime_window);

            if inner.generation == permit.generation {
                match inner.state {
                    CircuitState::Closed => {
                        inner.failure_count = 0;
                    }
                    CircuitState::HalfOpen => {
                        inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                        inner.success_count += 1;
                        tracing::debug!(
                            target: "circuit_breaker",
                            breaker = %self.name,
                            success_count = inner.success_count,
                            threshold = self.config.success_threshold,
                            "Probe succeeded"
                        );
                        if inner.success_count >= self.config.success_threshold {
                            transition = Some(inner.transition(CircuitState::Closed));
                            inner.failure_count = 0;
                            inner.success_count = 0;
                            inner.half_open_in_flight = 0;
                            inner.trip_count = 0;
                            inner.opened_at = None;
                            inner.next_attempt_at = None;
                            inner.recent_failures.clear();
                        }
                    }
                    CircuitState::Open => {}
                }
            }
        }

        if let Some((from, to)) = transition {
            tracing::info!(
                target: "circuit_breaker",
                breaker = %self.name,
                "Circuit breaker closed after successful probes"
            );
            self.notify(from, to);
        }
    }

    fn on_failure(&self, permit: &mut CallPermit<'_>, error: String) {
        permit.settled = true;
        let now = self.clock.now();
        let mut transition = None;

        {
            let mut inner = self.inner.lock();
            inner.last_failure_at = Some(now);
            inner.push_outcome(false, self.config.uptime_window);
            inner.recent_failures.push_back(FailureRecord {
                timestamp: now,
                error: error.clone(),
            });
            while inner.recent_failures.len() > self.config.max_failure_history {
                inner.recent_failures.pop_front();
            }

            if inner.generation == permit.generation {
                match inner.state {
                    CircuitState::Closed => {
                        inner.failure_count += 1;
                        tracing::debug!(
                            target: "circuit_breaker",
                            breaker = %self.name,
                            failure_count = inner.failure_count,
                            threshold = self.config.failure_threshold,
                            error = %error,
                            "Failure recorded"
                        );
                        if inner.failure_count >= self.config.failure_threshold {
                            transition = Some(self.trip(&mut inner, now));
                        }
                    }
                    CircuitState::HalfOpen => {
                        transition = Some(self.trip(&mut inner, now));
                    }
                    CircuitState::Open => {}
                }
            }
        }

        if let Some((from, to)) = transition {
            self.notify(from, to);
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: DateTime<Utc>) -> (CircuitState, CircuitState) {
        inner.trip_count += 1;
        let cooldown = self.config.cooldown_for_trip(inner.trip_count);
        let cooldown_secs = i64::try_from(cooldown).unwrap_or(i64::MAX / 1000);
        let reopened = inner.state == CircuitState::HalfOpen;

        let change = inner.transition(CircuitState::Open);
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = Some(now);
        inner.next_attempt_at = Some(now + Duration::seconds(cooldown_secs));

        if reopened {
            tracing::warn!(
                target: "circuit_breaker",
                breaker = %self.name,
                trip_count = inner.trip_count,
                cooldown_secs = cooldown,
                "Circuit breaker reopened after failed probe"
            );
        } else {
            tracing::warn!(
                target: "circuit_breaker",
                breaker = %self.name,
                failure_count = inner.failure_count,
                threshold = self.config.failure_threshold,
                cooldown_secs = cooldown,
                "Circuit breaker opened due to consecutive failures"
            );
        }
        change
    }

    fn notify(&self, from: CircuitState, to: CircuitState) {
        if let Some(observer) = &self.observer {
            let snapshot = self.snapshot();
            observer.on_transition(from, to, &snapshot);
        }
    }

    /// Manually return the breaker to Closed, clearing all counters.
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            let generation = inner.generation + 1;
            *inner = BreakerInner {
                generation,
                ..BreakerInner::default()
            };
            previous
        };
        tracing::info!(
            target: "circuit_breaker",
            breaker = %self.name,
            previous_state = %previous,
            "Circuit breaker manually reset"
        );
        if previous != CircuitState::Closed {
            self.notify(previous, CircuitState::Closed);
        }
    }

    /// Read-only snapshot for health and metrics reporting.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            uptime_percentage: inner.uptime_percentage(),
            next_attempt_time: if inner.state == CircuitState::Open {
                inner.next_attempt_at
            } else {
                None
            },
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
            opened_at: inner.opened_at,
            trip_count: inner.trip_count,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            recent_failures: inner.recent_failures.iter().cloned().collect(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish_non_exhaustive()
    }
}
