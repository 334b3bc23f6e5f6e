//! Per-workflow daily limit on upstream trigger calls.
//!
//! Counters are keyed by (UTC date, workflow id); a new UTC day starts from
//! zero. Counters for past days are dropped lazily on the next acquire.

use std::collections::HashMap;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::clock::SharedClock;

/// Default daily trigger budget per workflow.
pub const DEFAULT_DAILY_LIMIT: u32 = 100;

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request allowed; `remaining` calls are left today.
    Allowed { remaining: u32 },
    /// Daily budget exhausted.
    Limited { limit: u32 },
}

impl RateLimitResult {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

/// Today's usage for one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TriggerUsage {
    pub workflow_id: String,
    pub date: NaiveDate,
    pub used: u32,
    pub limit: u32,
}

/// Daily trigger counters.
pub struct DailyTriggerLimiter {
    daily_limit: u32,
    clock: SharedClock,
    counters: Mutex<HashMap<(NaiveDate, String), u32>>,
}

impl DailyTriggerLimiter {
    #[must_use]
    pub fn new(daily_limit: u32, clock: SharedClock) -> Self {
        Self {
            daily_limit,
            clock,
            counters: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Consume one call from today's budget for `workflow_id`.
    pub fn try_acquire(&self, workflow_id: &str) -> RateLimitResult {
        let today = self.clock.now().date_naive();
        let mut counters = self.counters.lock();
        counters.retain(|(date, _), _| *date >= today);

        let used = counters.entry((today, workflow_id.to_string())).or_insert(0);
        if *used >= self.daily_limit {
            tracing::debug!(
                target: "upstream",
                workflow_id,
                limit = self.daily_limit,
                "Daily trigger limit reached"
            );
            return RateLimitResult::Limited {
                limit: self.daily_limit,
            };
        }
        *used += 1;
        RateLimitResult::Allowed {
            remaining: self.daily_limit - *used,
        }
    }

    /// Give back one call, used when the upstream call was never attempted.
    pub fn release(&self, workflow_id: &str) {
        let today = self.clock.now().date_naive();
        let mut counters = self.counters.lock();
        if let Some(used) = counters.get_mut(&(today, workflow_id.to_string())) {
            *used = used.saturating_sub(1);
        }
    }

    /// Clear every counter. Returns the number of workflows cleared.
    pub fn reset(&self) -> usize {
        let mut counters = self.counters.lock();
        let cleared = counters.len();
        counters.clear();
        cleared
    }

    /// Today's usage, sorted by workflow id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TriggerUsage> {
        let today = self.clock.now().date_naive();
        let counters = self.counters.lock();
        let mut usage: Vec<TriggerUsage> = counters
            .iter()
            .filter(|((date, _), _)| *date == today)
            .map(|((date, workflow_id), used)| TriggerUsage {
                workflow_id: workflow_id.clone(),
                date: *date,
                used: *used,
                limit: self.daily_limit,
            })
            .collect();
        usage.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        usage
    }
}

impl std::fmt::Debug for DailyTriggerLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DailyTriggerLimiter")
            .field("daily_limit", &self.daily_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn limiter(limit: u32) -> (DailyTriggerLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (DailyTriggerLimiter::new(limit, clock.clone()), clock)
    }

    #[test]
    fn test_limit_enforced_per_workflow() {
        let (limiter, _) = limiter(2);
        assert_eq!(
            limiter.try_acquire("wf-1"),
            RateLimitResult::Allowed { remaining: 1 }
        );
        assert_eq!(
            limiter.try_acquire("wf-1"),
            RateLimitResult::Allowed { remaining: 0 }
        );
        assert_eq!(
            limiter.try_acquire("wf-1"),
            RateLimitResult::Limited { limit: 2 }
        );
        assert!(limiter.try_acquire("wf-2").is_allowed());
    }

    #[test]
    fn test_new_day_resets_budget() {
        let (limiter, clock) = limiter(1);
        assert!(limiter.try_acquire("wf-1").is_allowed());
        assert!(!limiter.try_acquire("wf-1").is_allowed());

        clock.advance_secs(24 * 3600);
        assert!(limiter.try_acquire("wf-1").is_allowed());
        assert_eq!(limiter.snapshot().len(), 1);
    }

    #[test]
    fn test_release_returns_budget() {
        let (limiter, _) = limiter(1);
        assert!(limiter.try_acquire("wf-1").is_allowed());
        limiter.release("wf-1");
        assert!(limiter.try_acquire("wf-1").is_allowed());
    }

    #[test]
    fn test_reset_clears_counters() {
        let (limiter, _) = limiter(1);
        limiter.try_acquire("wf-1");
        limiter.try_acquire("wf-2");
        assert_eq!(limiter.reset(), 2);
        assert!(limiter.snapshot().is_empty());
        assert!(limiter.try_acquire("wf-1").is_allowed());
    }
}
