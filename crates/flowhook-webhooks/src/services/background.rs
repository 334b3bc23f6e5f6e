//! Periodic maintenance tasks.
//!
//! - Store probe: keeps the store-reachability flag fresh so the health
//!   endpoint never has to touch the Event Store itself.
//! - Alert sweeper: resolves alerts that have gone silent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tokio::task::JoinHandle;

use crate::alerts::AlertAggregator;
use crate::clock::SharedClock;
use crate::error::WebhookError;
use crate::store::{GuardedStore, RangeSummary};

/// Summarize the last 24 hours of stored events through the storage breaker.
pub async fn probe_store_once(
    store: &GuardedStore,
    clock: &SharedClock,
) -> Result<RangeSummary, WebhookError> {
    let now = clock.now();
    let summary = store
        .summarize_range(now - ChronoDuration::hours(24), now)
        .await?;
    tracing::debug!(
        target: "health",
        backend = store.backend(),
        total = summary.total,
        "Store probe succeeded"
    );
    Ok(summary)
}

/// Spawn the periodic store probe.
pub fn spawn_store_probe(
    store: GuardedStore,
    clock: SharedClock,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            target: "health",
            interval_secs = interval.as_secs(),
            "Store probe started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = probe_store_once(&store, &clock).await {
                tracing::warn!(target: "health", error = %e, "Store probe failed");
            }
        }
    })
}

/// Spawn the idle-alert sweeper.
pub fn spawn_alert_sweeper(
    alerts: Arc<AlertAggregator>,
    clock: SharedClock,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            alerts.sweep_idle(clock.now());
        }
    })
}

/// Handles to running background tasks.
#[derive(Debug, Default)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Abort every task.
    pub fn shutdown(self) {
        for handle in &self.handles {
            handle.abort();
        }
        tracing::info!(target: "health", tasks = self.handles.len(), "Background tasks stopped");
    }
}
