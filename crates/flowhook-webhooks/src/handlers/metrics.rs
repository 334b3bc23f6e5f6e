//! HTTP handler for reliability metrics.

use std::collections::BTreeMap;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::alerts::AlertStats;
use crate::circuit_breaker::BreakerSnapshot;
use crate::error::ApiResult;
use crate::fallback_cache::CacheStats;
use crate::metrics::MetricsSnapshot;
use crate::rate_limiter::TriggerUsage;
use crate::router::WebhooksState;

/// Breakers, alerts, cache and counters in one document.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MetricsResponse {
    pub breakers: Vec<BreakerSnapshot>,
    pub alerts: AlertStats,
    pub cache: BTreeMap<String, CacheStats>,
    pub cache_tier: String,
    pub cache_persistent: bool,
    pub counters: MetricsSnapshot,
    pub trigger_usage: Vec<TriggerUsage>,
    pub trigger_daily_limit: u32,
}

/// Current reliability metrics.
#[utoipa::path(
    get,
    path = "/webhooks/metrics",
    tag = "Metrics",
    responses(
        (status = 200, description = "Breaker snapshots, alert stats, cache stats and counters", body = MetricsResponse),
    )
)]
pub async fn metrics_handler(State(state): State<WebhooksState>) -> ApiResult<Json<MetricsResponse>> {
    let reliability = &state.reliability;

    Ok(Json(MetricsResponse {
        breakers: vec![
            reliability.store_breaker.snapshot(),
            reliability.upstream_breaker.snapshot(),
        ],
        alerts: reliability.alerts.get_stats(),
        cache: reliability.cache.all_stats(),
        cache_tier: reliability.cache.tier_name().to_string(),
        cache_persistent: reliability.cache.is_persistent(),
        counters: reliability.metrics.snapshot(),
        trigger_usage: reliability.trigger_limiter.snapshot(),
        trigger_daily_limit: reliability.trigger_limiter.daily_limit(),
    }))
}
