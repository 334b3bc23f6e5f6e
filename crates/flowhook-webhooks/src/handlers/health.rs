//! HTTP handler for the pipeline health snapshot.

use std::time::Duration;

use axum::{extract::State, Json};

use crate::health::HealthSnapshot;
use crate::router::WebhooksState;

/// Upper bound on snapshot computation before the emergency snapshot is served.
const HEALTH_COMPUTE_TIMEOUT: Duration = Duration::from_secs(2);

/// Current health of the pipeline.
///
/// Always answers 200; when the snapshot cannot be computed an emergency
/// snapshot with status `degraded` and `error_details` is returned.
#[utoipa::path(
    get,
    path = "/webhooks/health",
    tag = "Health",
    responses(
        (status = 200, description = "Health snapshot", body = HealthSnapshot),
    )
)]
pub async fn health_handler(State(state): State<WebhooksState>) -> Json<HealthSnapshot> {
    let health = state.reliability.health.clone();
    let clock = state.reliability.clock.clone();

    let computed = tokio::time::timeout(
        HEALTH_COMPUTE_TIMEOUT,
        tokio::task::spawn_blocking(move || health.compute_snapshot()),
    )
    .await;

    let snapshot = match computed {
        Ok(Ok(snapshot)) => snapshot,
        Ok(Err(join_error)) => {
            tracing::error!(target: "health", error = %join_error, "Health computation aborted");
            HealthSnapshot::emergency(format!("health computation aborted: {join_error}"), clock.now())
        }
        Err(_) => {
            tracing::error!(
                target: "health",
                timeout_ms = HEALTH_COMPUTE_TIMEOUT.as_millis() as u64,
                "Health computation timed out"
            );
            HealthSnapshot::emergency("health computation timed out", clock.now())
        }
    };

    Json(snapshot)
}
