//! HTTP handler for workflow result reads.

use axum::{
    extract::{Path, State},
    Json,
};

use crate::error::ApiResult;
use crate::router::WebhooksState;
use crate::services::WorkflowResult;

/// Latest result for a workflow.
///
/// Served from the Event Store when reachable, otherwise from the fallback
/// cache with `degraded: true`.
#[utoipa::path(
    get,
    path = "/webhooks/workflows/{workflow_id}/latest",
    tag = "Workflows",
    params(
        ("workflow_id" = String, Path, description = "Workflow identifier")
    ),
    responses(
        (status = 200, description = "Live or degraded result", body = WorkflowResult),
        (status = 400, description = "Invalid workflow id", body = crate::error::ErrorResponse),
        (status = 404, description = "No result recorded", body = crate::error::ErrorResponse),
        (status = 503, description = "Store unavailable and nothing cached", body = crate::error::ErrorResponse),
    )
)]
pub async fn latest_result_handler(
    State(state): State<WebhooksState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowResult>> {
    let result = state.reliability.results.latest(&workflow_id).await?;
    Ok(Json(result))
}
