//! Pipeline run endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use qhub::core::PipelineRun;

use crate::auth::BearerToken;
use crate::dto::{CancelRunRequest, StartRunRequest};
use crate::error::ApiError;
use crate::state::AppState;

/// POST /projects/{id}/pipeline/runs - Start a run.
///
/// Answers immediately with the pending run; poll the run to follow it.
/// An absent body runs every stage.
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(project_id): Path<String>,
    body: Option<Json<StartRunRequest>>,
) -> Result<(StatusCode, Json<PipelineRun>), ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let run = state
        .hub
        .start_run(token.as_str(), &project_id, req.stages)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

/// GET /projects/{id}/pipeline/runs - List runs.
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<PipelineRun>>, ApiError> {
    Ok(Json(state.hub.list_runs(token.as_str(), &project_id).await?))
}

/// GET /projects/{id}/pipeline/runs/{run_id} - Current run snapshot.
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path((project_id, run_id)): Path<(String, String)>,
) -> Result<Json<PipelineRun>, ApiError> {
    Ok(Json(
        state.hub.get_run(token.as_str(), &project_id, &run_id).await?,
    ))
}

/// POST /projects/{id}/pipeline/runs/{run_id}/cancel - Cancel a run.
///
/// With `?wait=true` the response is the settled run.
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path((project_id, run_id)): Path<(String, String)>,
    Query(params): Query<CancelRunRequest>,
) -> Result<Json<PipelineRun>, ApiError> {
    let run = state
        .hub
        .cancel_run(token.as_str(), &project_id, &run_id)
        .await?;
    if params.wait && !run.status.is_terminal() {
        return Ok(Json(
            state.hub.wait_run(token.as_str(), &project_id, &run_id).await?,
        ));
    }
    Ok(Json(run))
}
