//! Project endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use qhub::core::Project;

use crate::auth::BearerToken;
use crate::dto::CreateProjectRequest;
use crate::error::ApiError;
use crate::state::AppState;

/// POST /projects - Scaffold a new project from a template.
pub async fn create_project(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Json(req): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let project = state
        .hub
        .scaffold_project(token.as_str(), req.metadata, &req.template)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /projects - List projects.
pub async fn list_projects(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
) -> Result<Json<Vec<Project>>, ApiError> {
    Ok(Json(state.hub.list_projects(token.as_str()).await?))
}

/// GET /projects/{id} - Get a project.
pub async fn get_project(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    Ok(Json(state.hub.get_project(token.as_str(), &project_id).await?))
}
