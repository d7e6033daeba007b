//! Artifact listing endpoint.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use qhub::core::Artifact;

use crate::auth::BearerToken;
use crate::dto::ListArtifactsParams;
use crate::error::ApiError;
use crate::state::AppState;

/// GET /projects/{id}/artifacts - List artifact versions, optionally by category.
pub async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(project_id): Path<String>,
    Query(params): Query<ListArtifactsParams>,
) -> Result<Json<Vec<Artifact>>, ApiError> {
    let artifacts = state
        .hub
        .list_artifacts(token.as_str(), &project_id, params.category.as_deref())
        .await?;
    Ok(Json(artifacts))
}
