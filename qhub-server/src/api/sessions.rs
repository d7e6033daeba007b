//! Editing session endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use qhub::core::Session;

use crate::auth::BearerToken;
use crate::error::ApiError;
use crate::state::AppState;

/// POST /projects/{id}/sessions - Open, or return, the project's session.
pub async fn open_session(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(project_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.hub.open_session(token.as_str(), &project_id).await?))
}

/// GET /projects/{id}/sessions - List sessions.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<Session>>, ApiError> {
    Ok(Json(state.hub.list_sessions(token.as_str(), &project_id).await?))
}

/// GET /projects/{id}/sessions/{session_id} - Get a session.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path((project_id, session_id)): Path<(String, String)>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(
        state
            .hub
            .get_session(token.as_str(), &project_id, &session_id)
            .await?,
    ))
}

/// DELETE /projects/{id}/sessions/{session_id} - Close a session.
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    token: BearerToken,
    Path((project_id, session_id)): Path<(String, String)>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(
        state
            .hub
            .close_session(token.as_str(), &project_id, &session_id)
            .await?,
    ))
}
