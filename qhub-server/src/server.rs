//! Axum server setup and routing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::api;
use crate::state::AppState;

/// Create the Axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health::health))
        .route(
            "/projects",
            get(api::projects::list_projects).post(api::projects::create_project),
        )
        .route("/projects/{id}", get(api::projects::get_project))
        // Pipeline runs
        .route(
            "/projects/{id}/pipeline/runs",
            get(api::runs::list_runs).post(api::runs::start_run),
        )
        .route("/projects/{id}/pipeline/runs/{run_id}", get(api::runs::get_run))
        .route(
            "/projects/{id}/pipeline/runs/{run_id}/cancel",
            post(api::runs::cancel_run),
        )
        // Editing sessions
        .route(
            "/projects/{id}/sessions",
            get(api::sessions::list_sessions).post(api::sessions::open_session),
        )
        .route(
            "/projects/{id}/sessions/{session_id}",
            get(api::sessions::get_session).delete(api::sessions::close_session),
        )
        .route("/projects/{id}/artifacts", get(api::artifacts::list_artifacts))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
