//! Request and response bodies not covered by the hub's own types.
//!
//! Projects, runs, sessions and artifacts are returned as the hub
//! serializes them.

use qhub::core::{ProjectMetadata, StageName};
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `ok` when the server answers.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Sessions currently open.
    pub open_sessions: usize,
}

/// `POST /projects` body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    /// Project metadata.
    #[serde(flatten)]
    pub metadata: ProjectMetadata,
    /// Template id, e.g. `circuit`.
    pub template: String,
}

/// `POST /projects/{id}/pipeline/runs` body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRunRequest {
    /// Stages to run; empty or absent runs all of them.
    #[serde(default)]
    pub stages: Vec<StageName>,
}

/// `POST /projects/{id}/pipeline/runs/{run_id}/cancel` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRunRequest {
    /// Wait for the run to settle before answering.
    #[serde(default)]
    pub wait: bool,
}

/// `GET /projects/{id}/artifacts` query.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListArtifactsParams {
    /// Restrict to one category, e.g. `ir/base`.
    pub category: Option<String>,
}
