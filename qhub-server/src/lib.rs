//! HTTP surface for the qhub orchestrator.
//!
//! Exposes project scaffolding, pipeline runs, editing sessions and artifact
//! listing over a small JSON API. Every route except `/health` expects an
//! `Authorization: Bearer <token>` header; the token is checked by the hub.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use qhub::prelude::*;
//! use qhub_server::{AppState, create_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = HubConfig::new("/srv/projects", IdempotencyKeyMode::Semantic);
//!     let hub = Arc::new(QuantumHub::from_config(config).await?);
//!     let app = create_router(Arc::new(AppState::new(hub)));
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod dto;
pub mod error;
pub mod server;
pub mod state;

pub use auth::BearerToken;
pub use dto::{
    CancelRunRequest, CreateProjectRequest, HealthResponse, ListArtifactsParams, StartRunRequest,
};
pub use error::ApiError;
pub use server::create_router;
pub use state::AppState;
