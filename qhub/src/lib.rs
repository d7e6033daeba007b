//! # qhub
//!
//! Orchestration core for a quantum software development platform.
//!
//! qhub takes a quantum project through a fixed pipeline of stages
//! (generate, optimize, mitigate, validate, simulate, analyze, test), keeps
//! every stage output as a versioned artifact, and hands out remote editing
//! sessions for project workspaces. It provides:
//!
//! - **Project scaffolding**: workspaces created once from bundled templates
//! - **Dependency-driven runs**: stages scheduled from their declared artifact
//!   categories, with bounded concurrency, retries and cancellation
//! - **Idempotent re-runs**: a stage whose inputs are unchanged is skipped
//! - **Editing sessions**: provisioned with retry, health-checked and reaped
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use qhub::prelude::*;
//!
//! let config = HubConfig::new("/srv/projects", IdempotencyKeyMode::Semantic)
//!     .with_auth_token("alice:s3cret");
//! let hub = QuantumHub::from_config(config).await?;
//!
//! hub.scaffold_project("alice:s3cret", ProjectMetadata::new("bell", "Bell"), "circuit").await?;
//! let run = hub.start_run("alice:s3cret", "bell", vec![StageName::Simulate]).await?;
//! let run = hub.wait_run("alice:s3cret", "bell", &run.id).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod auth;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod hub;
pub mod pipeline;
pub mod retry;
pub mod scaffold;
pub mod session;
pub mod stages;
pub mod storage;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::ArtifactStore;
    pub use crate::auth::{Authenticator, CallerIdentity, StaticTokenAuthenticator};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{HubConfig, IdempotencyKeyMode, PipelineConfig, SessionConfig};
    pub use crate::core::{
        Artifact, ArtifactCategory, ArtifactRef, ExecutionStatus, PipelineRun, Project,
        ProjectMetadata, RunStatus, Session, SessionStatus, StageDefinition, StageExecution,
        StageName,
    };
    pub use crate::errors::{FailureReason, HubError, HubResult, StageError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::hub::{QuantumHub, QuantumHubBuilder};
    pub use crate::pipeline::{PipelineGraph, PipelineOrchestrator};
    pub use crate::scaffold::ProjectScaffolder;
    pub use crate::session::{SessionManager, SessionProvisioner};
    pub use crate::stages::{InProcessTool, ProcessTool, ToolInvocation, ToolTable};
    pub use crate::storage::{FsKvStore, InMemoryKvStore, KvStore};
}
