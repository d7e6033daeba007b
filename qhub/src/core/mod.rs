//! Core domain model types.
//!
//! This module contains the records shared by every component:
//! - Stage names, artifact categories and stage definitions
//! - Run, execution and session status enums
//! - Project, artifact, run and session records

mod artifact;
mod project;
mod run;
mod session;
mod stage;
mod status;

pub use artifact::{Artifact, ArtifactFile, ArtifactRef};
pub use project::{Project, ProjectMetadata};
pub use run::{PipelineRun, RunLogEntry, StageExecution};
pub use session::Session;
pub use stage::{ArtifactCategory, StageDefinition, StageName};
pub use status::{ExecutionStatus, RunStatus, SessionStatus};
