//! Lifecycle events for runs, stages, sessions and projects.
//!
//! Sinks are injected into each component; there is no process-global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod names {
    /// A pipeline run started.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A pipeline run succeeded.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A pipeline run failed.
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    /// A pipeline run was cancelled.
    pub const PIPELINE_CANCELLED: &str = "pipeline.cancelled";
    /// A stage started running.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage produced new outputs.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A stage reused existing outputs.
    pub const STAGE_SKIPPED: &str = "stage.skipped";
    /// A stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A stage attempt failed transiently and will be retried.
    pub const STAGE_RETRYING: &str = "stage.retrying";
    /// A stage was cancelled.
    pub const STAGE_CANCELLED: &str = "stage.cancelled";
    /// Provisioning of a session started.
    pub const SESSION_PROVISIONING: &str = "session.provisioning";
    /// A session became ready.
    pub const SESSION_READY: &str = "session.ready";
    /// A session failed its health checks.
    pub const SESSION_DEGRADED: &str = "session.degraded";
    /// A session was closed.
    pub const SESSION_CLOSED: &str = "session.closed";
    /// A project workspace was created.
    pub const PROJECT_SCAFFOLDED: &str = "project.scaffolded";
}
