//! Error types for the quantum hub.
//!
//! Every error exposes a machine-readable `code()` so failures recorded on
//! stage executions and sessions can be inspected without string matching.

use crate::core::StageName;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Result alias for hub operations.
pub type HubResult<T> = Result<T, HubError>;

/// The main error type for hub operations.
#[derive(Debug, Error)]
pub enum HubError {
    /// The pipeline graph or hub configuration is invalid.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A stage failed.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// Provisioning an editing session failed after all retries.
    #[error("{0}")]
    Provisioning(#[from] ProvisioningError),

    /// The caller token was rejected.
    #[error("{0}")]
    Unauthorized(#[from] UnauthorizedError),

    /// The project workspace already exists.
    #[error("{0}")]
    AlreadyScaffolded(#[from] AlreadyScaffoldedError),

    /// The requested template is not known.
    #[error("{0}")]
    UnknownTemplate(#[from] UnknownTemplateError),

    /// The storage backend failed.
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// A requested entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind (project, run, session, artifact).
        kind: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A pipeline run is already active for the project.
    #[error("Pipeline run {run_id} is already active for project {project_id}")]
    RunInProgress {
        /// The project id.
        project_id: String,
        /// The active run id.
        run_id: String,
    },

    /// The request was malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HubError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Returns the machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(e) => e.code,
            Self::Stage(e) => e.code(),
            Self::Provisioning(_) => ProvisioningError::CODE,
            Self::Unauthorized(_) => UnauthorizedError::CODE,
            Self::AlreadyScaffolded(_) => AlreadyScaffoldedError::CODE,
            Self::UnknownTemplate(_) => UnknownTemplateError::CODE,
            Self::Storage(_) => "STORAGE-FAILURE",
            Self::NotFound { .. } => "NOT-FOUND",
            Self::RunInProgress { .. } => "RUN-IN-PROGRESS",
            Self::InvalidInput(_) => "INVALID-INPUT",
            Self::Io(_) => "IO-FAILURE",
            Self::Serialization(_) => "SERIALIZATION-FAILURE",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

/// Error raised when a pipeline graph or configuration is invalid.
///
/// Raised at load time, never during a run.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Error code.
    pub code: &'static str,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            code: "CONFIG-INVALID",
        }
    }

    /// Creates an error describing a dependency cycle.
    #[must_use]
    pub fn cycle(cycle_path: Vec<String>) -> Self {
        Self {
            message: format!("Cycle detected in pipeline: {}", cycle_path.join(" -> ")),
            stages: cycle_path,
            code: "CONFIG-CYCLE",
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the error code.
    #[must_use]
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = code;
        self
    }
}

/// Errors produced while executing a single stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    /// The stage tool could not be started.
    #[error("Stage {stage}: tool invocation failed: {message}")]
    ToolInvocation {
        /// The stage.
        stage: StageName,
        /// Failure detail.
        message: String,
    },

    /// The tool ran but failed or produced no declared outputs.
    #[error("Stage {stage}: tool execution failed: {message}")]
    ToolExecution {
        /// The stage.
        stage: StageName,
        /// Failure detail.
        message: String,
        /// Process exit code, if the tool was a process that exited.
        exit_code: Option<i32>,
    },

    /// The stage exceeded its deadline.
    #[error("Stage {stage}: timed out after {timeout_ms}ms")]
    Timeout {
        /// The stage.
        stage: StageName,
        /// The deadline that was exceeded.
        timeout_ms: u64,
    },

    /// The stage was cancelled while running.
    #[error("Stage {stage}: cancelled: {reason}")]
    Cancelled {
        /// The stage.
        stage: StageName,
        /// Cancellation reason.
        reason: String,
    },

    /// Preparing inputs or recording outputs failed.
    #[error("Stage {stage}: infrastructure failure: {message}")]
    Infrastructure {
        /// The stage.
        stage: StageName,
        /// Failure detail.
        message: String,
    },
}

impl StageError {
    /// Creates a tool invocation error.
    #[must_use]
    pub fn invocation(stage: StageName, message: impl Into<String>) -> Self {
        Self::ToolInvocation {
            stage,
            message: message.into(),
        }
    }

    /// Creates a tool execution error.
    #[must_use]
    pub fn execution(stage: StageName, message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::ToolExecution {
            stage,
            message: message.into(),
            exit_code,
        }
    }

    /// Creates an infrastructure error.
    #[must_use]
    pub fn infrastructure(stage: StageName, message: impl Into<String>) -> Self {
        Self::Infrastructure {
            stage,
            message: message.into(),
        }
    }

    /// Returns the stage that failed.
    #[must_use]
    pub fn stage(&self) -> StageName {
        match self {
            Self::ToolInvocation { stage, .. }
            | Self::ToolExecution { stage, .. }
            | Self::Timeout { stage, .. }
            | Self::Cancelled { stage, .. }
            | Self::Infrastructure { stage, .. } => *stage,
        }
    }

    /// Returns true for failure classes that may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ToolInvocation { .. } | Self::Timeout { .. })
    }

    /// Returns the machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ToolInvocation { .. } => "STAGE-TOOL-INVOCATION",
            Self::ToolExecution { .. } => "STAGE-TOOL-EXECUTION",
            Self::Timeout { .. } => "STAGE-TIMEOUT",
            Self::Cancelled { .. } => "STAGE-CANCELLED",
            Self::Infrastructure { .. } => "STAGE-INFRASTRUCTURE",
        }
    }

    /// Builds the failure record stored on the stage execution.
    #[must_use]
    pub fn failure_reason(&self) -> FailureReason {
        FailureReason::new(self.code(), self.to_string()).with_stage(self.stage())
    }
}

/// Error raised when a session cannot be provisioned.
#[derive(Debug, Clone, Error)]
#[error("Provisioning failed for project {project_id} after {attempts} attempt(s): {message}")]
pub struct ProvisioningError {
    /// The project id.
    pub project_id: String,
    /// Number of provisioning attempts made.
    pub attempts: u32,
    /// The last failure message.
    pub message: String,
}

impl ProvisioningError {
    /// Error code.
    pub const CODE: &'static str = "SESSION-PROVISIONING";

    /// Creates a new provisioning error.
    #[must_use]
    pub fn new(project_id: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Builds the failure record stored on the session.
    #[must_use]
    pub fn failure_reason(&self) -> FailureReason {
        FailureReason::new(Self::CODE, self.to_string())
    }
}

/// Error raised when a caller token is invalid.
#[derive(Debug, Clone, Error)]
#[error("Unauthorized: {reason}")]
pub struct UnauthorizedError {
    /// Why the token was rejected.
    pub reason: String,
}

impl UnauthorizedError {
    /// Error code.
    pub const CODE: &'static str = "AUTH-UNAUTHORIZED";

    /// Creates a new unauthorized error.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Error raised when scaffolding a project id twice.
#[derive(Debug, Clone, Error)]
#[error("Project {project_id} has already been scaffolded")]
pub struct AlreadyScaffoldedError {
    /// The project id.
    pub project_id: String,
}

impl AlreadyScaffoldedError {
    /// Error code.
    pub const CODE: &'static str = "SCAFFOLD-EXISTS";

    /// Creates a new already-scaffolded error.
    #[must_use]
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
        }
    }
}

/// Error raised for an unrecognized template id.
#[derive(Debug, Clone, Error)]
#[error("Unknown template '{template}' (available: {})", available.join(", "))]
pub struct UnknownTemplateError {
    /// The requested template.
    pub template: String,
    /// The templates that exist.
    pub available: Vec<String>,
}

impl UnknownTemplateError {
    /// Error code.
    pub const CODE: &'static str = "SCAFFOLD-UNKNOWN-TEMPLATE";

    /// Creates a new unknown template error.
    #[must_use]
    pub fn new(template: impl Into<String>, available: Vec<String>) -> Self {
        Self {
            template: template.into(),
            available,
        }
    }
}

/// Errors from the key-value storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An IO operation on a key failed.
    #[error("Storage IO error on '{key}': {source}")]
    Io {
        /// The key being accessed.
        key: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The key is not a valid storage key.
    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record at '{key}': {message}")]
    Corrupt {
        /// The key of the record.
        key: String,
        /// Decode failure detail.
        message: String,
    },
}

impl StorageError {
    /// Creates an IO error for a key.
    #[must_use]
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }
}

/// Machine-readable reason attached to a failed or cancelled record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// The stage the record belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    /// The stage whose failure caused this record to be cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause_stage: Option<StageName>,
}

impl FailureReason {
    /// Creates a new failure reason.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            stage: None,
            root_cause_stage: None,
        }
    }

    /// Reason for a stage cancelled because an upstream stage failed.
    #[must_use]
    pub fn upstream_failed(stage: StageName, root_cause: StageName) -> Self {
        Self {
            code: "STAGE-CANCELLED".to_string(),
            message: format!("cancelled because upstream stage '{root_cause}' failed"),
            stage: Some(stage),
            root_cause_stage: Some(root_cause),
        }
    }

    /// Reason for a stage cancelled with the run.
    #[must_use]
    pub fn run_cancelled(stage: StageName, reason: &str) -> Self {
        Self {
            code: "STAGE-CANCELLED".to_string(),
            message: format!("run cancelled: {reason}"),
            stage: Some(stage),
            root_cause_stage: None,
        }
    }

    /// Sets the stage.
    #[must_use]
    pub fn with_stage(mut self, stage: StageName) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("message".to_string(), serde_json::json!(self.message));
        if let Some(stage) = self.stage {
            map.insert("stage".to_string(), serde_json::json!(stage.as_str()));
        }
        if let Some(root) = self.root_cause_stage {
            map.insert("root_cause_stage".to_string(), serde_json::json!(root.as_str()));
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_message() {
        let err = ConfigurationError::cycle(vec![
            "optimize".to_string(),
            "simulate".to_string(),
            "optimize".to_string(),
        ]);
        assert_eq!(err.code, "CONFIG-CYCLE");
        assert!(err.to_string().contains("optimize -> simulate -> optimize"));
    }

    #[test]
    fn test_stage_error_transience() {
        assert!(StageError::invocation(StageName::Optimize, "missing binary").is_transient());
        assert!(StageError::Timeout {
            stage: StageName::Simulate,
            timeout_ms: 10
        }
        .is_transient());
        assert!(!StageError::execution(StageName::Optimize, "exit 1", Some(1)).is_transient());
        assert!(!StageError::Cancelled {
            stage: StageName::Test,
            reason: "user".into()
        }
        .is_transient());
    }

    #[test]
    fn test_stage_error_failure_reason() {
        let reason = StageError::execution(StageName::Optimize, "exit 2", Some(2)).failure_reason();
        assert_eq!(reason.code, "STAGE-TOOL-EXECUTION");
        assert_eq!(reason.stage, Some(StageName::Optimize));
        assert!(reason.root_cause_stage.is_none());
    }

    #[test]
    fn test_upstream_failed_reason() {
        let reason = FailureReason::upstream_failed(StageName::Simulate, StageName::Optimize);
        let dict = reason.to_dict();
        assert_eq!(dict["root_cause_stage"], serde_json::json!("optimize"));
        assert_eq!(dict["code"], serde_json::json!("STAGE-CANCELLED"));
    }

    #[test]
    fn test_hub_error_codes() {
        let err: HubError = UnauthorizedError::new("missing token").into();
        assert_eq!(err.code(), "AUTH-UNAUTHORIZED");
        let err: HubError = UnknownTemplateError::new("nope", vec!["circuit".into()]).into();
        assert_eq!(err.code(), "SCAFFOLD-UNKNOWN-TEMPLATE");
        assert!(err.to_string().contains("circuit"));
        assert_eq!(HubError::not_found("run", "run-1").code(), "NOT-FOUND");
    }
}
