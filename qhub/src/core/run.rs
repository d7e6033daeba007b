//! Pipeline run and stage execution records.

use super::artifact::ArtifactRef;
use super::stage::StageName;
use super::status::{ExecutionStatus, RunStatus};
use crate::errors::{FailureReason, HubError, HubResult};
use crate::utils::{now_utc, prefixed_id, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One execution of one stage inside a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageExecution {
    /// Execution id.
    pub id: String,
    /// The stage.
    pub stage: StageName,
    /// Status.
    pub status: ExecutionStatus,
    /// Input artifact versions chosen when the stage started.
    pub inputs: Vec<ArtifactRef>,
    /// Output artifact versions, populated on success.
    pub outputs: Vec<ArtifactRef>,
    /// Idempotency key of the inputs.
    pub input_key: Option<String>,
    /// Retries performed after the first attempt.
    pub retry_count: u32,
    /// Start time.
    pub started_at: Option<Timestamp>,
    /// End time.
    pub finished_at: Option<Timestamp>,
    /// Failure or cancellation reason.
    pub failure: Option<FailureReason>,
}

impl StageExecution {
    /// Creates a pending execution.
    #[must_use]
    pub fn new(stage: StageName) -> Self {
        Self {
            id: prefixed_id("exec"),
            stage,
            status: ExecutionStatus::Pending,
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_key: None,
            retry_count: 0,
            started_at: None,
            finished_at: None,
            failure: None,
        }
    }

    /// Moves the execution to `next`, rejecting backward transitions.
    pub fn transition(&mut self, next: ExecutionStatus) -> HubResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(HubError::Internal(format!(
                "invalid transition for stage {}: {} -> {next}",
                self.stage, self.status
            )));
        }
        let now = now_utc();
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

/// An append-only log line on a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// When the entry was written.
    pub at: Timestamp,
    /// The message.
    pub message: String,
}

/// One end-to-end execution attempt of some subset of stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Run id.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Overall status.
    pub status: RunStatus,
    /// Creation time.
    pub created_at: Timestamp,
    /// Completion time.
    pub finished_at: Option<Timestamp>,
    /// Stages the caller asked for.
    pub requested_stages: Vec<StageName>,
    /// Stages to execute, in topological order.
    pub stage_order: Vec<StageName>,
    /// Stage executions, in scheduling order.
    pub executions: Vec<StageExecution>,
    /// First stage that failed.
    pub failed_stage: Option<StageName>,
    /// Append-only log.
    pub log: Vec<RunLogEntry>,
}

impl PipelineRun {
    /// Creates a pending run with one pending execution per ordered stage.
    #[must_use]
    pub fn new(
        project_id: impl Into<String>,
        requested_stages: Vec<StageName>,
        stage_order: Vec<StageName>,
    ) -> Self {
        let executions = stage_order.iter().copied().map(StageExecution::new).collect();
        Self {
            id: prefixed_id("run"),
            project_id: project_id.into(),
            status: RunStatus::Pending,
            created_at: now_utc(),
            finished_at: None,
            requested_stages,
            stage_order,
            executions,
            failed_stage: None,
            log: Vec::new(),
        }
    }

    /// Returns the execution for `stage`.
    #[must_use]
    pub fn execution(&self, stage: StageName) -> Option<&StageExecution> {
        self.executions.iter().rev().find(|e| e.stage == stage)
    }

    /// Returns the execution for `stage` mutably.
    pub fn execution_mut(&mut self, stage: StageName) -> Option<&mut StageExecution> {
        self.executions.iter_mut().rev().find(|e| e.stage == stage)
    }

    /// Returns the status of every execution keyed by stage.
    #[must_use]
    pub fn stage_statuses(&self) -> HashMap<StageName, ExecutionStatus> {
        self.executions.iter().map(|e| (e.stage, e.status)).collect()
    }

    /// Appends a log entry. Allowed in every status.
    pub fn append_log(&mut self, message: impl Into<String>) {
        self.log.push(RunLogEntry {
            at: now_utc(),
            message: message.into(),
        });
    }

    /// Sets the run status; terminal runs only accept log appends.
    pub fn set_status(&mut self, status: RunStatus) -> HubResult<()> {
        if self.status.is_terminal() {
            return Err(HubError::Internal(format!(
                "run {} is already {}",
                self.id, self.status
            )));
        }
        if status.is_terminal() {
            self.finished_at = Some(now_utc());
        }
        self.status = status;
        Ok(())
    }
}
