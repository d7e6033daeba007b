//! External process execution for stage tools.

use super::tools::{ProcessTool, ToolInvocation};
use crate::core::StageName;
use crate::errors::StageError;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const STDERR_LOG: &str = "stderr.log";
const STDOUT_LOG: &str = "stdout.log";
const STDERR_TAIL_BYTES: usize = 2048;

/// Time a stopped tool gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Runs `tool` once for `invocation`.
///
/// Dropping this future (on deadline or cancellation) stops the child: it is
/// sent SIGTERM and killed if still running after [`TERMINATE_GRACE`].
pub(crate) async fn run_process(tool: &ProcessTool, invocation: &ToolInvocation) -> Result<(), StageError> {
    let stage = invocation.stage;
    let stdout = std::fs::File::create(invocation.exec_dir.join(STDOUT_LOG))
        .map_err(|e| StageError::infrastructure(stage, format!("cannot create stdout log: {e}")))?;
    let stderr = std::fs::File::create(invocation.exec_dir.join(STDERR_LOG))
        .map_err(|e| StageError::infrastructure(stage, format!("cannot create stderr log: {e}")))?;

    let mut command = Command::new(&tool.program);
    command
        .args(&tool.args)
        .envs(&tool.env)
        .env("QHUB_STAGE", stage.as_str())
        .env("QHUB_INPUT_DIR", &invocation.input_dir)
        .env("QHUB_OUTPUT_DIR", &invocation.output_dir)
        .env("QHUB_PROJECT_ID", &invocation.project_id)
        .env("QHUB_SDK", &invocation.sdk)
        .current_dir(&invocation.exec_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        StageError::invocation(stage, format!("failed to start '{}': {e}", tool.program))
    })?;
    debug!(stage = %stage, program = %tool.program, pid = ?child.id(), "Spawned stage tool");

    let mut running = RunningChild {
        stage,
        child: Some(child),
    };
    let status = running
        .wait()
        .await
        .map_err(|e| StageError::invocation(stage, format!("failed to wait for '{}': {e}", tool.program)))?;

    if status.success() {
        return Ok(());
    }

    let tail = stderr_tail(invocation).await;
    let message = if tail.is_empty() {
        format!("'{}' exited with {status}", tool.program)
    } else {
        format!("'{}' exited with {status}: {tail}", tool.program)
    };
    Err(StageError::execution(stage, message, status.code()))
}

/// A spawned tool that is stopped when dropped before it exits.
struct RunningChild {
    stage: StageName,
    child: Option<Child>,
}

impl RunningChild {
    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let Some(child) = self.child.as_mut() else {
            return Err(std::io::Error::other("child already reaped"));
        };
        let status = child.wait().await?;
        self.child = None;
        Ok(status)
    }
}

impl Drop for RunningChild {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(terminate(self.stage, child));
            }
            Err(_) => {
                if let Err(e) = child.start_kill() {
                    warn!(stage = %self.stage, error = %e, "Failed to kill stage tool");
                }
            }
        }
    }
}

/// Asks the child to exit, then kills it after the grace period.
async fn terminate(stage: StageName, mut child: Child) {
    let pid = child.id();
    if request_exit(pid).await {
        if let Ok(Ok(status)) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            debug!(stage = %stage, ?pid, %status, "Stage tool stopped");
            return;
        }
    }
    match child.kill().await {
        Ok(()) => debug!(stage = %stage, ?pid, "Stage tool killed"),
        Err(e) => warn!(stage = %stage, ?pid, error = %e, "Failed to kill stage tool"),
    }
}

#[cfg(unix)]
async fn request_exit(pid: Option<u32>) -> bool {
    let Some(pid) = pid else {
        return false;
    };
    Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .is_ok_and(|status| status.success())
}

#[cfg(not(unix))]
async fn request_exit(_pid: Option<u32>) -> bool {
    false
}

async fn stderr_tail(invocation: &ToolInvocation) -> String {
    let Ok(bytes) = tokio::fs::read(invocation.exec_dir.join(STDERR_LOG)).await else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::{ArtifactCategory, StageName};

    fn invocation(dir: &std::path::Path) -> ToolInvocation {
        let input_dir = dir.join("inputs");
        let output_dir = dir.join("outputs");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();
        ToolInvocation {
            stage: StageName::Optimize,
            project_id: "p1".to_string(),
            sdk: "openqasm".to_string(),
            execution_id: "exec-1".to_string(),
            exec_dir: dir.to_path_buf(),
            input_dir,
            output_dir,
            outputs: vec![ArtifactCategory::new("ir/optimized").unwrap()],
        }
    }

    fn sh(script: &str) -> ProcessTool {
        ProcessTool::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_process_receives_environment() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path());
        let tool = sh("mkdir -p \"$QHUB_OUTPUT_DIR/ir\" && echo \"$QHUB_STAGE $QHUB_PROJECT_ID $QHUB_SDK\" > \"$QHUB_OUTPUT_DIR/ir/env.txt\"");
        run_process(&tool, &inv).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("outputs/ir/env.txt")).unwrap();
        assert_eq!(written.trim(), "optimize p1 openqasm");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path());
        let err = run_process(&sh("echo boom >&2; exit 3"), &inv).await.unwrap_err();
        match err {
            StageError::ToolExecution { exit_code, message, .. } => {
                assert_eq!(exit_code, Some(3));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_invocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path());
        let err = run_process(&ProcessTool::new("/nonexistent/qhub-tool"), &inv)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(err.code(), "STAGE-TOOL-INVOCATION");
    }

    #[tokio::test]
    async fn test_dropped_run_sends_sigterm_first() {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(dir.path());
        let marker = dir.path().join("stopped");
        let script = format!(
            "trap 'echo term > \"{}\"; exit 0' TERM; while :; do sleep 0.05; done",
            marker.display()
        );

        let run = tokio::time::timeout(Duration::from_millis(300), run_process(&sh(&script), &inv)).await;
        assert!(run.is_err());

        for _ in 0..100 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "term");
    }
}
