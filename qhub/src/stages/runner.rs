//! Executes exactly one stage execution.
//!
//! The runner never retries; retry policy belongs to the orchestrator.

use super::tools::{category_path, StageTool, ToolInvocation, ToolTable};
use super::workdir::{collect_tree, copy_tree, reset_dir, tree_digest};
use crate::artifacts::{ArtifactDraft, ArtifactStore, OutputSet};
use crate::cancellation::CancellationToken;
use crate::config::IdempotencyKeyMode;
use crate::core::{ArtifactRef, Project, StageDefinition, StageName};
use crate::errors::StageError;
use crate::utils::{now_utc, KeyHasher};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One request to run a stage.
#[derive(Debug, Clone)]
pub struct StageRunRequest {
    /// The project.
    pub project: Arc<Project>,
    /// The stage's contract.
    pub definition: StageDefinition,
    /// Input artifact versions, resolved at schedule time.
    pub inputs: Vec<ArtifactRef>,
    /// Owning run.
    pub run_id: Option<String>,
    /// Execution id.
    pub execution_id: String,
    /// Deadline for one attempt.
    pub timeout: Duration,
    /// Cancellation of the owning run.
    pub cancel: Arc<CancellationToken>,
}

impl StageRunRequest {
    fn stage(&self) -> StageName {
        self.definition.name
    }

    fn exec_dir(&self) -> PathBuf {
        self.project
            .workspace_root
            .join(".qhub")
            .join("exec")
            .join(&self.execution_id)
    }
}

/// Result of a successful stage run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    /// Output artifact versions.
    pub outputs: Vec<ArtifactRef>,
    /// Input key the outputs belong to.
    pub input_key: String,
    /// True when existing outputs were reused without invoking the tool.
    pub cache_hit: bool,
}

/// Latest deterministic failure per (project, stage), with its input key.
type FailureMemo = DashMap<(String, StageName), (String, StageError)>;

fn infra(stage: StageName, err: impl std::fmt::Display) -> StageError {
    StageError::infrastructure(stage, err.to_string())
}

/// Runs stages against the artifact store using the tool table.
pub struct StageRunner {
    artifacts: Arc<ArtifactStore>,
    tools: ToolTable,
    key_mode: IdempotencyKeyMode,
    failure_memo: FailureMemo,
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("tools", &self.tools.stages())
            .field("key_mode", &self.key_mode)
            .field("memoized_failures", &self.failure_memo.len())
            .finish_non_exhaustive()
    }
}

impl StageRunner {
    /// Creates a runner.
    pub fn new(artifacts: Arc<ArtifactStore>, tools: ToolTable, key_mode: IdempotencyKeyMode) -> Self {
        Self {
            artifacts,
            tools,
            key_mode,
            failure_memo: DashMap::new(),
        }
    }

    /// The idempotency key mode in use.
    #[must_use]
    pub fn key_mode(&self) -> IdempotencyKeyMode {
        self.key_mode
    }

    /// Computes the idempotency key for a request.
    ///
    /// The key covers the stage, the tool fingerprint, every input digest in
    /// declaration order and, for source-consuming stages, the `src/` tree.
    pub async fn input_key(&self, request: &StageRunRequest) -> Result<String, StageError> {
        let stage = request.stage();
        Self::check_inputs(request)?;

        let fingerprint = self
            .tools
            .get(stage)
            .map_or_else(|| "unbound".to_string(), super::tools::StageTool::fingerprint);

        let mut hasher = KeyHasher::new();
        hasher
            .part(stage.as_str())
            .part(&fingerprint)
            .part(self.key_mode.to_string());
        for category in &request.definition.inputs {
            if let Some(input) = request.inputs.iter().find(|i| &i.category == category) {
                let digest = match self.key_mode {
                    IdempotencyKeyMode::ExactBytes => &input.digest,
                    IdempotencyKeyMode::Semantic => &input.semantic_digest,
                };
                hasher.part(category.as_str()).part(digest);
            }
        }
        if request.definition.consumes_source {
            let source = request.project.workspace_root.join("src");
            let digest = tree_digest(&source, self.key_mode)
                .await
                .map_err(|e| StageError::infrastructure(stage, format!("cannot hash source tree: {e}")))?;
            hasher.part("source").part(digest);
        }
        Ok(hasher.finish())
    }

    /// Runs a stage: computes its key, then behaves as [`run_keyed`](Self::run_keyed).
    pub async fn run(&self, request: &StageRunRequest) -> Result<StageOutcome, StageError> {
        let key = self.input_key(request).await?;
        self.run_keyed(request, &key).await
    }

    /// Runs a stage whose input key is already known.
    pub async fn run_keyed(
        &self,
        request: &StageRunRequest,
        input_key: &str,
    ) -> Result<StageOutcome, StageError> {
        let stage = request.stage();
        let project_id = request.project.id.as_str();
        let memo_key = (project_id.to_string(), stage);

        if let Some(previous) = self
            .failure_memo
            .get(&memo_key)
            .filter(|entry| entry.value().0 == input_key)
            .map(|entry| entry.value().1.clone())
        {
            debug!(project_id, stage = %stage, "Replaying memoized deterministic failure");
            return Err(previous);
        }

        if request.definition.idempotent {
            if let Some(outputs) = self.cached_outputs(request, input_key).await? {
                info!(project_id, stage = %stage, "Reusing outputs for identical inputs");
                return Ok(StageOutcome {
                    outputs,
                    input_key: input_key.to_string(),
                    cache_hit: true,
                });
            }
        }

        let result = self.execute(request, input_key).await;
        match &result {
            Err(err @ StageError::ToolExecution { .. }) => {
                self.failure_memo
                    .insert(memo_key, (input_key.to_string(), err.clone()));
            }
            Ok(_) => {
                self.failure_memo.remove(&memo_key);
            }
            Err(_) => {}
        }
        result
    }

    fn check_inputs(request: &StageRunRequest) -> Result<(), StageError> {
        let stage = request.stage();
        for category in &request.definition.inputs {
            let matching = request.inputs.iter().filter(|i| &i.category == category).count();
            if matching != 1 {
                return Err(StageError::infrastructure(
                    stage,
                    format!("expected exactly one input for '{category}', got {matching}"),
                ));
            }
        }
        if let Some(extra) = request
            .inputs
            .iter()
            .find(|i| !request.definition.inputs.contains(&i.category))
        {
            return Err(StageError::infrastructure(
                stage,
                format!("undeclared input '{}'", extra.category),
            ));
        }
        Ok(())
    }

    async fn cached_outputs(
        &self,
        request: &StageRunRequest,
        input_key: &str,
    ) -> Result<Option<Vec<ArtifactRef>>, StageError> {
        let stage = request.stage();
        let project_id = &request.project.id;
        let sets = self
            .artifacts
            .outputs_for(project_id, stage, input_key)
            .await
            .map_err(|e| infra(stage, e))?;

        let Some(latest) = sets.into_iter().last() else {
            return Ok(None);
        };
        let complete = request
            .definition
            .outputs
            .iter()
            .all(|category| latest.outputs.iter().any(|o| &o.category == category));
        if !complete {
            return Ok(None);
        }
        for output in &latest.outputs {
            let exists = self
                .artifacts
                .get(project_id, &output.category, output.version)
                .await
                .map_err(|e| infra(stage, e))?
                .is_some();
            if !exists {
                return Ok(None);
            }
        }
        Ok(Some(latest.outputs))
    }

    async fn prepare(&self, request: &StageRunRequest) -> Result<ToolInvocation, StageError> {
        let stage = request.stage();

        let exec_dir = request.exec_dir();
        let input_dir = exec_dir.join("inputs");
        let output_dir = exec_dir.join("outputs");
        reset_dir(&exec_dir).await.map_err(|e| infra(stage, e))?;
        tokio::fs::create_dir_all(&input_dir).await.map_err(|e| infra(stage, e))?;

        for input in &request.inputs {
            let artifact = self
                .artifacts
                .resolve(&request.project.id, input)
                .await
                .map_err(|e| infra(stage, e))?;
            self.artifacts
                .write_files(&artifact, &category_path(&input_dir, &input.category))
                .await
                .map_err(|e| infra(stage, e))?;
        }
        if request.definition.consumes_source {
            copy_tree(&request.project.workspace_root.join("src"), &input_dir.join("source"))
                .await
                .map_err(|e| infra(stage, e))?;
        }
        for category in &request.definition.outputs {
            tokio::fs::create_dir_all(category_path(&output_dir, category))
                .await
                .map_err(|e| infra(stage, e))?;
        }

        Ok(ToolInvocation {
            stage,
            project_id: request.project.id.clone(),
            sdk: request.project.sdk.clone(),
            execution_id: request.execution_id.clone(),
            exec_dir,
            input_dir,
            output_dir,
            outputs: request.definition.outputs.clone(),
        })
    }

    async fn execute(&self, request: &StageRunRequest, input_key: &str) -> Result<StageOutcome, StageError> {
        let stage = request.stage();
        let tool = self
            .tools
            .get(stage)
            .ok_or_else(|| StageError::invocation(stage, "no tool registered for stage"))?;

        if request.cancel.is_cancelled() {
            return Err(StageError::Cancelled {
                stage,
                reason: request.cancel.reason().unwrap_or_default(),
            });
        }

        let exec_dir = request.exec_dir();
        let result = match self.prepare(request).await {
            Ok(invocation) => self.invoke_and_store(request, tool, &invocation, input_key).await,
            Err(e) => Err(e),
        };
        clean_exec_dir(stage, &exec_dir, result.is_ok()).await;

        Ok(StageOutcome {
            outputs: result?,
            input_key: input_key.to_string(),
            cache_hit: false,
        })
    }

    async fn invoke_and_store(
        &self,
        request: &StageRunRequest,
        tool: &StageTool,
        invocation: &ToolInvocation,
        input_key: &str,
    ) -> Result<Vec<ArtifactRef>, StageError> {
        let stage = request.stage();
        let timeout_ms = u64::try_from(request.timeout.as_millis()).unwrap_or(u64::MAX);
        let result = tokio::select! {
            biased;
            () = request.cancel.cancelled() => Err(StageError::Cancelled {
                stage,
                reason: request.cancel.reason().unwrap_or_default(),
            }),
            timed = tokio::time::timeout(request.timeout, tool.invoke(invocation)) => {
                timed.unwrap_or(Err(StageError::Timeout { stage, timeout_ms }))
            }
        };
        result?;
        self.store_outputs(request, invocation, input_key).await
    }

    async fn store_outputs(
        &self,
        request: &StageRunRequest,
        invocation: &ToolInvocation,
        input_key: &str,
    ) -> Result<Vec<ArtifactRef>, StageError> {
        let stage = request.stage();

        let mut drafts = Vec::with_capacity(request.definition.outputs.len());
        for category in &request.definition.outputs {
            let dir = invocation.output_path(category);
            // Nested output categories of the same stage are collected separately.
            let nested: Vec<PathBuf> = request
                .definition
                .outputs
                .iter()
                .filter(|other| {
                    *other != category && other.as_str().starts_with(&format!("{category}/"))
                })
                .map(|other| invocation.output_path(other))
                .collect();
            let files = collect_tree(&dir, &nested).await.map_err(|e| infra(stage, e))?;
            if files.is_empty() {
                return Err(StageError::execution(
                    stage,
                    format!("tool produced no files for declared output '{category}'"),
                    None,
                ));
            }
            drafts.push(ArtifactDraft {
                project_id: request.project.id.clone(),
                category: category.clone(),
                stage,
                run_id: request.run_id.clone(),
                execution_id: request.execution_id.clone(),
                input_key: input_key.to_string(),
                files,
            });
        }

        let mut outputs = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let artifact = self.artifacts.put(draft).await.map_err(|e| infra(stage, e))?;
            self.artifacts
                .materialize(&artifact, &request.project.workspace_root)
                .await
                .map_err(|e| infra(stage, e))?;
            outputs.push(artifact.to_ref());
        }

        self.artifacts
            .record_output_set(
                &request.project.id,
                &OutputSet {
                    execution_id: request.execution_id.clone(),
                    run_id: request.run_id.clone(),
                    stage,
                    input_key: input_key.to_string(),
                    outputs: outputs.clone(),
                    recorded_at: now_utc(),
                },
            )
            .await
            .map_err(|e| infra(stage, e))?;
        Ok(outputs)
    }
}

/// Removes an execution directory. Failed executions keep their logs.
async fn clean_exec_dir(stage: StageName, exec_dir: &Path, succeeded: bool) {
    let targets = if succeeded {
        vec![exec_dir.to_path_buf()]
    } else {
        vec![exec_dir.join("inputs"), exec_dir.join("outputs")]
    };
    for target in targets {
        match tokio::fs::remove_dir_all(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(stage = %stage, path = %target.display(), error = %e, "Failed to clean execution directory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineGraph;
    use crate::stages::tools::InProcessTool;
    use crate::storage::InMemoryKvStore;
    use crate::testing::{fixtures, ScriptedTool};

    struct Harness {
        _dir: tempfile::TempDir,
        project: Arc<Project>,
        artifacts: Arc<ArtifactStore>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let project = Arc::new(fixtures::project_in(dir.path(), "p1"));
        std::fs::create_dir_all(project.workspace_root.join("src")).unwrap();
        std::fs::write(project.workspace_root.join("src/main.qasm"), b"h q[0];\n").unwrap();
        let artifacts = Arc::new(ArtifactStore::new(
            Arc::new(InMemoryKvStore::new()),
            PipelineGraph::standard().output_categories(),
        ));
        Harness {
            _dir: dir,
            project,
            artifacts,
        }
    }

    fn request(h: &Harness, stage: StageName, inputs: Vec<ArtifactRef>) -> StageRunRequest {
        let definition = PipelineGraph::standard().definition(stage).unwrap().clone();
        StageRunRequest {
            project: h.project.clone(),
            definition,
            inputs,
            run_id: Some("run-test".to_string()),
            execution_id: crate::utils::prefixed_id("exec"),
            timeout: Duration::from_secs(5),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    fn runner(h: &Harness, stage: StageName, tool: Arc<dyn InProcessTool>) -> StageRunner {
        StageRunner::new(
            h.artifacts.clone(),
            ToolTable::new().with_in_process(stage, tool),
            IdempotencyKeyMode::ExactBytes,
        )
    }

    #[tokio::test]
    async fn test_generate_reads_source_and_stores_outputs() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::succeeding("gen"));
        let runner = runner(&h, StageName::Generate, tool.clone());

        let outcome = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        assert!(!outcome.cache_hit);
        assert_eq!(outcome.outputs.len(), 1);
        assert_eq!(outcome.outputs[0].category.as_str(), "ir/base");
        assert_eq!(tool.invocations(), 1);

        // Materialised into the workspace.
        assert!(h.project.workspace_root.join("ir/base/v1").is_dir());
    }

    #[tokio::test]
    async fn test_idempotent_rerun_is_cache_hit() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::succeeding("gen"));
        let runner = runner(&h, StageName::Generate, tool.clone());

        let first = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        let second = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(first.outputs, second.outputs);
        assert_eq!(tool.invocations(), 1);
    }

    #[tokio::test]
    async fn test_source_change_invalidates_key() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::succeeding("gen"));
        let runner = runner(&h, StageName::Generate, tool.clone());

        runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        std::fs::write(h.project.workspace_root.join("src/main.qasm"), b"x q[0];\n").unwrap();
        let second = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        assert!(!second.cache_hit);
        assert_eq!(second.outputs[0].version, 2);
        assert_eq!(tool.invocations(), 2);
    }

    #[tokio::test]
    async fn test_non_idempotent_rerun_writes_new_version() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::succeeding("gen"));
        let runner = runner(&h, StageName::Generate, tool.clone());

        let mut req = request(&h, StageName::Generate, vec![]);
        req.definition.idempotent = false;
        let first = runner.run(&req).await.unwrap();
        let second = runner.run(&req).await.unwrap();
        assert_eq!(first.input_key, second.input_key);
        assert_eq!((first.outputs[0].version, second.outputs[0].version), (1, 2));
        assert_eq!(tool.invocations(), 2);
    }

    #[tokio::test]
    async fn test_deterministic_failure_is_memoized() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::failing_execution("gen"));
        let runner = runner(&h, StageName::Generate, tool.clone());

        let first = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap_err();
        let second = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap_err();
        assert_eq!(first, second);
        assert_eq!(tool.invocations(), 1);
    }

    #[tokio::test]
    async fn test_missing_outputs_is_execution_error() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::succeeding("gen").without_outputs());
        let runner = runner(&h, StageName::Generate, tool);
        let err = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap_err();
        assert_eq!(err.code(), "STAGE-TOOL-EXECUTION");
    }

    #[tokio::test]
    async fn test_timeout() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::succeeding("gen").with_delay(Duration::from_secs(30)));
        let runner = runner(&h, StageName::Generate, tool);
        let mut req = request(&h, StageName::Generate, vec![]);
        req.timeout = Duration::from_millis(20);
        let err = runner.run(&req).await.unwrap_err();
        assert!(matches!(err, StageError::Timeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_tool() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::succeeding("gen").with_delay(Duration::from_secs(30)));
        let runner = runner(&h, StageName::Generate, tool);
        let req = request(&h, StageName::Generate, vec![]);
        let cancel = req.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel("user requested");
        });
        let err = runner.run(&req).await.unwrap_err();
        assert_eq!(
            err,
            StageError::Cancelled {
                stage: StageName::Generate,
                reason: "user requested".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_rejects_undeclared_inputs() {
        let h = harness();
        let gen = runner(&h, StageName::Generate, Arc::new(ScriptedTool::succeeding("gen")));
        let base = gen.run(&request(&h, StageName::Generate, vec![])).await.unwrap();

        // Optimize gets ir/base twice.
        let opt = runner(&h, StageName::Optimize, Arc::new(ScriptedTool::succeeding("opt")));
        let inputs = vec![base.outputs[0].clone(), base.outputs[0].clone()];
        let err = opt.run(&request(&h, StageName::Optimize, inputs)).await.unwrap_err();
        assert_eq!(err.code(), "STAGE-INFRASTRUCTURE");
    }

    #[tokio::test]
    async fn test_tool_sees_only_declared_inputs() {
        let h = harness();
        let gen = runner(&h, StageName::Generate, Arc::new(ScriptedTool::succeeding("gen")));
        let base = gen.run(&request(&h, StageName::Generate, vec![])).await.unwrap();

        let tool = Arc::new(ScriptedTool::succeeding("opt"));
        let opt = runner(&h, StageName::Optimize, tool.clone());
        opt.run(&request(&h, StageName::Optimize, base.outputs.clone()))
            .await
            .unwrap();
        let seen = tool.last_inputs();
        assert_eq!(seen, vec!["ir/base/circuit.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_tool_is_invocation_error() {
        let h = harness();
        let runner = StageRunner::new(
            h.artifacts.clone(),
            ToolTable::new(),
            IdempotencyKeyMode::Semantic,
        );
        let err = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap_err();
        assert!(err.is_transient());
    }

    fn semantic_runner(h: &Harness, tool: Arc<dyn InProcessTool>) -> StageRunner {
        StageRunner::new(
            h.artifacts.clone(),
            ToolTable::new().with_in_process(StageName::Generate, tool),
            IdempotencyKeyMode::Semantic,
        )
    }

    #[tokio::test]
    async fn test_semantic_mode_ignores_comments_only() {
        let h = harness();
        let main = h.project.workspace_root.join("src/main.py");
        std::fs::write(&main, "def bell():\n    return 1\n").unwrap();
        let tool = Arc::new(ScriptedTool::succeeding("gen"));
        let runner = semantic_runner(&h, tool.clone());

        runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        std::fs::write(&main, "# Bell state\ndef bell():\n    return 1  # one\n\n").unwrap();
        let second = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(tool.invocations(), 1);
    }

    #[tokio::test]
    async fn test_semantic_mode_reruns_on_indentation_change() {
        let h = harness();
        let main = h.project.workspace_root.join("src/main.py");
        std::fs::write(&main, "def bell():\n    build()\nrun()\n").unwrap();
        let tool = Arc::new(ScriptedTool::succeeding("gen"));
        let runner = semantic_runner(&h, tool.clone());

        let first = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        std::fs::write(&main, "def bell():\n    build()\n    run()\n").unwrap();
        let second = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        assert!(!second.cache_hit);
        assert_ne!(first.input_key, second.input_key);
        assert_eq!(tool.invocations(), 2);

        std::fs::write(&main, "def bell():\n    build()\n    run(n // 2)\n").unwrap();
        let third = runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap();
        assert!(!third.cache_hit);
        assert_eq!(tool.invocations(), 3);
    }

    #[tokio::test]
    async fn test_exec_dir_cleaned_on_every_outcome() {
        let h = harness();
        let ok = runner(&h, StageName::Generate, Arc::new(ScriptedTool::succeeding("gen")));
        let req = request(&h, StageName::Generate, vec![]);
        ok.run(&req).await.unwrap();
        assert!(!req.exec_dir().exists());

        let failing = runner(&h, StageName::Generate, Arc::new(ScriptedTool::failing_execution("gen")));
        let req = request(&h, StageName::Generate, vec![]);
        failing.run(&req).await.unwrap_err();
        assert!(!req.exec_dir().join("inputs").exists());
        assert!(!req.exec_dir().join("outputs").exists());

        let slow = runner(
            &h,
            StageName::Generate,
            Arc::new(ScriptedTool::succeeding("gen").with_delay(Duration::from_secs(30))),
        );
        let mut req = request(&h, StageName::Generate, vec![]);
        req.timeout = Duration::from_millis(20);
        slow.run(&req).await.unwrap_err();
        assert!(!req.exec_dir().join("inputs").exists());
    }

    #[tokio::test]
    async fn test_failure_memo_keeps_latest_key_only() {
        let h = harness();
        let tool = Arc::new(ScriptedTool::failing_execution("gen"));
        let runner = runner(&h, StageName::Generate, tool.clone());

        for source in ["h q[0];\n", "x q[0];\n", "y q[0];\n"] {
            std::fs::write(h.project.workspace_root.join("src/main.qasm"), source).unwrap();
            runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap_err();
        }
        assert_eq!(tool.invocations(), 3);
        assert_eq!(runner.failure_memo.len(), 1);

        // The previous key is no longer memoized.
        std::fs::write(h.project.workspace_root.join("src/main.qasm"), "x q[0];\n").unwrap();
        runner.run(&request(&h, StageName::Generate, vec![])).await.unwrap_err();
        assert_eq!(tool.invocations(), 4);
    }

    #[cfg(unix)]
    mod process_tool {
        use super::*;
        use crate::stages::tools::ProcessTool;

        fn alive(pid: &str) -> bool {
            std::process::Command::new("kill")
                .args(["-0", pid])
                .stderr(std::process::Stdio::null())
                .status()
                .is_ok_and(|status| status.success())
        }

        async fn assert_exits(pid_file: &std::path::Path) {
            let pid = std::fs::read_to_string(pid_file).unwrap().trim().to_string();
            for _ in 0..200 {
                if !alive(&pid) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("tool process {pid} still running");
        }

        fn sleeper(h: &Harness, pid_file: &std::path::Path) -> StageRunner {
            let script = format!("echo $$ > '{}'; exec sleep 30", pid_file.display());
            StageRunner::new(
                h.artifacts.clone(),
                ToolTable::new().with_process(
                    StageName::Generate,
                    ProcessTool::new("sh").arg("-c").arg(script),
                ),
                IdempotencyKeyMode::ExactBytes,
            )
        }

        #[tokio::test]
        async fn test_deadline_stops_child() {
            let h = harness();
            let scratch = tempfile::tempdir().unwrap();
            let pid_file = scratch.path().join("pid");
            let runner = sleeper(&h, &pid_file);

            let mut req = request(&h, StageName::Generate, vec![]);
            req.timeout = Duration::from_millis(500);
            let err = runner.run(&req).await.unwrap_err();
            assert!(matches!(err, StageError::Timeout { timeout_ms: 500, .. }));
            assert_exits(&pid_file).await;
        }

        #[tokio::test]
        async fn test_cancellation_stops_child() {
            let h = harness();
            let scratch = tempfile::tempdir().unwrap();
            let pid_file = scratch.path().join("pid");
            let runner = sleeper(&h, &pid_file);

            let req = request(&h, StageName::Generate, vec![]);
            let cancel = req.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                cancel.cancel("user requested");
            });
            let err = runner.run(&req).await.unwrap_err();
            assert_eq!(err.code(), "STAGE-CANCELLED");
            assert_exits(&pid_file).await;
        }
    }
}
