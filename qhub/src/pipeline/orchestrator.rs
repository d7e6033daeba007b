//! Drives pipeline runs to completion.
//!
//! Each run has one coordinator task. It is the only writer of the run's
//! state: stage tasks report back through their join handles and the
//! coordinator applies every transition, persists the run and publishes a
//! snapshot on a watch channel.

use super::graph::PipelineGraph;
use crate::cancellation::CancellationToken;
use crate::config::PipelineConfig;
use crate::core::{
    ArtifactRef, ExecutionStatus, PipelineRun, Project, RunStatus, StageName,
};
use crate::errors::{FailureReason, HubError, HubResult, StageError};
use crate::events::{names, EventSink};
use crate::stages::{StageOutcome, StageRunRequest, StageRunner};
use crate::storage::{load_json, store_json, KvStore};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn run_key(project_id: &str, run_id: &str) -> String {
    format!("runs/{project_id}/{run_id}")
}

struct ActiveRun {
    run_id: String,
    token: Arc<CancellationToken>,
    updates: watch::Receiver<PipelineRun>,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    runner: Arc<StageRunner>,
    graph: Arc<PipelineGraph>,
    kv: Arc<dyn KvStore>,
    config: PipelineConfig,
    events: Arc<dyn EventSink>,
    active: Mutex<HashMap<String, ActiveRun>>,
}

/// Report from one stage task.
struct StageReport {
    input_key: Option<String>,
    retry_count: u32,
    result: Result<StageOutcome, StageError>,
}

/// Schedules stage executions for pipeline runs.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("stages", &self.inner.graph.topological_order())
            .field("active_runs", &self.inner.active.lock().len())
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        runner: Arc<StageRunner>,
        graph: Arc<PipelineGraph>,
        kv: Arc<dyn KvStore>,
        config: PipelineConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                graph,
                kv,
                config,
                events,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The pipeline graph.
    #[must_use]
    pub fn graph(&self) -> &PipelineGraph {
        &self.inner.graph
    }

    /// Starts a run of `requested` stages (all when empty) and their
    /// transitive dependencies.
    ///
    /// Returns the run as created. Fails with `RunInProgress` if the project
    /// already has an active run.
    pub fn start(&self, project: Arc<Project>, requested: Vec<StageName>) -> HubResult<PipelineRun> {
        let order = self.inner.graph.order_for(&requested)?;
        let run = PipelineRun::new(project.id.clone(), requested, order);

        let mut active = self.inner.active.lock();
        if let Some(existing) = active.get(&project.id) {
            return Err(HubError::RunInProgress {
                project_id: project.id.clone(),
                run_id: existing.run_id.clone(),
            });
        }

        let token = Arc::new(CancellationToken::new());
        let (tx, rx) = watch::channel(run.clone());
        let coordinator = Coordinator {
            inner: self.inner.clone(),
            project: project.clone(),
            run: run.clone(),
            token: token.clone(),
            tx,
        };
        let handle = tokio::spawn(coordinator.drive());
        active.insert(
            project.id.clone(),
            ActiveRun {
                run_id: run.id.clone(),
                token,
                updates: rx,
                handle: Some(handle),
            },
        );
        drop(active);

        info!(project_id = %project.id, run_id = %run.id, stages = ?run.stage_order, "Pipeline run created");
        Ok(run)
    }

    /// Returns the current snapshot of a run.
    pub async fn get_run(&self, project_id: &str, run_id: &str) -> HubResult<PipelineRun> {
        if let Some(snapshot) = self.live_snapshot(project_id, run_id) {
            return Ok(snapshot);
        }
        load_json(self.inner.kv.as_ref(), &run_key(project_id, run_id))
            .await?
            .ok_or_else(|| HubError::not_found("run", run_id))
    }

    /// Lists every run of a project, oldest first.
    pub async fn list_runs(&self, project_id: &str) -> HubResult<Vec<PipelineRun>> {
        let keys = self.inner.kv.list_prefix(&format!("runs/{project_id}/")).await?;
        let mut runs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(run) = load_json::<PipelineRun>(self.inner.kv.as_ref(), &key).await? {
                let run = self.live_snapshot(project_id, &run.id).unwrap_or(run);
                runs.push(run);
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    /// Waits until a run reaches a terminal status.
    pub async fn wait(&self, project_id: &str, run_id: &str) -> HubResult<PipelineRun> {
        let updates = {
            let active = self.inner.active.lock();
            active
                .get(project_id)
                .filter(|a| a.run_id == run_id)
                .map(|a| a.updates.clone())
        };
        if let Some(mut updates) = updates {
            if let Ok(run) = updates.wait_for(|r| r.status.is_terminal()).await {
                return Ok(run.clone());
            }
        }
        self.get_run(project_id, run_id).await
    }

    /// Requests cancellation of a run.
    ///
    /// Stages that have not started become `Cancelled`; running stages are
    /// signalled. Cancelling a finished run is a no-op.
    pub async fn cancel(&self, project_id: &str, run_id: &str, reason: &str) -> HubResult<PipelineRun> {
        let token = {
            let active = self.inner.active.lock();
            active
                .get(project_id)
                .filter(|a| a.run_id == run_id)
                .map(|a| a.token.clone())
        };
        if let Some(token) = token {
            if token.cancel(reason) {
                info!(project_id, run_id, reason, "Pipeline run cancellation requested");
            }
        }
        self.get_run(project_id, run_id).await
    }

    /// Returns the id of the project's active run.
    #[must_use]
    pub fn active_run(&self, project_id: &str) -> Option<String> {
        self.inner.active.lock().get(project_id).map(|a| a.run_id.clone())
    }

    /// Cancels every active run and waits for their coordinators to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut active = self.inner.active.lock();
            active
                .values_mut()
                .filter_map(|a| {
                    a.token.cancel("hub shutting down");
                    a.handle.take()
                })
                .collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Pipeline coordinator ended abnormally");
            }
        }
    }

    fn live_snapshot(&self, project_id: &str, run_id: &str) -> Option<PipelineRun> {
        let active = self.inner.active.lock();
        active
            .get(project_id)
            .filter(|a| a.run_id == run_id)
            .map(|a| a.updates.borrow().clone())
    }
}

struct Coordinator {
    inner: Arc<Inner>,
    project: Arc<Project>,
    run: PipelineRun,
    token: Arc<CancellationToken>,
    tx: watch::Sender<PipelineRun>,
}

impl Coordinator {
    async fn drive(mut self) {
        self.publish().await;
        if let Err(e) = self.run.set_status(RunStatus::Running) {
            warn!(run_id = %self.run.id, error = %e, "Cannot start run");
        }
        self.run.append_log(format!("started stages {:?}", self.run.stage_order));
        self.publish().await;
        self.emit(names::PIPELINE_STARTED, json!({ "stages": self.run.stage_order }));

        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrent_stages.max(1)));
        let mut tasks = FuturesUnordered::new();
        let mut cancel_handled = false;

        loop {
            if self.token.is_cancelled() && !cancel_handled {
                cancel_handled = true;
                self.cancel_pending();
                self.publish().await;
            }

            if !self.token.is_cancelled() {
                while let Some(stage) = self.next_eligible() {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let Some(handle) = self.schedule(stage, permit) else {
                        continue;
                    };
                    tasks.push(handle.map(move |joined| (stage, joined)));
                    self.publish().await;
                }
            }

            if tasks.is_empty() {
                break;
            }

            let token = self.token.clone();
            let finished = tokio::select! {
                () = token.cancelled(), if !cancel_handled => None,
                Some(next) = tasks.next() => Some(next),
            };
            if let Some((stage, joined)) = finished {
                let report = joined.unwrap_or_else(|e| StageReport {
                    input_key: None,
                    retry_count: 0,
                    result: Err(StageError::infrastructure(stage, format!("stage task panicked: {e}"))),
                });
                self.apply(stage, report);
                self.publish().await;
            }
        }

        self.finish().await;
        let mut active = self.inner.active.lock();
        if active.get(&self.run.project_id).is_some_and(|a| a.run_id == self.run.id) {
            active.remove(&self.run.project_id);
        }
    }

    /// First pending stage whose dependencies all completed successfully.
    fn next_eligible(&self) -> Option<StageName> {
        self.run.stage_order.iter().copied().find(|&stage| {
            self.run
                .execution(stage)
                .is_some_and(|e| e.status == ExecutionStatus::Pending)
                && self.inner.graph.dependencies_of(stage).iter().all(|dep| {
                    self.run.execution(*dep).is_some_and(|e| e.status.is_success())
                })
        })
    }

    fn resolve_inputs(&self, stage: StageName) -> Result<Vec<ArtifactRef>, StageError> {
        let definition = self
            .inner
            .graph
            .definition(stage)
            .ok_or_else(|| StageError::infrastructure(stage, "stage is not declared"))?;
        definition
            .inputs
            .iter()
            .map(|category| {
                self.run
                    .executions
                    .iter()
                    .flat_map(|e| e.outputs.iter())
                    .find(|o| &o.category == category)
                    .cloned()
                    .ok_or_else(|| {
                        StageError::infrastructure(stage, format!("no artifact for input '{category}'"))
                    })
            })
            .collect()
    }

    fn schedule(
        &mut self,
        stage: StageName,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Option<JoinHandle<StageReport>> {
        let inputs = match self.resolve_inputs(stage) {
            Ok(inputs) => inputs,
            Err(err) => {
                self.transition(stage, ExecutionStatus::Running);
                self.apply(
                    stage,
                    StageReport {
                        input_key: None,
                        retry_count: 0,
                        result: Err(err),
                    },
                );
                return None;
            }
        };
        let definition = self.inner.graph.definition(stage)?.clone();

        self.transition(stage, ExecutionStatus::Running);
        let execution = self.run.execution_mut(stage)?;
        execution.inputs.clone_from(&inputs);
        let execution_id = execution.id.clone();
        self.run.append_log(format!("{stage} started"));
        self.emit(
            names::STAGE_STARTED,
            json!({ "stage": stage, "execution_id": execution_id, "inputs": inputs }),
        );

        let request = StageRunRequest {
            project: self.project.clone(),
            definition,
            inputs,
            run_id: Some(self.run.id.clone()),
            execution_id,
            timeout: self.inner.config.stage_timeout(stage),
            cancel: self.token.clone(),
        };
        let inner = self.inner.clone();
        let run_id = self.run.id.clone();

        Some(tokio::spawn(async move {
            let _permit = permit;
            run_stage(inner, run_id, request).await
        }))
    }

    fn apply(&mut self, stage: StageName, report: StageReport) {
        if let Some(execution) = self.run.execution_mut(stage) {
            execution.retry_count = report.retry_count;
            execution.input_key.clone_from(&report.input_key);
        }

        match report.result {
            Ok(outcome) => {
                let status = if outcome.cache_hit {
                    ExecutionStatus::Skipped
                } else {
                    ExecutionStatus::Succeeded
                };
                if let Some(execution) = self.run.execution_mut(stage) {
                    execution.outputs.clone_from(&outcome.outputs);
                }
                self.transition(stage, status);
                self.run.append_log(format!("{stage} {status}"));
                let event = if outcome.cache_hit {
                    names::STAGE_SKIPPED
                } else {
                    names::STAGE_COMPLETED
                };
                self.emit(event, json!({ "stage": stage, "outputs": outcome.outputs }));
            }
            Err(StageError::Cancelled { reason, .. }) => {
                self.end_cancelled(stage, FailureReason::run_cancelled(stage, &reason));
            }
            Err(err) => {
                let failure = err.failure_reason();
                if let Some(execution) = self.run.execution_mut(stage) {
                    execution.failure = Some(failure.clone());
                }
                self.transition(stage, ExecutionStatus::Failed);
                if self.run.failed_stage.is_none() {
                    self.run.failed_stage = Some(stage);
                }
                self.run.append_log(format!("{stage} failed: {err}"));
                warn!(run_id = %self.run.id, stage = %stage, code = err.code(), error = %err, "Stage failed");
                self.emit(names::STAGE_FAILED, json!({ "stage": stage, "failure": failure }));

                for dependent in self.inner.graph.dependents_of(stage) {
                    let pending = self
                        .run
                        .execution(dependent)
                        .is_some_and(|e| e.status == ExecutionStatus::Pending);
                    if pending {
                        self.end_cancelled(dependent, FailureReason::upstream_failed(dependent, stage));
                    }
                }
            }
        }
    }

    fn cancel_pending(&mut self) {
        let reason = self.token.reason().unwrap_or_default();
        let pending: Vec<StageName> = self
            .run
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .map(|e| e.stage)
            .collect();
        for stage in pending {
            self.end_cancelled(stage, FailureReason::run_cancelled(stage, &reason));
        }
    }

    fn end_cancelled(&mut self, stage: StageName, failure: FailureReason) {
        if let Some(execution) = self.run.execution_mut(stage) {
            execution.failure = Some(failure.clone());
        }
        self.transition(stage, ExecutionStatus::Cancelled);
        self.run.append_log(format!("{stage} cancelled: {}", failure.message));
        self.emit(names::STAGE_CANCELLED, json!({ "stage": stage, "failure": failure }));
    }

    fn transition(&mut self, stage: StageName, status: ExecutionStatus) {
        if let Some(execution) = self.run.execution_mut(stage) {
            if let Err(e) = execution.transition(status) {
                warn!(run_id = %self.run.id, error = %e, "Rejected stage transition");
            }
        }
    }

    async fn finish(&mut self) {
        // Stages left pending lost a dependency to cancellation.
        let reason = self
            .token
            .reason()
            .unwrap_or_else(|| "dependency did not complete".to_string());
        let leftover: Vec<StageName> = self
            .run
            .executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::Pending)
            .map(|e| e.stage)
            .collect();
        for stage in leftover {
            self.end_cancelled(stage, FailureReason::run_cancelled(stage, &reason));
        }

        let any_cancelled = self
            .run
            .executions
            .iter()
            .any(|e| e.status == ExecutionStatus::Cancelled);
        let (status, event) = if self.run.failed_stage.is_some() {
            (RunStatus::Failed, names::PIPELINE_FAILED)
        } else if any_cancelled || self.token.is_cancelled() {
            (RunStatus::Cancelled, names::PIPELINE_CANCELLED)
        } else {
            (RunStatus::Succeeded, names::PIPELINE_COMPLETED)
        };

        if let Err(e) = self.run.set_status(status) {
            warn!(run_id = %self.run.id, error = %e, "Cannot finish run");
        }
        self.run.append_log(format!("run {status}"));
        self.publish().await;
        info!(
            project_id = %self.run.project_id,
            run_id = %self.run.id,
            status = %status,
            failed_stage = ?self.run.failed_stage,
            "Pipeline run finished"
        );
        self.emit(
            event,
            json!({ "status": status, "failed_stage": self.run.failed_stage }),
        );
    }

    async fn publish(&self) {
        self.tx.send_replace(self.run.clone());
        let key = run_key(&self.run.project_id, &self.run.id);
        if let Err(e) = store_json(self.inner.kv.as_ref(), &key, &self.run).await {
            warn!(run_id = %self.run.id, error = %e, "Failed to persist run");
        }
    }

    fn emit(&self, event_type: &str, mut data: serde_json::Value) {
        if let Some(map) = data.as_object_mut() {
            map.insert("project_id".to_string(), json!(self.run.project_id));
            map.insert("run_id".to_string(), json!(self.run.id));
        }
        self.inner.events.try_emit(event_type, Some(data));
    }
}

/// Runs one stage with the transient-failure retry policy.
async fn run_stage(inner: Arc<Inner>, run_id: String, request: StageRunRequest) -> StageReport {
    let stage = request.definition.name;
    let input_key = match inner.runner.input_key(&request).await {
        Ok(key) => key,
        Err(err) => {
            return StageReport {
                input_key: None,
                retry_count: 0,
                result: Err(err),
            }
        }
    };

    let runner = inner.runner.as_ref();
    let events = inner.events.as_ref();
    let (req, key) = (&request, input_key.as_str());
    let outcome = inner
        .config
        .retry_policy()
        .execute_cancellable(
            &format!("{run_id}/{stage}"),
            &request.cancel,
            StageError::is_transient,
            |attempt| {
                if attempt > 0 {
                    events.try_emit(
                        names::STAGE_RETRYING,
                        Some(json!({
                            "project_id": req.project.id,
                            "run_id": run_id,
                            "stage": stage,
                            "attempt": attempt + 1,
                        })),
                    );
                }
                runner.run_keyed(req, key)
            },
        )
        .await;

    StageReport {
        input_key: Some(input_key),
        retry_count: outcome.attempts.saturating_sub(1),
        result: outcome.result,
    }
}
