//! Service facade wiring every component.
//!
//! [`QuantumHub`] is what the HTTP layer talks to. Every method takes the
//! caller's token and rejects the call with `Unauthorized` before touching
//! any component.

use crate::artifacts::ArtifactStore;
use crate::auth::{Authenticator, CallerIdentity, StaticTokenAuthenticator};
use crate::config::HubConfig;
use crate::core::{Artifact, ArtifactCategory, PipelineRun, Project, ProjectMetadata, Session, StageName};
use crate::errors::{ConfigurationError, HubError, HubResult};
use crate::events::{EventSink, LoggingEventSink};
use crate::pipeline::{PipelineGraph, PipelineOrchestrator};
use crate::scaffold::ProjectScaffolder;
use crate::session::{LocalIdeProvisioner, SessionManager, SessionProvisioner, SessionRegistry};
use crate::stages::{StageRunner, ToolTable};
use crate::storage::{FsKvStore, KvStore};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Directory under the workspace root holding the bundled file store.
pub const STORE_DIR: &str = ".qhub-store";

/// Builds a [`QuantumHub`], with every collaborator replaceable.
#[must_use = "call build() to create the hub"]
pub struct QuantumHubBuilder {
    config: HubConfig,
    kv: Option<Arc<dyn KvStore>>,
    graph: Option<PipelineGraph>,
    tools: Option<ToolTable>,
    provisioner: Option<Arc<dyn SessionProvisioner>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    events: Option<Arc<dyn EventSink>>,
    health_monitor: bool,
}

impl QuantumHubBuilder {
    /// Starts a builder from configuration.
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            kv: None,
            graph: None,
            tools: None,
            provisioner: None,
            authenticator: None,
            events: None,
            health_monitor: true,
        }
    }

    /// Uses `kv` instead of the file store under the workspace root.
    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Uses `graph` instead of the standard pipeline.
    pub fn with_graph(mut self, graph: PipelineGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Uses `tools` instead of the configured process tools.
    pub fn with_tools(mut self, tools: ToolTable) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Uses `provisioner` instead of the local IDE server.
    pub fn with_provisioner(mut self, provisioner: Arc<dyn SessionProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Uses `authenticator` instead of the configured static tokens.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Sends lifecycle events to `events`.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Enables or disables the background session health monitor.
    pub fn with_health_monitor(mut self, enabled: bool) -> Self {
        self.health_monitor = enabled;
        self
    }

    /// Wires the components.
    pub async fn build(self) -> HubResult<QuantumHub> {
        let config = self.config;
        config.validate()?;

        let kv: Arc<dyn KvStore> = match self.kv {
            Some(kv) => kv,
            None => Arc::new(FsKvStore::open(config.workspace_root.join(STORE_DIR)).await?),
        };
        let graph = Arc::new(self.graph.unwrap_or_else(PipelineGraph::standard));
        let tools = self.tools.unwrap_or_else(|| ToolTable::from_config(&config.tools));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(LoggingEventSink::default()));
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(StaticTokenAuthenticator::new(&config.auth_tokens)));
        let provisioner: Arc<dyn SessionProvisioner> = match self.provisioner {
            Some(provisioner) => provisioner,
            None => Arc::new(
                LocalIdeProvisioner::new(&config.session, config.workspace_root.display().to_string())
                    .map_err(|e| ConfigurationError::new(format!("session provisioner: {e:#}")))?,
            ),
        };

        for stage in graph.topological_order() {
            if tools.get(stage).is_none() {
                debug!(stage = %stage, "No tool bound; runs including this stage will fail");
            }
        }

        let artifacts = Arc::new(ArtifactStore::new(kv.clone(), graph.output_categories()));
        let runner = Arc::new(StageRunner::new(
            artifacts.clone(),
            tools,
            config.pipeline.idempotency_key_mode,
        ));
        let orchestrator = PipelineOrchestrator::new(
            runner,
            graph,
            kv.clone(),
            config.pipeline.clone(),
            events.clone(),
        );
        let registry = Arc::new(SessionRegistry::load(kv.clone()).await?);
        let sessions = SessionManager::new(provisioner, registry, config.session.clone(), events.clone());
        let monitor = self.health_monitor.then(|| sessions.spawn_health_monitor());
        let scaffolder = ProjectScaffolder::new(config.workspace_root.clone(), kv, events);

        info!(
            workspace_root = %config.workspace_root.display(),
            idempotency = %config.pipeline.idempotency_key_mode,
            "Quantum hub ready"
        );
        Ok(QuantumHub {
            config,
            authenticator,
            scaffolder,
            artifacts,
            orchestrator,
            sessions,
            monitor: Mutex::new(monitor),
        })
    }
}

/// The orchestration core behind the platform API.
pub struct QuantumHub {
    config: HubConfig,
    authenticator: Arc<dyn Authenticator>,
    scaffolder: ProjectScaffolder,
    artifacts: Arc<ArtifactStore>,
    orchestrator: PipelineOrchestrator,
    sessions: SessionManager,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for QuantumHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantumHub")
            .field("workspace_root", &self.config.workspace_root)
            .field("orchestrator", &self.orchestrator)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl QuantumHub {
    /// Starts a builder.
    pub fn builder(config: HubConfig) -> QuantumHubBuilder {
        QuantumHubBuilder::new(config)
    }

    /// Builds a hub with the bundled file store, process tools, local IDE
    /// provisioner and static-token authenticator.
    pub async fn from_config(config: HubConfig) -> HubResult<Self> {
        Self::builder(config).build().await
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The pipeline orchestrator.
    #[must_use]
    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    /// The session manager.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// The artifact store.
    #[must_use]
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Resolves the caller behind `token`.
    pub async fn authenticate(&self, token: &str) -> HubResult<CallerIdentity> {
        Ok(self.authenticator.authenticate(token).await?)
    }

    /// Creates a project workspace from a template.
    ///
    /// The caller becomes the owner unless the metadata names one.
    pub async fn scaffold_project(
        &self,
        token: &str,
        mut metadata: ProjectMetadata,
        template: &str,
    ) -> HubResult<Project> {
        let caller = self.authenticate(token).await?;
        if metadata.owner.is_none() {
            metadata.owner = Some(caller.subject);
        }
        self.scaffolder.scaffold(&metadata, template).await
    }

    /// Returns a project.
    pub async fn get_project(&self, token: &str, project_id: &str) -> HubResult<Project> {
        self.authenticate(token).await?;
        self.scaffolder.get_project(project_id).await
    }

    /// Lists every project.
    pub async fn list_projects(&self, token: &str) -> HubResult<Vec<Project>> {
        self.authenticate(token).await?;
        self.scaffolder.list_projects().await
    }

    /// Starts a pipeline run. An empty `stages` list runs every stage.
    pub async fn start_run(
        &self,
        token: &str,
        project_id: &str,
        stages: Vec<StageName>,
    ) -> HubResult<PipelineRun> {
        let caller = self.authenticate(token).await?;
        let project = Arc::new(self.scaffolder.get_project(project_id).await?);
        let run = self.orchestrator.start(project, stages)?;
        info!(project_id, run_id = %run.id, caller = %caller.subject, "Run requested");
        Ok(run)
    }

    /// Returns the current snapshot of a run.
    pub async fn get_run(&self, token: &str, project_id: &str, run_id: &str) -> HubResult<PipelineRun> {
        self.authenticate(token).await?;
        self.orchestrator.get_run(project_id, run_id).await
    }

    /// Lists every run of a project.
    pub async fn list_runs(&self, token: &str, project_id: &str) -> HubResult<Vec<PipelineRun>> {
        self.authenticate(token).await?;
        self.scaffolder.get_project(project_id).await?;
        self.orchestrator.list_runs(project_id).await
    }

    /// Waits until a run reaches a terminal status.
    pub async fn wait_run(&self, token: &str, project_id: &str, run_id: &str) -> HubResult<PipelineRun> {
        self.authenticate(token).await?;
        self.orchestrator.wait(project_id, run_id).await
    }

    /// Cancels a run.
    pub async fn cancel_run(&self, token: &str, project_id: &str, run_id: &str) -> HubResult<PipelineRun> {
        let caller = self.authenticate(token).await?;
        let reason = format!("cancelled by {}", caller.subject);
        self.orchestrator.cancel(project_id, run_id, &reason).await
    }

    /// Opens, or returns, the project's editing session.
    pub async fn open_session(&self, token: &str, project_id: &str) -> HubResult<Session> {
        self.authenticate(token).await?;
        let project = Arc::new(self.scaffolder.get_project(project_id).await?);
        self.sessions.open(project).await
    }

    /// Returns a session.
    pub async fn get_session(&self, token: &str, project_id: &str, session_id: &str) -> HubResult<Session> {
        self.authenticate(token).await?;
        self.sessions.get(project_id, session_id).await
    }

    /// Lists every session of a project.
    pub async fn list_sessions(&self, token: &str, project_id: &str) -> HubResult<Vec<Session>> {
        self.authenticate(token).await?;
        self.sessions.list(project_id).await
    }

    /// Closes a session.
    pub async fn close_session(&self, token: &str, project_id: &str, session_id: &str) -> HubResult<Session> {
        self.authenticate(token).await?;
        self.sessions.close(project_id, session_id).await
    }

    /// Lists a project's artifacts, optionally for one category.
    pub async fn list_artifacts(
        &self,
        token: &str,
        project_id: &str,
        category: Option<&str>,
    ) -> HubResult<Vec<Artifact>> {
        self.authenticate(token).await?;
        self.scaffolder.get_project(project_id).await?;
        let category = category
            .map(ArtifactCategory::new)
            .transpose()
            .map_err(HubError::InvalidInput)?;
        self.artifacts.list(project_id, category.as_ref()).await
    }

    /// Cancels active runs, closes every session and stops the health
    /// monitor.
    pub async fn shutdown(&self) {
        info!("Quantum hub shutting down");
        self.orchestrator.shutdown().await;
        self.sessions.shutdown().await;
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
    }
}
