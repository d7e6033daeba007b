//! Workspace creation for new projects.

use super::templates::{find_template, render, template_ids, ProjectTemplate};
use crate::core::{Project, ProjectMetadata};
use crate::errors::{AlreadyScaffoldedError, HubError, HubResult, UnknownTemplateError};
use crate::events::{names, EventSink};
use crate::storage::{load_json, KvStore};
use crate::utils::{is_valid_id, now_utc};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Directories every project workspace contains.
pub const LAYOUT_DIRS: &[&str] = &[
    "src",
    "tests",
    "ir/base",
    "ir/optimized",
    "ir/mitigated",
    "results/validation",
    "results/security",
    "results/simulation/base",
    "results/simulation/optimized",
    "results/simulation/mitigated",
    "results/analysis/report",
    "results/tests/report",
];

const METADATA_FILE: &str = "project.json";

const GITIGNORE: &str = "\
.qhub/
__pycache__/
*.pyc
.venv/
";

fn project_key(project_id: &str) -> String {
    format!("projects/{project_id}")
}

/// Materializes project workspaces, exactly once per project id.
#[derive(Clone)]
pub struct ProjectScaffolder {
    workspace_root: PathBuf,
    kv: Arc<dyn KvStore>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ProjectScaffolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectScaffolder")
            .field("workspace_root", &self.workspace_root)
            .finish_non_exhaustive()
    }
}

impl ProjectScaffolder {
    /// Creates a scaffolder placing workspaces under `workspace_root`.
    pub fn new(workspace_root: impl Into<PathBuf>, kv: Arc<dyn KvStore>, events: Arc<dyn EventSink>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            kv,
            events,
        }
    }

    /// Root holding every project workspace.
    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Creates the workspace for a new project.
    ///
    /// Fails with `UnknownTemplate` for an unrecognised template and with
    /// `AlreadyScaffolded` if the project id was scaffolded before.
    pub async fn scaffold(&self, metadata: &ProjectMetadata, template_id: &str) -> HubResult<Project> {
        if !is_valid_id(&metadata.id) {
            return Err(HubError::InvalidInput(format!("invalid project id '{}'", metadata.id)));
        }
        let template = find_template(template_id)
            .ok_or_else(|| UnknownTemplateError::new(template_id, template_ids()))?;

        let project = Project {
            id: metadata.id.clone(),
            name: metadata.name.clone(),
            owner: metadata.owner.clone(),
            sdk: metadata.sdk.clone(),
            template: template.id.to_string(),
            workspace_root: self.workspace_root.join(&metadata.id),
            created_at: now_utc(),
        };

        let key = project_key(&project.id);
        if self.kv.get(&key).await?.is_some() {
            return Err(AlreadyScaffoldedError::new(&project.id).into());
        }

        // project.json is the single-winner gate. The record is stored last.
        let record = serde_json::to_vec_pretty(&project)?;
        let root = &project.workspace_root;
        tokio::fs::create_dir_all(root).await?;
        let marker = root.join(METADATA_FILE);
        match write_new(&marker, &record).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(AlreadyScaffoldedError::new(&project.id).into());
            }
            Err(e) => return Err(e.into()),
        }

        let claimed = match write_layout(&project, template).await {
            Ok(()) => self.kv.put_if_absent(&key, record).await.map_err(HubError::from),
            Err(e) => Err(e.into()),
        };
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                release(&marker).await;
                return Err(AlreadyScaffoldedError::new(&project.id).into());
            }
            Err(e) => {
                warn!(project_id = %project.id, error = %e, "Scaffold failed; releasing workspace");
                release(&marker).await;
                return Err(e);
            }
        }

        info!(project_id = %project.id, template = template.id, root = %root.display(), "Project scaffolded");
        self.events.try_emit(
            names::PROJECT_SCAFFOLDED,
            Some(json!({
                "project_id": project.id,
                "template": project.template,
                "sdk": project.sdk,
            })),
        );
        Ok(project)
    }

    /// Returns a scaffolded project.
    pub async fn get_project(&self, project_id: &str) -> HubResult<Project> {
        load_json(self.kv.as_ref(), &project_key(project_id))
            .await?
            .ok_or_else(|| HubError::not_found("project", project_id))
    }

    /// Every scaffolded project, by id.
    pub async fn list_projects(&self) -> HubResult<Vec<Project>> {
        let mut projects = Vec::new();
        for key in self.kv.list_prefix("projects/").await? {
            if let Some(project) = load_json::<Project>(self.kv.as_ref(), &key).await? {
                projects.push(project);
            }
        }
        Ok(projects)
    }
}

async fn write_layout(project: &Project, template: &ProjectTemplate) -> io::Result<()> {
    let root = &project.workspace_root;
    for dir in LAYOUT_DIRS {
        tokio::fs::create_dir_all(root.join(dir)).await?;
    }
    for file in template.files {
        let target = root.join(file.path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, render(file.content, &project.name, &project.sdk)).await?;
    }
    tokio::fs::write(root.join("README.md"), readme(project, template.description)).await?;
    tokio::fs::write(root.join(".gitignore"), GITIGNORE).await
}

async fn release(marker: &Path) {
    if let Err(e) = tokio::fs::remove_file(marker).await {
        warn!(path = %marker.display(), error = %e, "Failed to remove project marker");
    }
}

async fn write_new(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(content).await?;
    file.flush().await
}

fn readme(project: &Project, description: &str) -> String {
    format!(
        "# {name}\n\n{description}.\n\n\
         SDK: `{sdk}`\n\n\
         ## Layout\n\n\
         - `src/`: circuit source\n\
         - `tests/`: project tests\n\
         - `ir/`: intermediate representations (base, optimized, mitigated)\n\
         - `results/`: validation, security, simulation, analysis and test reports\n",
        name = project.name,
        sdk = project.sdk,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::storage::InMemoryKvStore;
    use pretty_assertions::assert_eq;

    fn scaffolder(root: &Path) -> (ProjectScaffolder, Arc<CollectingEventSink>) {
        let events = Arc::new(CollectingEventSink::new());
        let scaffolder = ProjectScaffolder::new(root, Arc::new(InMemoryKvStore::new()), events.clone());
        (scaffolder, events)
    }

    #[tokio::test]
    async fn test_scaffold_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let (scaffolder, events) = scaffolder(dir.path());
        let metadata = ProjectMetadata::new("p1", "Bell").with_sdk("qiskit");

        let project = scaffolder.scaffold(&metadata, "circuit").await.unwrap();
        assert_eq!(project.workspace_root, dir.path().join("p1"));
        for layout in LAYOUT_DIRS {
            assert!(project.workspace_root.join(layout).is_dir(), "missing {layout}");
        }
        for file in ["project.json", "README.md", ".gitignore", "src/main.qasm", "tests/test_main.py"] {
            assert!(project.workspace_root.join(file).is_file(), "missing {file}");
        }
        let qasm = std::fs::read_to_string(project.workspace_root.join("src/main.qasm")).unwrap();
        assert!(qasm.starts_with("// Bell: Bell state"));
        assert_eq!(events.count(names::PROJECT_SCAFFOLDED), 1);

        assert_eq!(scaffolder.get_project("p1").await.unwrap(), project);
        assert_eq!(scaffolder.list_projects().await.unwrap(), vec![project]);
    }

    #[tokio::test]
    async fn test_scaffold_twice_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (scaffolder, _) = scaffolder(dir.path());
        let metadata = ProjectMetadata::new("p1", "Bell");
        scaffolder.scaffold(&metadata, "circuit").await.unwrap();

        let err = scaffolder.scaffold(&metadata, "algorithm").await.unwrap_err();
        assert_eq!(err.code(), "SCAFFOLD-EXISTS");
    }

    #[tokio::test]
    async fn test_concurrent_scaffold_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let (scaffolder, _) = scaffolder(dir.path());
        let attempts = (0..6).map(|_| {
            let scaffolder = scaffolder.clone();
            tokio::spawn(async move {
                scaffolder
                    .scaffold(&ProjectMetadata::new("p1", "Bell"), "circuit")
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;
        let ok = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn test_existing_workspace_is_already_scaffolded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("p1")).unwrap();
        std::fs::write(dir.path().join("p1/project.json"), b"{}").unwrap();
        let (scaffolder, _) = scaffolder(dir.path());
        let err = scaffolder
            .scaffold(&ProjectMetadata::new("p1", "Bell"), "circuit")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCAFFOLD-EXISTS");
        assert_eq!(scaffolder.get_project("p1").await.unwrap_err().code(), "NOT-FOUND");
        assert!(scaffolder.list_projects().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_layout_leaves_no_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("p1")).unwrap();
        // A file where the src/ directory belongs.
        std::fs::write(dir.path().join("p1/src"), b"").unwrap();
        let (scaffolder, events) = scaffolder(dir.path());
        let metadata = ProjectMetadata::new("p1", "Bell");

        let err = scaffolder.scaffold(&metadata, "circuit").await.unwrap_err();
        assert_eq!(err.code(), "IO-FAILURE");
        assert_eq!(scaffolder.get_project("p1").await.unwrap_err().code(), "NOT-FOUND");
        assert!(!dir.path().join("p1/project.json").exists());
        assert_eq!(events.count(names::PROJECT_SCAFFOLDED), 0);

        std::fs::remove_file(dir.path().join("p1/src")).unwrap();
        let project = scaffolder.scaffold(&metadata, "circuit").await.unwrap();
        assert!(project.workspace_root.join("src/main.qasm").is_file());
        assert_eq!(scaffolder.get_project("p1").await.unwrap(), project);
    }

    #[tokio::test]
    async fn test_stored_record_blocks_rescaffold() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(InMemoryKvStore::new());
        let first = ProjectScaffolder::new(dir.path().join("a"), kv.clone(), Arc::new(CollectingEventSink::new()));
        let second = ProjectScaffolder::new(dir.path().join("b"), kv, Arc::new(CollectingEventSink::new()));
        first.scaffold(&ProjectMetadata::new("p1", "Bell"), "circuit").await.unwrap();

        let err = second
            .scaffold(&ProjectMetadata::new("p1", "Bell"), "circuit")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCAFFOLD-EXISTS");
        assert!(!dir.path().join("b/p1").exists());
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let dir = tempfile::tempdir().unwrap();
        let (scaffolder, _) = scaffolder(dir.path());
        let err = scaffolder
            .scaffold(&ProjectMetadata::new("p1", "Bell"), "spreadsheet")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SCAFFOLD-UNKNOWN-TEMPLATE");
        assert!(!dir.path().join("p1").exists());
    }

    #[tokio::test]
    async fn test_invalid_id() {
        let dir = tempfile::tempdir().unwrap();
        let (scaffolder, _) = scaffolder(dir.path());
        let err = scaffolder
            .scaffold(&ProjectMetadata::new("../escape", "x"), "circuit")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID-INPUT");
    }

    #[tokio::test]
    async fn test_missing_project() {
        let dir = tempfile::tempdir().unwrap();
        let (scaffolder, _) = scaffolder(dir.path());
        assert_eq!(scaffolder.get_project("nope").await.unwrap_err().code(), "NOT-FOUND");
    }
}
