//! Artifact store over a [`KvStore`].
//!
//! File contents live under `blobs/{sha256}` and are stored once per
//! distinct content. Artifact records are write-once: every `put` allocates
//! a new version, so re-running a stage never overwrites an earlier output.

use crate::core::{Artifact, ArtifactCategory, ArtifactFile, ArtifactRef, StageName};
use crate::errors::{ConfigurationError, HubError, HubResult};
use crate::storage::{load_json, KvStore};
use crate::utils::{normalize_semantic, now_utc, prefixed_id, sha256_hex, KeyHasher, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::debug;

/// Output files of one stage for one category, not yet stored.
#[derive(Debug, Clone)]
pub struct ArtifactDraft {
    /// Owning project.
    pub project_id: String,
    /// Target category.
    pub category: ArtifactCategory,
    /// Producing stage.
    pub stage: StageName,
    /// Producing run.
    pub run_id: Option<String>,
    /// Producing execution.
    pub execution_id: String,
    /// Input key of the producing execution.
    pub input_key: String,
    /// Files keyed by relative path.
    pub files: BTreeMap<String, Vec<u8>>,
}

/// The outputs one execution recorded for one input key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSet {
    /// Producing execution.
    pub execution_id: String,
    /// Producing run.
    pub run_id: Option<String>,
    /// The stage.
    pub stage: StageName,
    /// Input key the outputs were produced for.
    pub input_key: String,
    /// Output artifact versions.
    pub outputs: Vec<ArtifactRef>,
    /// When the set was recorded.
    pub recorded_at: Timestamp,
}

/// Versioned artifact persistence.
pub struct ArtifactStore {
    kv: Arc<dyn KvStore>,
    categories: HashSet<ArtifactCategory>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("categories", &self.categories.len())
            .finish_non_exhaustive()
    }
}

fn artifact_prefix(project_id: &str, category: &ArtifactCategory) -> String {
    format!("artifacts/{project_id}/{category}/")
}

fn artifact_key(project_id: &str, category: &ArtifactCategory, version: u64) -> String {
    format!("artifacts/{project_id}/{category}/{version:020}")
}

fn output_set_prefix(project_id: &str, stage: StageName, input_key: &str) -> String {
    format!("outputs/{project_id}/{stage}/{input_key}/")
}

fn blob_key(digest: &str) -> String {
    format!("blobs/{digest}")
}

/// Checks that a file name is a relative path without `..` or root parts.
fn validate_file_name(name: &str) -> HubResult<()> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(HubError::InvalidInput(format!("invalid artifact file name '{name}'")))
    }
}

impl ArtifactStore {
    /// Creates a store accepting only `categories`.
    pub fn new(kv: Arc<dyn KvStore>, categories: impl IntoIterator<Item = ArtifactCategory>) -> Self {
        Self {
            kv,
            categories: categories.into_iter().collect(),
        }
    }

    /// Returns true if `category` is produced by some stage.
    #[must_use]
    pub fn accepts(&self, category: &ArtifactCategory) -> bool {
        self.categories.contains(category)
    }

    /// Stores a draft as a new artifact version.
    pub async fn put(&self, draft: ArtifactDraft) -> HubResult<Artifact> {
        if !self.accepts(&draft.category) {
            return Err(ConfigurationError::new(format!(
                "artifact category '{}' is not produced by any stage",
                draft.category
            ))
            .with_code("CONFIG-UNKNOWN-CATEGORY")
            .into());
        }
        if draft.files.is_empty() {
            return Err(HubError::InvalidInput(format!(
                "artifact for category '{}' has no files",
                draft.category
            )));
        }

        let mut files = Vec::with_capacity(draft.files.len());
        let mut exact = KeyHasher::new();
        let mut semantic = KeyHasher::new();
        let mut size_bytes = 0u64;
        for (name, content) in &draft.files {
            validate_file_name(name)?;
            let digest = sha256_hex(content);
            self.kv
                .put_if_absent(&blob_key(&digest), content.clone())
                .await?;
            exact.part(name).part(&digest);
            semantic.part(name).part(sha256_hex(&normalize_semantic(name, content)));
            let size = content.len() as u64;
            size_bytes += size;
            files.push(ArtifactFile {
                name: name.clone(),
                digest,
                size_bytes: size,
            });
        }

        let mut artifact = Artifact {
            id: prefixed_id("art"),
            project_id: draft.project_id,
            category: draft.category,
            version: 0,
            digest: exact.finish(),
            semantic_digest: semantic.finish(),
            size_bytes,
            files,
            stage: draft.stage,
            run_id: draft.run_id,
            execution_id: draft.execution_id,
            input_key: draft.input_key,
            created_at: now_utc(),
        };

        // Claim the next free version; a concurrent writer that wins a slot
        // pushes us to the following one.
        let mut version = self.max_version(&artifact.project_id, &artifact.category).await? + 1;
        loop {
            artifact.version = version;
            let key = artifact_key(&artifact.project_id, &artifact.category, version);
            if self
                .kv
                .put_if_absent(&key, serde_json::to_vec(&artifact)?)
                .await?
            {
                break;
            }
            version += 1;
        }

        debug!(
            project_id = %artifact.project_id,
            category = %artifact.category,
            version = artifact.version,
            stage = %artifact.stage,
            "Stored artifact"
        );
        Ok(artifact)
    }

    async fn versions(&self, project_id: &str, category: &ArtifactCategory) -> HubResult<Vec<u64>> {
        let prefix = artifact_prefix(project_id, category);
        let keys = self.kv.list_prefix(&prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rest| rest.parse::<u64>().ok())
            .collect())
    }

    async fn max_version(&self, project_id: &str, category: &ArtifactCategory) -> HubResult<u64> {
        Ok(self
            .versions(project_id, category)
            .await?
            .into_iter()
            .max()
            .unwrap_or(0))
    }

    /// Returns one artifact version.
    pub async fn get(
        &self,
        project_id: &str,
        category: &ArtifactCategory,
        version: u64,
    ) -> HubResult<Option<Artifact>> {
        load_json(self.kv.as_ref(), &artifact_key(project_id, category, version)).await
    }

    /// Returns the newest version of a category.
    pub async fn latest(
        &self,
        project_id: &str,
        category: &ArtifactCategory,
    ) -> HubResult<Option<Artifact>> {
        match self.max_version(project_id, category).await? {
            0 => Ok(None),
            version => self.get(project_id, category, version).await,
        }
    }

    /// Lists artifacts of a project, optionally limited to one category.
    ///
    /// Results are ordered by category, then version.
    pub async fn list(
        &self,
        project_id: &str,
        category: Option<&ArtifactCategory>,
    ) -> HubResult<Vec<Artifact>> {
        let prefix = match category {
            Some(category) => artifact_prefix(project_id, category),
            None => format!("artifacts/{project_id}/"),
        };
        let mut artifacts = Vec::new();
        for key in self.kv.list_prefix(&prefix).await? {
            if let Some(artifact) = load_json::<Artifact>(self.kv.as_ref(), &key).await? {
                // A category prefix also matches nested categories.
                if category.map_or(true, |c| &artifact.category == c) {
                    artifacts.push(artifact);
                }
            }
        }
        artifacts.sort_by(|a, b| (&a.category, a.version).cmp(&(&b.category, b.version)));
        Ok(artifacts)
    }

    /// Resolves a reference back to its artifact.
    pub async fn resolve(&self, project_id: &str, reference: &ArtifactRef) -> HubResult<Artifact> {
        self.get(project_id, &reference.category, reference.version)
            .await?
            .ok_or_else(|| {
                HubError::not_found("artifact", format!("{}@v{}", reference.category, reference.version))
            })
    }

    /// Reads the content of one artifact file.
    pub async fn read_content(&self, file: &ArtifactFile) -> HubResult<Vec<u8>> {
        self.kv
            .get(&blob_key(&file.digest))
            .await?
            .ok_or_else(|| HubError::not_found("blob", file.digest.clone()))
    }

    /// Writes every file of `artifact` under `{dir}/{file}`.
    pub async fn write_files(&self, artifact: &Artifact, dir: &Path) -> HubResult<()> {
        for file in &artifact.files {
            let target = dir.join(&file.name);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, self.read_content(file).await?).await?;
        }
        Ok(())
    }

    /// Copies an artifact into the project workspace at
    /// `{workspace}/{category}/v{version}/`.
    pub async fn materialize(&self, artifact: &Artifact, workspace: &Path) -> HubResult<()> {
        let mut dir = workspace.to_path_buf();
        for segment in artifact.category.as_str().split('/') {
            dir.push(segment);
        }
        dir.push(format!("v{}", artifact.version));
        self.write_files(artifact, &dir).await
    }

    /// Records the outputs an execution produced for an input key.
    pub async fn record_output_set(&self, project_id: &str, set: &OutputSet) -> HubResult<()> {
        let key = format!(
            "{}{}",
            output_set_prefix(project_id, set.stage, &set.input_key),
            set.execution_id
        );
        self.kv.put(&key, serde_json::to_vec(set)?).await?;
        Ok(())
    }

    /// Returns every output set recorded for `(stage, input_key)`, newest last.
    pub async fn outputs_for(
        &self,
        project_id: &str,
        stage: StageName,
        input_key: &str,
    ) -> HubResult<Vec<OutputSet>> {
        let mut sets = Vec::new();
        for key in self
            .kv
            .list_prefix(&output_set_prefix(project_id, stage, input_key))
            .await?
        {
            if let Some(set) = load_json::<OutputSet>(self.kv.as_ref(), &key).await? {
                sets.push(set);
            }
        }
        sets.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(sets)
    }
}
