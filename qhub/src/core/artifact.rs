//! Artifact records.

use super::stage::{ArtifactCategory, StageName};
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};

/// One file inside an artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the category directory.
    pub name: String,
    /// SHA-256 of the file content; also the blob key.
    pub digest: String,
    /// Size in bytes.
    pub size_bytes: u64,
}

/// An immutable, versioned output produced by a stage.
///
/// A version holds the whole file set a stage produced for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique artifact id.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Artifact category.
    pub category: ArtifactCategory,
    /// Version within (project, category), starting at 1.
    pub version: u64,
    /// Digest of the exact file set.
    pub digest: String,
    /// Digest of the normalised file set.
    pub semantic_digest: String,
    /// Total size of all files.
    pub size_bytes: u64,
    /// Files in this version.
    pub files: Vec<ArtifactFile>,
    /// Producing stage.
    pub stage: StageName,
    /// Producing run, if produced inside a pipeline run.
    pub run_id: Option<String>,
    /// Producing stage execution.
    pub execution_id: String,
    /// Input key of the producing execution.
    pub input_key: String,
    /// Creation time.
    pub created_at: Timestamp,
}

impl Artifact {
    /// Returns a reference to this exact version.
    #[must_use]
    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            id: self.id.clone(),
            category: self.category.clone(),
            version: self.version,
            digest: self.digest.clone(),
            semantic_digest: self.semantic_digest.clone(),
        }
    }
}

/// A resolved reference to one artifact version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Artifact id.
    pub id: String,
    /// Artifact category.
    pub category: ArtifactCategory,
    /// Version number.
    pub version: u64,
    /// Exact digest.
    pub digest: String,
    /// Normalised digest.
    pub semantic_digest: String,
}
