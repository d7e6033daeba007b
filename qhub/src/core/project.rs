//! Project records.

use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata supplied by the project-management collaborator at scaffold time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMetadata {
    /// Opaque project id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owner identity.
    #[serde(default)]
    pub owner: Option<String>,
    /// Circuit SDK or language, e.g. `qiskit` or `openqasm`.
    #[serde(default = "default_sdk")]
    pub sdk: String,
}

fn default_sdk() -> String {
    "openqasm".to_string()
}

impl ProjectMetadata {
    /// Creates metadata with the default SDK and no owner.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner: None,
            sdk: default_sdk(),
        }
    }

    /// Sets the owner.
    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Sets the SDK.
    #[must_use]
    pub fn with_sdk(mut self, sdk: impl Into<String>) -> Self {
        self.sdk = sdk.into();
        self
    }
}

/// A scaffolded project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Opaque project id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Owner identity.
    pub owner: Option<String>,
    /// Circuit SDK or language.
    pub sdk: String,
    /// Template used to scaffold the workspace.
    pub template: String,
    /// Absolute path of the project workspace.
    pub workspace_root: PathBuf,
    /// Scaffold time.
    pub created_at: Timestamp,
}
