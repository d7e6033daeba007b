//! Ready-made projects, configuration and hubs.

use super::{ScriptedProvisioner, ScriptedTool};
use crate::config::{HubConfig, IdempotencyKeyMode};
use crate::core::{Project, StageName};
use crate::errors::HubResult;
use crate::hub::{QuantumHub, QuantumHubBuilder};
use crate::stages::ToolTable;
use crate::storage::InMemoryKvStore;
use crate::utils::now_utc;
use std::path::Path;
use std::sync::Arc;

/// Token accepted by [`test_config`], authenticating as `tester`.
pub const TEST_TOKEN: &str = "tester:test-token";

/// A project record rooted at `{dir}/{id}`; nothing is written to disk.
#[must_use]
pub fn project_in(dir: &Path, id: &str) -> Project {
    Project {
        id: id.to_string(),
        name: format!("Project {id}"),
        owner: None,
        sdk: "openqasm".to_string(),
        template: "circuit".to_string(),
        workspace_root: dir.join(id),
        created_at: now_utc(),
    }
}

/// Configuration with fast retries and [`TEST_TOKEN`].
#[must_use]
pub fn test_config(dir: &Path) -> HubConfig {
    let mut config = HubConfig::new(dir, IdempotencyKeyMode::ExactBytes).with_auth_token(TEST_TOKEN);
    config.pipeline.retry_initial_delay_ms = 1;
    config.session.initial_delay_ms = 1;
    config
}

/// A tool table binding a succeeding [`ScriptedTool`] to every stage.
#[must_use]
pub fn scripted_tools() -> ToolTable {
    StageName::ALL.iter().fold(ToolTable::new(), |table, stage| {
        table.with_in_process(*stage, Arc::new(ScriptedTool::succeeding(stage.as_str())))
    })
}

/// A builder wired with scripted tools, a scripted provisioner and an
/// in-memory store. The health monitor is off.
pub fn hub_builder(dir: &Path) -> QuantumHubBuilder {
    QuantumHub::builder(test_config(dir))
        .with_kv(Arc::new(InMemoryKvStore::new()))
        .with_tools(scripted_tools())
        .with_provisioner(Arc::new(ScriptedProvisioner::new()))
        .with_health_monitor(false)
}

/// A hub built from [`hub_builder`].
pub async fn scripted_hub(dir: &Path) -> HubResult<QuantumHub> {
    hub_builder(dir).build().await
}
