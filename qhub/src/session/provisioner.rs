//! Provisioning backends for editing environments.

use crate::config::SessionConfig;
use crate::core::{Project, Session};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::fmt::Debug;
use tracing::debug;

/// An environment created by a provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedEnvironment {
    /// Access URL handed to the user.
    pub endpoint: String,
}

/// Creates, probes and destroys editing environments.
///
/// Implementations report failures as plain errors; retry and state
/// tracking belong to the session manager.
#[async_trait]
pub trait SessionProvisioner: Send + Sync + Debug {
    /// Creates an environment for `project`.
    async fn provision(&self, project: &Project, session_id: &str) -> anyhow::Result<ProvisionedEnvironment>;

    /// Probes the environment's liveness endpoint.
    async fn check_health(&self, session: &Session) -> anyhow::Result<()>;

    /// Destroys the environment.
    async fn teardown(&self, session: &Session) -> anyhow::Result<()>;
}

/// Points sessions at a shared OpenVSCode-style server.
///
/// The server is expected to mount the workspace root; each session opens
/// the project folder inside it.
#[derive(Debug, Clone)]
pub struct LocalIdeProvisioner {
    host: String,
    port: u16,
    liveness_path: String,
    workspace_mount: String,
    #[cfg(feature = "http-health")]
    client: reqwest::Client,
}

impl LocalIdeProvisioner {
    /// Creates a provisioner from session settings.
    ///
    /// `workspace_mount` is the workspace root as seen by the IDE server.
    pub fn new(config: &SessionConfig, workspace_mount: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            host: config.ide_host.clone(),
            port: config.ide_port,
            liveness_path: config.liveness_path.clone(),
            workspace_mount: workspace_mount.into().trim_end_matches('/').to_string(),
            #[cfg(feature = "http-health")]
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .context("building health-check client")?,
        })
    }

    /// Endpoint for a project.
    #[must_use]
    pub fn endpoint_for(&self, project_id: &str) -> String {
        format!(
            "http://{}:{}/?folder={}/{project_id}",
            self.host, self.port, self.workspace_mount
        )
    }

    fn liveness_url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.liveness_path)
    }

    #[cfg(feature = "http-health")]
    async fn probe(&self) -> anyhow::Result<()> {
        let url = self.liveness_url();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        if !response.status().is_success() {
            bail!("GET {url} returned {}", response.status());
        }
        Ok(())
    }

    #[cfg(not(feature = "http-health"))]
    async fn probe(&self) -> anyhow::Result<()> {
        tokio::net::TcpStream::connect((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("connecting to {}", self.liveness_url()))?;
        Ok(())
    }
}

#[async_trait]
impl SessionProvisioner for LocalIdeProvisioner {
    async fn provision(&self, project: &Project, session_id: &str) -> anyhow::Result<ProvisionedEnvironment> {
        let is_dir = tokio::fs::metadata(&project.workspace_root)
            .await
            .is_ok_and(|m| m.is_dir());
        if !is_dir {
            bail!(
                "workspace {} does not exist",
                project.workspace_root.display()
            );
        }
        self.probe().await?;
        debug!(project_id = %project.id, session_id, "IDE server reachable");
        Ok(ProvisionedEnvironment {
            endpoint: self.endpoint_for(&project.id),
        })
    }

    async fn check_health(&self, _session: &Session) -> anyhow::Result<()> {
        self.probe().await
    }

    async fn teardown(&self, session: &Session) -> anyhow::Result<()> {
        // The server is shared; there is nothing per-session to stop.
        debug!(session_id = %session.id, "Released IDE session");
        Ok(())
    }
}
