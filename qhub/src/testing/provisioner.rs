//! Scripted session provisioner.

use crate::core::{Project, Session};
use crate::session::{ProvisionedEnvironment, SessionProvisioner};
use anyhow::bail;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

/// A provisioner that hands out fake endpoints.
#[derive(Debug)]
pub struct ScriptedProvisioner {
    failures: u32,
    delay: Option<Duration>,
    healthy: AtomicBool,
    provision_calls: AtomicU32,
    teardown_calls: AtomicU32,
}

impl Default for ScriptedProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvisioner {
    /// A healthy provisioner that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            failures: 0,
            delay: None,
            healthy: AtomicBool::new(true),
            provision_calls: AtomicU32::new(0),
            teardown_calls: AtomicU32::new(0),
        }
    }

    /// Fails the first `n` provisioning attempts.
    #[must_use]
    pub fn failing_first(mut self, n: u32) -> Self {
        self.failures = n;
        self
    }

    /// Sleeps before every provisioning attempt.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the outcome of later health probes.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Provisioning attempts so far.
    #[must_use]
    pub fn provision_calls(&self) -> u32 {
        self.provision_calls.load(Ordering::SeqCst)
    }

    /// Teardowns so far.
    #[must_use]
    pub fn teardown_calls(&self) -> u32 {
        self.teardown_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvisioner for ScriptedProvisioner {
    async fn provision(&self, project: &Project, session_id: &str) -> anyhow::Result<ProvisionedEnvironment> {
        let attempt = self.provision_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if attempt <= self.failures {
            bail!("environment for {} refused to start (attempt {attempt})", project.id);
        }
        Ok(ProvisionedEnvironment {
            endpoint: format!("http://scripted.local/{}/{session_id}", project.id),
        })
    }

    async fn check_health(&self, session: &Session) -> anyhow::Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            bail!("session {} is not responding", session.id)
        }
    }

    async fn teardown(&self, _session: &Session) -> anyhow::Result<()> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
