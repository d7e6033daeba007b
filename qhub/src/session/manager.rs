//! Session lifecycle: open, health, close.

use super::provisioner::SessionProvisioner;
use super::registry::SessionRegistry;
use crate::cancellation::CancellationToken;
use crate::config::SessionConfig;
use crate::core::{Project, Session, SessionStatus};
use crate::errors::{FailureReason, HubError, HubResult, ProvisioningError};
use crate::events::{names, EventSink};
use crate::utils::{now_utc, prefixed_id, timestamps::add_duration};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type InFlight = Shared<BoxFuture<'static, Result<Session, ProvisioningError>>>;

struct Inner {
    provisioner: Arc<dyn SessionProvisioner>,
    registry: Arc<SessionRegistry>,
    config: SessionConfig,
    events: Arc<dyn EventSink>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    shutdown: CancellationToken,
}

/// Provisions and tracks one editing environment per project.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("provisioner", &self.inner.provisioner)
            .field("open_sessions", &self.inner.registry.len())
            .field("in_flight", &self.inner.in_flight.lock().len())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager over `registry`.
    pub fn new(
        provisioner: Arc<dyn SessionProvisioner>,
        registry: Arc<SessionRegistry>,
        config: SessionConfig,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provisioner,
                registry,
                config,
                events,
                in_flight: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The session registry.
    #[must_use]
    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Returns the project's Ready session, provisioning one if needed.
    ///
    /// Concurrent calls for the same project share one provisioning attempt
    /// and receive the same session. Degraded or expired sessions are closed
    /// and replaced.
    pub async fn open(&self, project: Arc<Project>) -> HubResult<Session> {
        let attempt = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(existing) = in_flight.get(&project.id) {
                debug!(project_id = %project.id, "Joining in-flight provisioning");
                existing.clone()
            } else {
                let current = self.inner.registry.current(&project.id);
                if let Some(session) = current.as_ref().filter(|s| s.is_usable(now_utc())) {
                    return Ok(session.clone());
                }
                let inner = self.inner.clone();
                let project_id = project.id.clone();
                let task = tokio::spawn(provision(inner, project.clone(), current));
                let shared = async move {
                    task.await.unwrap_or_else(|e| {
                        Err(ProvisioningError::new(project_id, 0, format!("provisioning task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                in_flight.insert(project.id.clone(), shared.clone());
                shared
            }
        };
        Ok(attempt.await?)
    }

    /// Probes a session and updates its health.
    ///
    /// Only Ready sessions are probed. Reaching the failure threshold moves
    /// the session to Degraded; a success resets the failure count.
    pub async fn health_check(&self, project_id: &str, session_id: &str) -> HubResult<SessionStatus> {
        let session = self.get(project_id, session_id).await?;
        if session.status != SessionStatus::Ready {
            return Ok(session.status);
        }

        let probe = self.inner.provisioner.check_health(&session).await;
        let threshold = self.inner.config.health_failure_threshold;
        let mut degraded = false;
        let updated = self
            .inner
            .registry
            .update(session_id, |s| {
                if s.status != SessionStatus::Ready {
                    return false;
                }
                s.last_health_check = Some(now_utc());
                match &probe {
                    Ok(()) => s.consecutive_health_failures = 0,
                    Err(e) => {
                        s.consecutive_health_failures += 1;
                        if s.consecutive_health_failures >= threshold {
                            s.status = SessionStatus::Degraded;
                            s.failure = Some(FailureReason::new(
                                "SESSION-DEGRADED",
                                format!(
                                    "{} consecutive health checks failed, last: {e}",
                                    s.consecutive_health_failures
                                ),
                            ));
                            degraded = true;
                        }
                    }
                }
                true
            })
            .await?
            .ok_or_else(|| HubError::not_found("session", session_id))?;

        if let Err(e) = &probe {
            warn!(
                project_id,
                session_id,
                failures = updated.consecutive_health_failures,
                error = %e,
                "Session health check failed"
            );
        }
        if degraded {
            self.emit(names::SESSION_DEGRADED, &updated);
        }
        Ok(updated.status)
    }

    /// Tears down a session and marks it Closed.
    ///
    /// Closing a closed session returns it unchanged.
    pub async fn close(&self, project_id: &str, session_id: &str) -> HubResult<Session> {
        let session = self.get(project_id, session_id).await?;
        if session.status.is_terminal() {
            return Ok(session);
        }
        close_session(&self.inner, session).await
    }

    /// Returns a session.
    pub async fn get(&self, project_id: &str, session_id: &str) -> HubResult<Session> {
        self.inner
            .registry
            .get(project_id, session_id)
            .await?
            .ok_or_else(|| HubError::not_found("session", session_id))
    }

    /// Every session of a project, oldest first.
    pub async fn list(&self, project_id: &str) -> HubResult<Vec<Session>> {
        self.inner.registry.list(project_id).await
    }

    /// Closes every session past its expiry and returns their ids.
    pub async fn reap_expired(&self) -> HubResult<Vec<String>> {
        let now = now_utc();
        let mut reaped = Vec::new();
        for session in self.inner.registry.open_sessions() {
            if session.expires_at <= now && session.status != SessionStatus::Provisioning {
                let id = session.id.clone();
                close_session(&self.inner, session).await?;
                reaped.push(id);
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaped expired sessions");
        }
        Ok(reaped)
    }

    /// Health-checks every Ready session and reaps expired ones on the
    /// configured interval until [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let interval = self.inner.config.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = manager.inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                for session in manager.inner.registry.ready_sessions() {
                    if let Err(e) = manager.health_check(&session.project_id, &session.id).await {
                        warn!(session_id = %session.id, error = %e, "Health monitor check failed");
                    }
                }
                if let Err(e) = manager.reap_expired().await {
                    warn!(error = %e, "Reaping expired sessions failed");
                }
            }
            debug!("Session health monitor stopped");
        })
    }

    /// Stops the monitor and closes every open session.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel("hub shutting down");
        let sessions = self.inner.registry.drain();
        let count = sessions.len();
        for session in sessions {
            if let Err(e) = close_session(&self.inner, session).await {
                warn!(error = %e, "Failed to close session at shutdown");
            }
        }
        info!(count, "Closed sessions at shutdown");
    }

    fn emit(&self, event_type: &str, session: &Session) {
        emit(&self.inner, event_type, session);
    }
}

fn emit(inner: &Inner, event_type: &str, session: &Session) {
    inner.events.try_emit(
        event_type,
        Some(json!({
            "project_id": session.project_id,
            "session_id": session.id,
            "status": session.status,
            "endpoint": session.endpoint,
            "failure": session.failure,
        })),
    );
}

async fn close_session(inner: &Inner, mut session: Session) -> HubResult<Session> {
    if let Err(e) = inner.provisioner.teardown(&session).await {
        warn!(session_id = %session.id, error = %e, "Teardown failed; closing record anyway");
    }
    session.status = SessionStatus::Closed;
    session.closed_at = Some(now_utc());
    inner.registry.save(&session).await?;
    info!(project_id = %session.project_id, session_id = %session.id, "Session closed");
    emit(inner, names::SESSION_CLOSED, &session);
    Ok(session)
}

/// One provisioning operation; the in-flight entry is removed when it ends.
async fn provision(
    inner: Arc<Inner>,
    project: Arc<Project>,
    replaced: Option<Session>,
) -> Result<Session, ProvisioningError> {
    let result = provision_inner(&inner, &project, replaced).await;
    inner.in_flight.lock().remove(&project.id);
    result
}

async fn provision_inner(
    inner: &Inner,
    project: &Project,
    replaced: Option<Session>,
) -> Result<Session, ProvisioningError> {
    let storage_failure =
        |e: HubError| ProvisioningError::new(project.id.clone(), 0, format!("cannot store session: {e}"));

    if let Some(old) = replaced {
        info!(project_id = %project.id, session_id = %old.id, status = %old.status, "Replacing session");
        close_session(inner, old).await.map_err(storage_failure)?;
    }

    let now = now_utc();
    let mut session = Session {
        id: prefixed_id("sess"),
        project_id: project.id.clone(),
        endpoint: None,
        status: SessionStatus::Provisioning,
        created_at: now,
        last_health_check: None,
        expires_at: add_duration(now, inner.config.ttl()),
        consecutive_health_failures: 0,
        provisioning_attempts: 0,
        failure: None,
        closed_at: None,
    };
    inner.registry.save(&session).await.map_err(storage_failure)?;
    emit(inner, names::SESSION_PROVISIONING, &session);

    let session_id = session.id.clone();
    let session_id = session_id.as_str();
    let provisioner = inner.provisioner.as_ref();
    let outcome = inner
        .config
        .retry_policy()
        .execute_cancellable(
            &format!("provision/{}", project.id),
            &inner.shutdown,
            |_: &anyhow::Error| true,
            |attempt| {
                debug!(project_id = %project.id, attempt = attempt + 1, "Provisioning session");
                provisioner.provision(project, session_id)
            },
        )
        .await;
    session.provisioning_attempts = outcome.attempts;

    match outcome.result {
        Ok(environment) => {
            session.endpoint = Some(environment.endpoint);
            session.status = SessionStatus::Ready;
            inner.registry.save(&session).await.map_err(storage_failure)?;
            info!(
                project_id = %project.id,
                session_id = %session.id,
                attempts = outcome.attempts,
                "Session ready"
            );
            emit(inner, names::SESSION_READY, &session);
            Ok(session)
        }
        Err(e) => {
            let error = ProvisioningError::new(project.id.clone(), outcome.attempts, format!("{e:#}"));
            session.status = SessionStatus::Closed;
            session.closed_at = Some(now_utc());
            session.failure = Some(error.failure_reason());
            inner.registry.save(&session).await.map_err(storage_failure)?;
            warn!(project_id = %project.id, attempts = outcome.attempts, error = %e, "Provisioning failed");
            emit(inner, names::SESSION_CLOSED, &session);
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::storage::InMemoryKvStore;
    use crate::testing::{fixtures, ScriptedProvisioner};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        project: Arc<Project>,
        provisioner: Arc<ScriptedProvisioner>,
        events: Arc<CollectingEventSink>,
        manager: SessionManager,
    }

    fn harness(provisioner: ScriptedProvisioner) -> Harness {
        let config = SessionConfig {
            initial_delay_ms: 1,
            ..SessionConfig::default()
        };
        harness_with(provisioner, config)
    }

    fn harness_with(provisioner: ScriptedProvisioner, config: SessionConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let project = Arc::new(fixtures::project_in(dir.path(), "p1"));
        let provisioner = Arc::new(provisioner);
        let events = Arc::new(CollectingEventSink::new());
        let registry = Arc::new(SessionRegistry::new(Arc::new(InMemoryKvStore::new())));
        let manager = SessionManager::new(provisioner.clone(), registry, config, events.clone());
        Harness {
            _dir: dir,
            project,
            provisioner,
            events,
            manager,
        }
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let h = harness(ScriptedProvisioner::new());
        let first = h.manager.open(h.project.clone()).await.unwrap();
        assert_eq!(first.status, SessionStatus::Ready);
        assert!(first.endpoint.is_some());

        let second = h.manager.open(h.project.clone()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(h.provisioner.provision_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_open_provisions_once() {
        let h = harness(ScriptedProvisioner::new().with_delay(Duration::from_millis(50)));
        let opens = (0..8).map(|_| {
            let manager = h.manager.clone();
            let project = h.project.clone();
            tokio::spawn(async move { manager.open(project).await })
        });
        let sessions = futures::future::join_all(opens).await;
        let ids: std::collections::HashSet<String> = sessions
            .into_iter()
            .map(|r| r.unwrap().unwrap().id)
            .collect();
        assert_eq!(ids.len(), 1);
        assert_eq!(h.provisioner.provision_calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let h = harness(ScriptedProvisioner::new().failing_first(2));
        let session = h.manager.open(h.project.clone()).await.unwrap();
        assert_eq!(session.status, SessionStatus::Ready);
        assert_eq!(session.provisioning_attempts, 3);
        assert_eq!(h.provisioner.provision_calls(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_is_provisioning_error() {
        let h = harness(ScriptedProvisioner::new().failing_first(10));
        let err = h.manager.open(h.project.clone()).await.unwrap_err();
        assert_eq!(err.code(), "SESSION-PROVISIONING");
        // One attempt plus three retries.
        assert_eq!(h.provisioner.provision_calls(), 4);

        let sessions = h.manager.list("p1").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Closed);
        assert_eq!(sessions[0].failure.as_ref().unwrap().code, "SESSION-PROVISIONING");
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays() {
        let config = SessionConfig {
            initial_delay_ms: 100,
            ..SessionConfig::default()
        };
        let h = harness_with(ScriptedProvisioner::new().failing_first(3), config);
        let started = tokio::time::Instant::now();
        h.manager.open(h.project.clone()).await.unwrap();
        // 100 + 200 + 400
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_health_threshold_degrades() {
        let h = harness(ScriptedProvisioner::new());
        let session = h.manager.open(h.project.clone()).await.unwrap();
        h.provisioner.set_healthy(false);

        for _ in 0..2 {
            let status = h.manager.health_check("p1", &session.id).await.unwrap();
            assert_eq!(status, SessionStatus::Ready);
        }
        let status = h.manager.health_check("p1", &session.id).await.unwrap();
        assert_eq!(status, SessionStatus::Degraded);
        assert_eq!(h.events.count(names::SESSION_DEGRADED), 1);

        // Degraded is sticky.
        h.provisioner.set_healthy(true);
        let status = h.manager.health_check("p1", &session.id).await.unwrap();
        assert_eq!(status, SessionStatus::Degraded);

        // The next open re-provisions.
        let replacement = h.manager.open(h.project.clone()).await.unwrap();
        assert_ne!(replacement.id, session.id);
        assert_eq!(
            h.manager.get("p1", &session.id).await.unwrap().status,
            SessionStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_healthy_check_resets_failures() {
        let h = harness(ScriptedProvisioner::new());
        let session = h.manager.open(h.project.clone()).await.unwrap();
        h.provisioner.set_healthy(false);
        h.manager.health_check("p1", &session.id).await.unwrap();
        h.manager.health_check("p1", &session.id).await.unwrap();
        h.provisioner.set_healthy(true);
        h.manager.health_check("p1", &session.id).await.unwrap();

        let session = h.manager.get("p1", &session.id).await.unwrap();
        assert_eq!(session.consecutive_health_failures, 0);
        assert!(session.last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let h = harness(ScriptedProvisioner::new());
        let session = h.manager.open(h.project.clone()).await.unwrap();
        let closed = h.manager.close("p1", &session.id).await.unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert_eq!(h.provisioner.teardown_calls(), 1);

        // Idempotent.
        h.manager.close("p1", &session.id).await.unwrap();
        assert_eq!(h.provisioner.teardown_calls(), 1);

        let reopened = h.manager.open(h.project.clone()).await.unwrap();
        assert_ne!(reopened.id, session.id);
        assert_eq!(h.provisioner.provision_calls(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let h = harness(ScriptedProvisioner::new());
        let err = h.manager.close("p1", "sess-missing").await.unwrap_err();
        assert_eq!(err.code(), "NOT-FOUND");
    }

    #[tokio::test]
    async fn test_reap_expired() {
        let config = SessionConfig {
            session_ttl_secs: 0,
            initial_delay_ms: 1,
            ..SessionConfig::default()
        };
        let h = harness_with(ScriptedProvisioner::new(), config);
        let session = h.manager.open(h.project.clone()).await.unwrap();
        let reaped = h.manager.reap_expired().await.unwrap();
        assert_eq!(reaped, vec![session.id]);
        assert!(h.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_registry() {
        let h = harness(ScriptedProvisioner::new());
        let session = h.manager.open(h.project.clone()).await.unwrap();
        let monitor = h.manager.spawn_health_monitor();
        h.manager.shutdown().await;
        monitor.await.unwrap();

        assert!(h.manager.registry().is_empty());
        let stored = h.manager.get("p1", &session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Closed);
        assert_eq!(h.events.count(names::SESSION_CLOSED), 1);
    }
}
