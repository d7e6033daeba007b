//! Process-wide registry of editing sessions.

use crate::core::{Session, SessionStatus};
use crate::errors::HubResult;
use crate::storage::{load_json, store_json, KvStore};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

fn session_key(project_id: &str, session_id: &str) -> String {
    format!("sessions/{project_id}/{session_id}")
}

/// Tracks every open session and persists each change.
///
/// Created at service start with [`SessionRegistry::load`] and emptied at
/// shutdown with [`SessionRegistry::drain`]. Closed sessions leave the
/// in-memory table but stay in storage.
pub struct SessionRegistry {
    open: DashMap<String, Session>,
    kv: Arc<dyn KvStore>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("open_sessions", &self.open.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            open: DashMap::new(),
            kv,
        }
    }

    /// Creates a registry holding every stored session that is not closed.
    pub async fn load(kv: Arc<dyn KvStore>) -> HubResult<Self> {
        let registry = Self::new(kv);
        for key in registry.kv.list_prefix("sessions/").await? {
            if let Some(session) = load_json::<Session>(registry.kv.as_ref(), &key).await? {
                if !session.status.is_terminal() {
                    registry.open.insert(session.id.clone(), session);
                }
            }
        }
        debug!(sessions = registry.open.len(), "Loaded session registry");
        Ok(registry)
    }

    /// Stores a session.
    pub async fn save(&self, session: &Session) -> HubResult<()> {
        store_json(
            self.kv.as_ref(),
            &session_key(&session.project_id, &session.id),
            session,
        )
        .await?;
        if session.status.is_terminal() {
            self.open.remove(&session.id);
        } else {
            self.open.insert(session.id.clone(), session.clone());
        }
        Ok(())
    }

    /// Applies `change` to an open session and stores the result.
    ///
    /// Returns `None` if the session is not open. `change` returns false to
    /// leave the session untouched.
    pub async fn update<F>(&self, session_id: &str, change: F) -> HubResult<Option<Session>>
    where
        F: FnOnce(&mut Session) -> bool,
    {
        let updated = {
            let Some(mut entry) = self.open.get_mut(session_id) else {
                return Ok(None);
            };
            if !change(entry.value_mut()) {
                return Ok(Some(entry.value().clone()));
            }
            entry.value().clone()
        };
        self.save(&updated).await?;
        Ok(Some(updated))
    }

    /// Returns a session, open or closed.
    pub async fn get(&self, project_id: &str, session_id: &str) -> HubResult<Option<Session>> {
        if let Some(session) = self.open.get(session_id) {
            return Ok((session.project_id == project_id).then(|| session.value().clone()));
        }
        load_json(self.kv.as_ref(), &session_key(project_id, session_id)).await
    }

    /// The newest non-closed session of a project.
    #[must_use]
    pub fn current(&self, project_id: &str) -> Option<Session> {
        self.open
            .iter()
            .filter(|s| s.project_id == project_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .map(|s| s.value().clone())
    }

    /// Every session of a project, oldest first.
    pub async fn list(&self, project_id: &str) -> HubResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for key in self.kv.list_prefix(&format!("sessions/{project_id}/")).await? {
            if let Some(session) = load_json::<Session>(self.kv.as_ref(), &key).await? {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sessions)
    }

    /// Every session that is not closed.
    #[must_use]
    pub fn open_sessions(&self) -> Vec<Session> {
        self.open.iter().map(|s| s.value().clone()).collect()
    }

    /// Ready sessions, the ones the health monitor probes.
    #[must_use]
    pub fn ready_sessions(&self) -> Vec<Session> {
        self.open
            .iter()
            .filter(|s| s.status == SessionStatus::Ready)
            .map(|s| s.value().clone())
            .collect()
    }

    /// Removes and returns every open session.
    #[must_use]
    pub fn drain(&self) -> Vec<Session> {
        let ids: Vec<String> = self.open.iter().map(|s| s.id.clone()).collect();
        ids.into_iter()
            .filter_map(|id| self.open.remove(&id).map(|(_, s)| s))
            .collect()
    }

    /// Number of open sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.open.len()
    }

    /// Returns true if no session is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
