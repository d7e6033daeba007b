//! Editing session records.

use super::status::SessionStatus;
use crate::errors::FailureReason;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};

/// A provisioned remote editing environment bound to a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    pub id: String,
    /// Owning project.
    pub project_id: String,
    /// Access URL of the environment, set once provisioning succeeds.
    pub endpoint: Option<String>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last health check time.
    pub last_health_check: Option<Timestamp>,
    /// Time after which the session is reaped.
    pub expires_at: Timestamp,
    /// Consecutive failed health checks.
    pub consecutive_health_failures: u32,
    /// Provisioning attempts made for this session.
    pub provisioning_attempts: u32,
    /// Failure reason when provisioning failed or the session degraded.
    pub failure: Option<FailureReason>,
    /// Close time.
    pub closed_at: Option<Timestamp>,
}

impl Session {
    /// Returns true if the session is Ready and not past its expiry.
    #[must_use]
    pub fn is_usable(&self, now: Timestamp) -> bool {
        self.status == SessionStatus::Ready && now < self.expires_at
    }
}
