//! Application state for the HTTP server.

use qhub::hub::QuantumHub;
use std::sync::Arc;

/// Shared application state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The orchestration core.
    pub hub: Arc<QuantumHub>,
}

impl AppState {
    /// Creates state around a built hub.
    pub fn new(hub: Arc<QuantumHub>) -> Self {
        Self { hub }
    }
}
