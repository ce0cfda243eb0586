use std::sync::Arc;

use crate::supervisor::Supervisor;

/// Shared application state for API handlers
#[derive(Clone)]
pub struct AppState {
    /// The supervisor every handler delegates to
    pub supervisor: Arc<Supervisor>,

    /// Debugger URL reported by `/inspector_url`
    pub inspector_url: Option<String>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            inspector_url: None,
        }
    }

    pub fn with_inspector_url(mut self, url: Option<String>) -> Self {
        self.inspector_url = url;
        self
    }
}
