//! Application state shared across handlers.

use crate::session::SessionService;

/// Application state.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Session lifecycle service.
    pub sessions: SessionService,
    /// Lab started when `/labs/start/` gets no `lab` parameter.
    pub default_lab: String,
}

impl AppState {
    pub fn new(sessions: SessionService, default_lab: impl Into<String>) -> Self {
        Self {
            sessions,
            default_lab: default_lab.into(),
        }
    }
}
