//! Session lifecycle errors.

use thiserror::Error;

use super::models::SessionState;
use crate::provision::ProvisionError;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid lab id '{0}'")]
    InvalidLab(String),

    #[error("session not found: {0}")]
    UnknownSession(String),

    #[error("{source}")]
    ProvisionFailed {
        session_id: String,
        #[source]
        source: ProvisionError,
    },

    #[error("container startup taking too long or failed")]
    ProvisionTimeout { session_id: String },

    #[error("session {session_id} is not ready (state: {state})")]
    NotReady {
        session_id: String,
        state: SessionState,
    },

    #[error("sandbox unreachable: {0}")]
    SandboxUnreachable(String),

    #[error("a terminal is already attached to session {0}")]
    AlreadyAttached(String),

    #[error("session {0} is closed")]
    SessionClosed(String),
}

impl LifecycleError {
    /// Session id the error refers to, when one was allocated.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            LifecycleError::ProvisionFailed { session_id, .. }
            | LifecycleError::ProvisionTimeout { session_id }
            | LifecycleError::NotReady { session_id, .. } => Some(session_id),
            LifecycleError::AlreadyAttached(id) | LifecycleError::SessionClosed(id) => Some(id),
            _ => None,
        }
    }
}
