//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Sandbox is being provisioned.
    Creating,
    /// Sandbox is running with no terminal attached.
    Ready,
    /// A terminal bridge is live.
    Attached,
    /// Destroyed. Terminal; the session leaves the registry.
    Closed,
    /// Provisioning failed or the sandbox vanished. Terminal; the session
    /// leaves the registry.
    Failed,
}

impl SessionState {
    /// Whether the sandbox can run commands.
    pub fn has_sandbox(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Attached)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Creating => write!(f, "creating"),
            SessionState::Ready => write!(f, "ready"),
            SessionState::Attached => write!(f, "attached"),
            SessionState::Closed => write!(f, "closed"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(SessionState::Creating),
            "ready" => Ok(SessionState::Ready),
            "attached" => Ok(SessionState::Attached),
            "closed" => Ok(SessionState::Closed),
            "failed" => Ok(SessionState::Failed),
            _ => Err(format!("unknown session state: {}", s)),
        }
    }
}

/// Snapshot of a lab session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// 8-character hex id.
    pub id: String,
    pub lab_id: String,
    /// Set once provisioning succeeds; never changes afterwards.
    pub container_name: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSession {
    pub session_id: String,
    pub container_name: String,
    pub lab_id: String,
}
