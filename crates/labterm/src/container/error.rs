//! Container runtime error types.

use thiserror::Error;

/// Result type for container operations.
pub type ContainerResult<T> = Result<T, ContainerError>;

/// Errors that can occur during container operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container command failed.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Container was not found.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Image was not found.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Exec session was not found (never created or already started).
    #[error("exec session not found: {0}")]
    ExecNotFound(String),

    /// Pseudo-terminal allocation or spawn failed.
    #[error("pty error: {0}")]
    Pty(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    ParseError(String),

    /// Invalid input provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContainerError {
    /// Classify a failed CLI invocation, recognizing the runtime's
    /// "no such container" wording so callers can treat it as a missing object.
    pub(crate) fn from_stderr(command: &str, target: &str, stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        if lower.contains("no such container") || lower.contains("no container with name") {
            ContainerError::ContainerNotFound(target.to_string())
        } else if lower.contains("no such image") || lower.contains("image not known") {
            ContainerError::ImageNotFound(target.to_string())
        } else {
            ContainerError::CommandFailed {
                command: command.to_string(),
                message: stderr.trim().to_string(),
            }
        }
    }

    /// Whether this error means the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ContainerError::ContainerNotFound(_) | ContainerError::ImageNotFound(_)
        )
    }
}
