//! User-visible terminal notices.
//!
//! Every error that reaches the terminal is rendered here.

use crate::exec::AttachError;
use crate::session::LifecycleError;

use super::StreamError;

pub const GREETING: &str = "✅ Connected to container shell\r\n$ ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Sent once the shell is attached.
    Greeting,
    /// The terminal could not be attached.
    Failure(String),
    /// The exec channel stopped producing output.
    ReadFailed(String),
    /// Input could not be delivered to the shell.
    WriteFailed(String),
}

impl Notice {
    pub fn text(&self) -> String {
        match self {
            Notice::Greeting => GREETING.to_string(),
            Notice::Failure(message) => format!("❌ {message}\r\n"),
            Notice::ReadFailed(err) => format!("\r\n[connection to container closed: {err}]\r\n"),
            Notice::WriteFailed(err) => format!("\r\n[write error: {err}]\r\n"),
        }
    }
}

impl From<&AttachError> for Notice {
    fn from(err: &AttachError) -> Self {
        Notice::Failure(err.to_string())
    }
}

impl From<&LifecycleError> for Notice {
    fn from(err: &LifecycleError) -> Self {
        Notice::Failure(err.to_string())
    }
}

impl From<&StreamError> for Notice {
    fn from(err: &StreamError) -> Self {
        match err {
            StreamError::ReadFailed(e) => Notice::ReadFailed(e.clone()),
            StreamError::WriteFailed(e) => Notice::WriteFailed(e.clone()),
        }
    }
}
