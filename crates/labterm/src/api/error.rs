//! API error handling with structured responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::session::LifecycleError;

/// API error type with structured responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Gateway error: {0}")]
    BadGateway(String),

    /// A session was allocated but could not be started. The message is
    /// passed through unprefixed.
    #[error("{message}")]
    SessionFailed { session_id: String, message: String },
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::SessionFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadGateway(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Conflict(_) => "CONFLICT",
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::SessionFailed { .. } => "SESSION_FAILED",
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        match &self {
            ApiError::BadGateway(msg) => {
                error!(error_code = code, message = %msg, "API error");
            }
            ApiError::SessionFailed { session_id, message } => {
                warn!(error_code = code, session_id = %session_id, message = %message, "Session failed");
            }
            _ => {
                tracing::debug!(error_code = code, message = %message, "Client error");
            }
        }

        let session_id = match self {
            ApiError::SessionFailed { session_id, .. } => Some(session_id),
            _ => None,
        };

        let body = ErrorResponse {
            error: message,
            code,
            session_id,
        };

        (status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(err: LifecycleError) -> Self {
        let message = err.to_string();
        match err {
            LifecycleError::InvalidLab(_) => ApiError::BadRequest(message),
            LifecycleError::UnknownSession(_) => ApiError::NotFound(message),
            LifecycleError::ProvisionFailed { session_id, .. }
            | LifecycleError::ProvisionTimeout { session_id } => {
                ApiError::SessionFailed { session_id, message }
            }
            LifecycleError::SessionClosed(session_id) => {
                ApiError::SessionFailed { session_id, message }
            }
            LifecycleError::NotReady { .. } | LifecycleError::AlreadyAttached(_) => {
                ApiError::Conflict(message)
            }
            LifecycleError::SandboxUnreachable(_) => ApiError::BadGateway(message),
        }
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
