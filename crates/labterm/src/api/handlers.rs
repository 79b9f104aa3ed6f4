//! HTTP and WebSocket handlers.

use axum::{
    Json,
    extract::{
        Path, Query, State,
        rejection::JsonRejection,
        ws::{WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::container::MemorySnapshot;
use crate::session::{CreatedSession, Session};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    pub lab: Option<String>,
}

/// Body of the validate and reset endpoints.
#[derive(Debug, Deserialize)]
pub struct ContainerRequest {
    pub container_name: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub result: String,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub status: &'static str,
}

fn parse_body(body: Result<Json<ContainerRequest>, JsonRejection>) -> ApiResult<ContainerRequest> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if request.container_name.trim().is_empty() {
        return Err(ApiError::bad_request("container_name cannot be empty"));
    }
    Ok(request)
}

/// Start a lab session.
#[instrument(skip(state))]
pub async fn start_lab(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
) -> ApiResult<Json<CreatedSession>> {
    let lab_id = query
        .lab
        .filter(|lab| !lab.is_empty())
        .unwrap_or_else(|| state.default_lab.clone());
    let created = state.sessions.create(&lab_id).await?;
    info!(
        session_id = %created.session_id,
        container = %created.container_name,
        "lab started"
    );
    Ok(Json(created))
}

/// Run the lab validator and return its output.
#[instrument(skip(state, body))]
pub async fn validate_lab(
    State(state): State<AppState>,
    body: Result<Json<ContainerRequest>, JsonRejection>,
) -> ApiResult<Json<ValidateResponse>> {
    let request = parse_body(body)?;
    let result = state.sessions.validate(&request.container_name).await?;
    Ok(Json(ValidateResponse { result }))
}

/// Destroy a session. Succeeds for unknown or already removed sandboxes.
#[instrument(skip(state, body))]
pub async fn reset_lab(
    State(state): State<AppState>,
    body: Result<Json<ContainerRequest>, JsonRejection>,
) -> ApiResult<Json<ResetResponse>> {
    let request = parse_body(body)?;
    state.sessions.destroy(&request.container_name).await;
    Ok(Json(ResetResponse {
        status: "reset done",
    }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.sessions.list())
}

/// One-shot memory usage of a session's sandbox.
pub async fn container_metrics(
    State(state): State<AppState>,
    Path(container_name): Path<String>,
) -> ApiResult<Json<MemorySnapshot>> {
    let snapshot = state.sessions.memory_snapshot(&container_name).await?;
    Ok(Json(snapshot))
}

/// Upgrade to a terminal WebSocket for a session id or container name.
pub async fn lab_terminal_ws(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(state, name, socket))
}

async fn serve_socket(state: AppState, name: String, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let report = state.sessions.serve_terminal(&name, sink, stream).await;
    debug!(key = %name, ?report, "terminal socket finished");
}
