//! API route definitions.

use axum::http::{Method, header};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Create the application router.
///
/// Lab paths are served with and without a trailing slash.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    let labs = Router::new()
        .route("/start", get(handlers::start_lab))
        .route("/start/", get(handlers::start_lab))
        .route("/validate", post(handlers::validate_lab))
        .route("/validate/", post(handlers::validate_lab))
        .route("/reset", post(handlers::reset_lab))
        .route("/reset/", post(handlers::reset_lab))
        .route("/sessions", get(handlers::list_sessions))
        .route("/metrics/{container_name}", get(handlers::container_metrics));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/labs", labs)
        .route("/ws/lab/{name}", get(handlers::lab_terminal_ws))
        .route("/ws/lab/{name}/", get(handlers::lab_terminal_ws))
        .layer(trace_layer)
        .layer(cors)
        .with_state(state)
}
