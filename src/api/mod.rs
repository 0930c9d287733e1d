//! HTTP + WebSocket surface for batch jobs.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;

use crate::error::{Error, JobError};
use crate::jobs::JobManager;
use crate::processors::ProcessorRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
    /// Operations clients may request by name.
    pub processors: Arc<ProcessorRegistry>,
}

/// Build the Axum router with job REST and WebSocket routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/api/operations", get(routes::list_operations))
        .route("/api/jobs", post(routes::create_job).get(routes::list_jobs))
        .route(
            "/api/jobs/{id}",
            get(routes::get_job).delete(routes::delete_job),
        )
        .route("/api/jobs/{id}/cancel", post(routes::cancel_job))
        .route("/ws/jobs", get(ws::global_ws_handler))
        .route("/ws/jobs/{id}", get(ws::job_ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Map a service error to a status code and `{"error": ..}` body.
pub(crate) fn error_response(err: &Error) -> (StatusCode, Json<Value>) {
    let status = match err {
        Error::Job(job_err) => match job_err {
            JobError::InvalidId { .. }
            | JobError::ItemCountMismatch { .. }
            | JobError::NoItems
            | JobError::UnknownOperation { .. } => StatusCode::BAD_REQUEST,
            JobError::NotFound { .. } => StatusCode::NOT_FOUND,
            JobError::NotQueued { .. }
            | JobError::InvalidTransition { .. }
            | JobError::NotProcessing { .. }
            | JobError::ResultOverflow { .. }
            | JobError::StillProcessing { .. }
            | JobError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
        },
        _ => {
            tracing::error!(error = %err, "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": err.to_string()})))
}
