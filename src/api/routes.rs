//! REST endpoints for jobs and operations.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

use super::{AppState, error_response};
use crate::error::JobError;

/// Default page size for `GET /api/jobs`.
const DEFAULT_LIST_LIMIT: usize = 50;
/// Largest page `GET /api/jobs` will return.
const MAX_LIST_LIMIT: usize = 500;

// ── Health ──────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "comic-batch"
    }))
}

pub async fn list_operations(State(state): State<AppState>) -> impl IntoResponse {
    let operations: Vec<serde_json::Value> = state
        .processors
        .list()
        .await
        .into_iter()
        .map(|(name, description)| serde_json::json!({"name": name, "description": description}))
        .collect();
    Json(serde_json::json!({ "operations": operations }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateJobRequest {
    items: Vec<String>,
    #[serde(default = "default_operation")]
    operation: String,
}

fn default_operation() -> String {
    "inspect".into()
}

pub async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    let Some(processor) = state.processors.get(&body.operation).await else {
        return error_response(&JobError::UnknownOperation { name: body.operation }.into())
            .into_response();
    };

    match state.manager.submit(body.items, processor).await {
        Ok(submission) => {
            info!(
                job_id = %submission.job_id,
                total_items = submission.total_items,
                operation = %body.operation,
                "Job submitted via API"
            );
            (StatusCode::CREATED, Json(serde_json::json!(submission))).into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.get(&id).await {
        Ok(job) => (StatusCode::OK, Json(serde_json::json!(job))).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

#[derive(Deserialize)]
pub struct ListParams {
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn list_jobs(State(state): State<AppState>, Query(params): Query<ListParams>) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0);

    match state.manager.list(limit, offset).await {
        Ok(jobs) => Json(serde_json::json!({
            "jobs": jobs,
            "limit": limit,
            "offset": offset,
        }))
        .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

pub async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.cancel(&id).await {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "job_id": job.id,
                "status": if job.is_terminal() { job.status.as_str() } else { "cancelling" },
            })),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}
