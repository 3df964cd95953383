//! Task submission, status and resumption routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::warn;

use super::error_response;
use crate::state::AppState;
use keyway_core::wire;
use keyway_runtime::{Outcome, Progress, SubmitRequest};
use keyway_store::{TaskId, TaskRecord};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/resume", post(resume_task))
        .route("/tasks/{id}/refresh", post(refresh_task))
}

/// POST /api/tasks: create a task and delegate it.
async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SubmitRequest>,
) -> impl IntoResponse {
    if body.session_key.trim().is_empty() || body.tenant_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": wire::BAD_REQUEST,
                "message": "session_key and tenant_id are required",
            })),
        );
    }
    match state.orchestrator.submit(body).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => {
            warn!("Task submission failed: {}", e);
            error_response(&e)
        }
    }
}

/// GET /api/tasks/{id}: stored task record.
async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.task(&TaskId::from(id)) {
        Ok(task) => (StatusCode::OK, Json(serde_json::json!(task))),
        Err(e) => error_response(&e),
    }
}

/// POST /api/tasks/{id}/resume: retry a task, typically after login.
async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.resume(&TaskId::from(id)).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(&e),
    }
}

/// POST /api/tasks/{id}/refresh: poll the backend for the task's progress.
async fn refresh_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.refresh_status(&TaskId::from(id)).await {
        Ok(Progress::Current { task }) => (StatusCode::OK, Json(serde_json::json!(task))),
        Ok(Progress::AuthRequired { task, redirect_url }) => auth_required(task, redirect_url),
        Err(e) => error_response(&e),
    }
}

fn outcome_response(outcome: Outcome) -> (StatusCode, Json<serde_json::Value>) {
    match outcome {
        Outcome::Delegated {
            task,
            remote_task_id,
        } => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "task": task,
                "remote_task_id": remote_task_id,
            })),
        ),
        Outcome::AuthRequired { task, redirect_url } => auth_required(task, redirect_url),
        Outcome::Failed { task, reason } => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({
                "error": wire::UPSTREAM_ERROR,
                "message": reason,
                "task": task,
            })),
        ),
    }
}

fn auth_required(task: TaskRecord, redirect_url: String) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": wire::AUTH_REQUIRED,
            "message": "Please authenticate to continue",
            "task": task,
            "redirect_url": redirect_url,
        })),
    )
}
