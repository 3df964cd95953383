//! OAuth callback and liveness routes, mounted outside `/api`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use super::error_response;
use crate::state::AppState;
use keyway_core::wire;
use keyway_store::TaskStatus;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/callback", get(callback))
        .route("/health", get(health))
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /callback: the identity provider's redirect after login.
///
/// On success the browser is sent on to the `return_url` of the pending
/// login, after the parked task has been resumed.
async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Some(nonce) = params.state.as_deref() else {
        return bad_request("missing state parameter");
    };

    if let Some(error) = params.error.as_deref() {
        return match state.orchestrator.reject_login(nonce, error) {
            Ok(task_id) => {
                warn!(
                    task_id = ?task_id.as_ref().map(|t| t.as_str()),
                    "Login refused by identity provider: {} {}",
                    error,
                    params.error_description.as_deref().unwrap_or_default()
                );
                (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": wire::PROVIDER_ERROR,
                        "message": format!("authorization failed: {}", error),
                    })),
                )
                    .into_response()
            }
            Err(e) => error_response(&e).into_response(),
        };
    }

    let Some(code) = params.code.as_deref() else {
        return bad_request("missing code parameter");
    };

    match state.orchestrator.complete_login(code, nonce).await {
        Ok(result) => Redirect::to(&result.return_url).into_response(),
        Err(e) => {
            warn!("Login callback failed: {}", e);
            let (status, body) = error_response(&e);
            // A code the provider refuses is reported like a bad state.
            let status = if status == StatusCode::BAD_GATEWAY {
                StatusCode::BAD_REQUEST
            } else {
                status
            };
            (status, body).into_response()
        }
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": wire::BAD_REQUEST,
            "message": message,
        })),
    )
        .into_response()
}

/// GET /health: liveness plus parked/working task counts.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let awaiting = state.store.count_by_status(TaskStatus::AwaitingAuth);
    let working = state.store.count_by_status(TaskStatus::Working);
    match (awaiting, working) {
        (Ok(awaiting), Ok(working)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "tasks": {
                    "awaitingAuth": awaiting,
                    "working": working,
                },
            })),
        ),
        (Err(e), _) | (_, Err(e)) => error_response(&e),
    }
}
