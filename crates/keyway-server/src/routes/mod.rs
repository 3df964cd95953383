//! HTTP route handlers.

pub mod oauth;
pub mod tasks;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use keyway_core::wire::ErrorBody;
use keyway_core::Error;

/// Build the main Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .merge(oauth::routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new().merge(tasks::routes())
}

/// Status and `{error, message}` body for a failed operation.
pub(crate) fn error_response(error: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match error {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidState | Error::Json(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        Error::AuthRequired { .. }
        | Error::NoRefreshToken(_)
        | Error::ExpiredToken
        | Error::Unauthorized(_)
        | Error::MissingToken
        | Error::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
        Error::TenantMismatch { .. } => StatusCode::FORBIDDEN,
        Error::Provider(_) | Error::Delegation(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
        Error::IllegalLink(_)
        | Error::Storage(_)
        | Error::Database(_)
        | Error::Io(_)
        | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorBody {
        error: error.code().to_string(),
        message: Some(error.to_string()),
    };
    (status, Json(serde_json::json!(body)))
}
