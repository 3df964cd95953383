//! axum middleware guarding every route of a protected backend.
//!
//! ```rust,ignore
//! let guard = Arc::new(ResourceGuard::from_config(&GuardConfig::from_env()?)?);
//! let app = Router::new()
//!     .route("/tasks", post(create_task))
//!     .layer(axum::middleware::from_fn_with_state(guard, require_bearer));
//! ```

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use crate::context::BearerContext;
use crate::guard::ResourceGuard;
use keyway_core::Error;

/// Validate the bearer token, then expose [`crate::Claims`] and the
/// populated [`BearerContext`] as request extensions.
pub async fn require_bearer(
    State(guard): State<Arc<ResourceGuard>>,
    mut request: Request,
    next: Next,
) -> Response {
    let context = BearerContext::from_headers(request.headers());
    match guard.validate_context(&context).await {
        Ok(claims) => {
            request.extensions_mut().insert(claims.clone());
            request.extensions_mut().insert(context.with_claims(claims));
            next.run(request).await
        }
        Err(e) => {
            warn!("Rejected request to {}: {}", request.uri().path(), e);
            rejection(&e)
        }
    }
}

/// 401 for missing, invalid or expired tokens; 403 for a foreign tenant.
pub fn rejection(error: &Error) -> Response {
    let status = match error {
        Error::MissingToken | Error::InvalidSignature(_) | Error::ExpiredToken => {
            StatusCode::UNAUTHORIZED
        }
        Error::TenantMismatch { .. } => StatusCode::FORBIDDEN,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    let code = error.code();
    let description = error.to_string();

    let challenge = match error {
        Error::MissingToken => "Bearer".to_string(),
        _ => format!(
            "Bearer error=\"{}\", error_description=\"{}\"",
            code,
            description.replace('"', "'")
        ),
    };

    let mut response = (
        status,
        Json(serde_json::json!({
            "error": code,
            "error_description": description,
        })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&challenge) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardConfig, KeySource};
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::get;
    use axum::{Extension, Router};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use tower::ServiceExt;

    const SECRET: &str = "backend-shared-secret";

    fn app() -> Router {
        let config = GuardConfig::new(
            "http://localhost:5000",
            "tenant-abc",
            KeySource::Secret(SECRET.into()),
        );
        let guard = Arc::new(ResourceGuard::from_config(&config).unwrap());
        Router::new()
            .route(
                "/whoami",
                get(|Extension(ctx): Extension<BearerContext>| async move {
                    ctx.tenant_claim().unwrap_or_default().to_string()
                }),
            )
            .layer(axum::middleware::from_fn_with_state(guard, require_bearer))
    }

    fn token(tenant: &str, exp_offset: i64) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({
            "sub": "user-1",
            "tenant_id": tenant,
            "iss": "http://localhost:5000",
            "iat": now,
            "exp": now + exp_offset,
        });
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    async fn call(auth: Option<String>) -> Response {
        let mut builder = HttpRequest::builder().uri("/whoami");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        app().oneshot(builder.body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn error_code(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        body["error"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_valid_token_reaches_handler() {
        let response = call(Some(format!("Bearer {}", token("tenant-abc", 600)))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"tenant-abc");
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let response = call(None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert_eq!(error_code(response).await, "missing_token");
    }

    #[tokio::test]
    async fn test_expired_token_is_401_token_expired() {
        let response = call(Some(format!("Bearer {}", token("tenant-abc", -600)))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap().to_string();
        assert!(challenge.starts_with("Bearer error=\"token_expired\""));
        assert_eq!(error_code(response).await, "token_expired");
    }

    #[tokio::test]
    async fn test_foreign_tenant_is_403() {
        let response = call(Some(format!("Bearer {}", token("tenant-x", 600)))).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(response).await, "tenant_mismatch");
    }

    #[tokio::test]
    async fn test_garbage_token_is_401_invalid_token() {
        let response = call(Some("Bearer not-a-jwt".into())).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(response).await, "invalid_token");
    }
}
