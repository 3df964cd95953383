//! End-to-end tests of the orchestrator API: the router is driven with
//! `oneshot`, while mockito plays the identity provider and the backends.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use mockito::{Matcher, ServerGuard};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use keyway_auth::HttpIdentityProvider;
use keyway_core::{DataPaths, KeywayConfig, ProviderConfig, ServiceEndpoint, ServiceTable};
use keyway_delegate::HttpTransport;
use keyway_server::{build_router, AppState};
use keyway_store::{Credential, CredentialStore, SqliteStore};

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    _dir: TempDir,
}

fn setup(server: &ServerGuard) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let data_paths = DataPaths::new(dir.path()).unwrap();
    let store = Arc::new(SqliteStore::open(&data_paths.db_file).unwrap());
    let provider_config = ProviderConfig::for_issuer(
        &server.url(),
        "host-agent",
        "host-secret",
        "http://localhost:8083/callback",
    );
    let config = KeywayConfig {
        port: 8083,
        public_url: "http://localhost:8083".into(),
        data_paths,
        provider: provider_config.clone(),
        state_ttl_secs: 1800,
        refresh_skew_secs: 30,
        awaiting_retention_days: 7,
    };
    let services = ServiceTable::new([
        ServiceEndpoint {
            name: "horizon".into(),
            url: format!("{}/horizon", server.url()),
            requires_auth: true,
        },
        ServiceEndpoint {
            name: "weather".into(),
            url: format!("{}/weather", server.url()),
            requires_auth: false,
        },
    ]);
    let provider = Arc::new(HttpIdentityProvider::new(provider_config).unwrap());
    let transport = Arc::new(HttpTransport::new().unwrap());
    let state = Arc::new(AppState::with_parts(config, store, services, provider, transport));
    TestApp {
        app: build_router(state.clone()),
        state,
        _dir: dir,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, json)
}

fn submission(service: &str) -> Value {
    json!({
        "session_key": "s1",
        "tenant_id": "tenant-abc",
        "service": service,
        "payload": {"text": "book a trip to Lisbon"},
    })
}

fn state_param(redirect_url: &str) -> String {
    url::Url::parse(redirect_url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap()
}

fn token_body(access_token: &str) -> String {
    json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": format!("rt-for-{}", access_token),
    })
    .to_string()
}

fn task_body(id: &str, status: &str) -> String {
    json!({"task": {"id": id, "status": status}}).to_string()
}

fn seed_credential(state: &AppState, access_token: &str) {
    let now = chrono::Utc::now();
    state
        .store
        .put(
            "s1",
            Credential {
                session_key: "s1".into(),
                tenant_id: "tenant-abc".into(),
                access_token: access_token.into(),
                access_token_expiry: now + chrono::Duration::hours(1),
                refresh_token: Some("rt-old".into()),
                issued_at: now,
            },
        )
        .unwrap();
}

#[tokio::test]
async fn test_health() {
    let server = mockito::Server::new_async().await;
    let t = setup(&server);

    let (status, _, body) = call(&t.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tasks"]["awaitingAuth"], 0);
}

#[tokio::test]
async fn test_public_service_delegates_and_refreshes_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/weather/tasks")
        .match_header("authorization", Matcher::Missing)
        .with_header("content-type", "application/json")
        .with_body(task_body("w-1", "working"))
        .create_async()
        .await;
    server
        .mock("GET", "/weather/tasks/w-1")
        .with_header("content-type", "application/json")
        .with_body(task_body("w-1", "completed"))
        .create_async()
        .await;
    let t = setup(&server);

    let (status, _, body) = call(&t.app, Method::POST, "/api/tasks", Some(submission("weather"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["remote_task_id"], "w-1");
    assert_eq!(body["task"]["status"], "working");

    let id = body["task"]["id"].as_str().unwrap();
    let (status, _, body) = call(&t.app, Method::POST, &format!("/api/tasks/{}/refresh", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
}

#[tokio::test]
async fn test_login_callback_resumes_parked_task() {
    let mut server = mockito::Server::new_async().await;
    let exchange = server
        .mock("POST", "/generate-token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
            Matcher::UrlEncoded("code".into(), "abc".into()),
        ]))
        .with_header("content-type", "application/json")
        .with_body(token_body("at-abc"))
        .expect(1)
        .create_async()
        .await;
    let backend = server
        .mock("POST", "/horizon/tasks")
        .match_header("authorization", "Bearer at-abc")
        .with_header("content-type", "application/json")
        .with_body(task_body("rt-1", "working"))
        .expect(1)
        .create_async()
        .await;
    let t = setup(&server);

    let (status, _, body) = call(&t.app, Method::POST, "/api/tasks", Some(submission("horizon"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth_required");
    assert_eq!(body["task"]["status"], "awaiting_auth");
    let task_id = body["task"]["id"].as_str().unwrap().to_string();
    let state = state_param(body["redirect_url"].as_str().unwrap());

    let (_, _, health) = call(&t.app, Method::GET, "/health", None).await;
    assert_eq!(health["tasks"]["awaitingAuth"], 1);

    let callback = format!("/callback?code=abc&state={}", state);
    let (status, headers, _) = call(&t.app, Method::GET, &callback, None).await;
    assert_eq!(status, StatusCode::SEE_OTHER);
    assert_eq!(
        headers[header::LOCATION],
        format!("http://localhost:8083/api/tasks/{}", task_id)
    );

    let (status, _, task) = call(&t.app, Method::GET, &format!("/api/tasks/{}", task_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["remote_task_id"], "rt-1");
    assert_eq!(task["status"], "working");
    assert_eq!(task["payload"]["text"], "book a trip to Lisbon");

    let (status, _, body) = call(&t.app, Method::GET, &callback, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_state");

    exchange.assert_async().await;
    backend.assert_async().await;
}

#[tokio::test]
async fn test_expired_token_is_refreshed_transparently() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/horizon/tasks")
        .match_header("authorization", "Bearer at-old")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "token_expired", "error_description": "Token has expired"}"#)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/generate-token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
        .with_header("content-type", "application/json")
        .with_body(token_body("at-new"))
        .expect(1)
        .create_async()
        .await;
    server
        .mock("POST", "/horizon/tasks")
        .match_header("authorization", "Bearer at-new")
        .with_header("content-type", "application/json")
        .with_body(task_body("rt-2", "working"))
        .create_async()
        .await;
    let t = setup(&server);
    seed_credential(&t.state, "at-old");

    let (status, _, body) = call(&t.app, Method::POST, "/api/tasks", Some(submission("horizon"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["remote_task_id"], "rt-2");

    let stored = t.state.store.get("s1").unwrap().unwrap();
    assert_eq!(stored.access_token, "at-new");
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_poll_with_spent_refresh_token_redirects_to_login() {
    let mut server = mockito::Server::new_async().await;
    let send = server
        .mock("POST", "/horizon/tasks")
        .match_header("authorization", "Bearer at-old")
        .with_header("content-type", "application/json")
        .with_body(task_body("rt-1", "working"))
        .expect(1)
        .create_async()
        .await;
    server
        .mock("GET", "/horizon/tasks/rt-1")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "token_expired", "error_description": "Token has expired"}"#)
        .create_async()
        .await;
    server
        .mock("POST", "/generate-token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()))
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "invalid_grant"}"#)
        .create_async()
        .await;
    let t = setup(&server);
    seed_credential(&t.state, "at-old");

    let (status, _, body) = call(&t.app, Method::POST, "/api/tasks", Some(submission("horizon"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["task"]["id"].as_str().unwrap().to_string();

    let (status, _, body) = call(&t.app, Method::POST, &format!("/api/tasks/{}/refresh", id), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth_required");
    assert_eq!(body["task"]["status"], "working");
    assert_eq!(body["task"]["remote_task_id"], "rt-1");
    assert!(!state_param(body["redirect_url"].as_str().unwrap()).is_empty());
    send.assert_async().await;
}

#[tokio::test]
async fn test_backend_tenant_rejection_is_forbidden() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/horizon/tasks")
        .with_status(403)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": "tenant_mismatch", "error_description": "wrong tenant"}"#)
        .create_async()
        .await;
    let t = setup(&server);
    seed_credential(&t.state, "at-abc");

    let (status, _, body) = call(&t.app, Method::POST, "/api/tasks", Some(submission("horizon"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "tenant_mismatch");
}

#[tokio::test]
async fn test_denied_login_fails_task() {
    let server = mockito::Server::new_async().await;
    let t = setup(&server);

    let (_, _, body) = call(&t.app, Method::POST, "/api/tasks", Some(submission("horizon"))).await;
    let task_id = body["task"]["id"].as_str().unwrap().to_string();
    let state = state_param(body["redirect_url"].as_str().unwrap());

    let uri = format!("/callback?error=access_denied&state={}", state);
    let (status, _, body) = call(&t.app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "provider_error");

    let (_, _, task) = call(&t.app, Method::GET, &format!("/api/tasks/{}", task_id), None).await;
    assert_eq!(task["status"], "failed");
    assert_eq!(task["error"], "authorization failed: access_denied");

    let (status, _, body) = call(&t.app, Method::POST, &format!("/api/tasks/{}/resume", task_id), None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["task"]["status"], "failed");
}

#[tokio::test]
async fn test_bad_requests() {
    let server = mockito::Server::new_async().await;
    let t = setup(&server);

    let (status, _, body) = call(&t.app, Method::GET, "/api/tasks/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _, _) = call(&t.app, Method::POST, "/api/tasks", Some(submission("calendar"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut anonymous = submission("weather");
    anonymous["session_key"] = json!("");
    let (status, _, body) = call(&t.app, Method::POST, "/api/tasks", Some(anonymous)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "bad_request");

    let (status, _, _) = call(&t.app, Method::GET, "/callback?code=abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = call(&t.app, Method::GET, "/callback?code=abc&state=forged", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_state");
}
