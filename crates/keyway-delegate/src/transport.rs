//! Network transport to backend services.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};

use crate::types::{RemoteTask, SendMessageRequest, TaskEnvelope};
use keyway_core::wire::{ErrorBody, TENANT_MISMATCH, TOKEN_EXPIRED};
use keyway_core::{Error, Result, ServiceEndpoint};
use keyway_store::Credential;

/// How messages reach a backend. The credential, when present, is sent as
/// `Authorization: Bearer`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        endpoint: &ServiceEndpoint,
        request: &SendMessageRequest,
        credential: Option<&Credential>,
    ) -> Result<RemoteTask>;

    async fn get_task(
        &self,
        endpoint: &ServiceEndpoint,
        remote_task_id: &str,
        credential: Option<&Credential>,
    ) -> Result<RemoteTask>;
}

/// JSON over HTTP with reqwest.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn execute(
        &self,
        request: RequestBuilder,
        endpoint: &ServiceEndpoint,
        credential: Option<&Credential>,
    ) -> Result<RemoteTask> {
        let request = match credential {
            Some(cred) => request.bearer_auth(&cred.access_token),
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(format!("{} unreachable: {}", endpoint.name, e)))?;

        if !response.status().is_success() {
            return Err(rejection(response, endpoint, credential).await);
        }

        let envelope: TaskEnvelope = response
            .json()
            .await
            .map_err(|e| Error::Delegation(format!("{} returned a malformed task: {}", endpoint.name, e)))?;
        Ok(envelope.task)
    }
}

/// Map a non-2xx backend response onto the error taxonomy.
async fn rejection(response: Response, endpoint: &ServiceEndpoint, credential: Option<&Credential>) -> Error {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    let body: Option<ErrorBody> = serde_json::from_str(&text).ok();
    let code = body.as_ref().map(|b| b.error.as_str());
    let detail = body
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| text.clone());

    warn!(service = %endpoint.name, "Backend rejected request: {} {:?}", status, code);
    match (status, code) {
        (StatusCode::UNAUTHORIZED, Some(TOKEN_EXPIRED)) => Error::ExpiredToken,
        (StatusCode::UNAUTHORIZED, _) => Error::Unauthorized(detail),
        (StatusCode::FORBIDDEN, Some(TENANT_MISMATCH)) => Error::TenantMismatch {
            expected: format!("tenant of {}", endpoint.name),
            found: credential.map(|c| c.tenant_id.clone()),
        },
        _ => Error::Http(format!("{} returned {}: {}", endpoint.name, status, detail)),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_message(
        &self,
        endpoint: &ServiceEndpoint,
        request: &SendMessageRequest,
        credential: Option<&Credential>,
    ) -> Result<RemoteTask> {
        let url = format!("{}/tasks", endpoint.url.trim_end_matches('/'));
        debug!(service = %endpoint.name, "POST {}", url);
        self.execute(self.client.post(&url).json(request), endpoint, credential)
            .await
    }

    async fn get_task(
        &self,
        endpoint: &ServiceEndpoint,
        remote_task_id: &str,
        credential: Option<&Credential>,
    ) -> Result<RemoteTask> {
        let url = format!(
            "{}/tasks/{}",
            endpoint.url.trim_end_matches('/'),
            remote_task_id
        );
        debug!(service = %endpoint.name, "GET {}", url);
        self.execute(self.client.get(&url), endpoint, credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutboundMessage, RemoteStatus};
    use mockito::Matcher;

    fn endpoint(server: &mockito::ServerGuard) -> ServiceEndpoint {
        ServiceEndpoint {
            name: "horizon".into(),
            url: server.url(),
            requires_auth: true,
        }
    }

    fn credential() -> Credential {
        let now = chrono::Utc::now();
        Credential {
            session_key: "s1".into(),
            tenant_id: "tenant-abc".into(),
            access_token: "at-1".into(),
            access_token_expiry: now + chrono::Duration::hours(1),
            refresh_token: None,
            issued_at: now,
        }
    }

    fn request() -> SendMessageRequest {
        SendMessageRequest {
            message: OutboundMessage::new("local-1", serde_json::json!({"text": "hi"})),
        }
    }

    #[tokio::test]
    async fn test_send_message_carries_bearer_and_reads_task() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tasks")
            .match_header("authorization", "Bearer at-1")
            .match_body(Matcher::PartialJsonString(
                r#"{"message": {"context_id": "local-1"}}"#.into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"task": {"id": "rt-1", "status": "working"}}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new().unwrap();
        let cred = credential();
        let task = transport
            .send_message(&endpoint(&server), &request(), Some(&cred))
            .await
            .unwrap();
        assert_eq!(task.id, "rt-1");
        assert_eq!(task.status, RemoteStatus::Working);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_expired_token_rejection() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tasks")
            .with_status(401)
            .with_body(r#"{"error": "token_expired", "error_description": "Token has expired"}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new().unwrap();
        let cred = credential();
        let err = transport
            .send_message(&endpoint(&server), &request(), Some(&cred))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExpiredToken));
    }

    #[tokio::test]
    async fn test_other_rejections() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/tasks")
            .with_status(401)
            .with_body(r#"{"error": "invalid_token"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/tasks/rt-1")
            .with_status(403)
            .with_body(r#"{"error": "tenant_mismatch"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/tasks/rt-2")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let transport = HttpTransport::new().unwrap();
        let cred = credential();
        let ep = endpoint(&server);

        let err = transport.send_message(&ep, &request(), Some(&cred)).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        let err = transport.get_task(&ep, "rt-1", Some(&cred)).await.unwrap_err();
        assert!(
            matches!(err, Error::TenantMismatch { found: Some(ref t), .. } if t == "tenant-abc")
        );

        let err = transport.get_task(&ep, "rt-2", Some(&cred)).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }
}
