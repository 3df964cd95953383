//! Delegation client: resolves the target service, sends the task and
//! captures the backend-assigned identifier.

use std::sync::Arc;

use tracing::info;

use crate::transport::Transport;
use crate::types::{OutboundMessage, RemoteTask, SendMessageRequest};
use keyway_core::{Error, Result, ServiceEndpoint, ServiceTable};
use keyway_store::{Credential, TaskRecord, TaskStore};

pub struct DelegationClient {
    transport: Arc<dyn Transport>,
    services: ServiceTable,
    tasks: Arc<dyn TaskStore>,
}

impl DelegationClient {
    pub fn new(transport: Arc<dyn Transport>, services: ServiceTable, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            transport,
            services,
            tasks,
        }
    }

    pub fn service(&self, name: &str) -> Result<&ServiceEndpoint> {
        self.services
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("service {}", name)))
    }

    /// Whether calls to `service` must carry a credential.
    pub fn requires_auth(&self, service: &str) -> Result<bool> {
        Ok(self.service(service)?.requires_auth)
    }

    /// Send `payload` to `service`. Fails `AuthRequired` before any I/O when
    /// the service is protected and no credential is given.
    pub async fn send(
        &self,
        service: &str,
        context_id: &str,
        payload: serde_json::Value,
        credential: Option<&Credential>,
    ) -> Result<RemoteTask> {
        let endpoint = self.service(service)?;
        if endpoint.requires_auth && credential.is_none() {
            return Err(Error::AuthRequired {
                session_key: String::new(),
            });
        }

        let request = SendMessageRequest {
            message: OutboundMessage::new(context_id, payload),
        };
        let remote = self
            .transport
            .send_message(endpoint, &request, credential)
            .await?;
        if remote.id.trim().is_empty() {
            return Err(Error::Delegation(format!(
                "{} accepted the task without assigning an id",
                endpoint.name
            )));
        }
        Ok(remote)
    }

    /// Send a stored task and link the remote identifier to it.
    pub async fn dispatch(&self, task: &TaskRecord, credential: Option<&Credential>) -> Result<RemoteTask> {
        if let Some(cred) = credential {
            if cred.tenant_id != task.tenant_id {
                return Err(Error::TenantMismatch {
                    expected: task.tenant_id.clone(),
                    found: Some(cred.tenant_id.clone()),
                });
            }
        }

        let remote = self
            .send(&task.service, task.id.as_str(), task.payload.clone(), credential)
            .await
            .map_err(|e| match e {
                Error::AuthRequired { .. } => Error::AuthRequired {
                    session_key: task.session_key.clone(),
                },
                other => other,
            })?;

        self.tasks.link_remote(&task.id, &remote.id)?;
        info!(task_id = %task.id, remote_task_id = %remote.id, service = %task.service, "Task delegated");
        Ok(remote)
    }

    /// Current remote view of a linked task.
    pub async fn remote_status(&self, task: &TaskRecord, credential: Option<&Credential>) -> Result<RemoteTask> {
        let remote_id = task
            .remote_task_id
            .as_deref()
            .ok_or_else(|| Error::Delegation(format!("task {} has no remote task yet", task.id)))?;
        let endpoint = self.service(&task.service)?;
        if endpoint.requires_auth && credential.is_none() {
            return Err(Error::AuthRequired {
                session_key: task.session_key.clone(),
            });
        }
        self.transport.get_task(endpoint, remote_id, credential).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RemoteStatus;
    use async_trait::async_trait;
    use keyway_store::{MemoryStore, NewTask};
    use parking_lot::Mutex;

    /// Replies with a fixed id and records what was sent.
    struct RecordingTransport {
        reply_id: String,
        sent: Mutex<Vec<(SendMessageRequest, Option<String>)>>,
    }

    impl RecordingTransport {
        fn new(reply_id: &str) -> Self {
            Self {
                reply_id: reply_id.into(),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_message(
            &self,
            _endpoint: &ServiceEndpoint,
            request: &SendMessageRequest,
            credential: Option<&Credential>,
        ) -> Result<RemoteTask> {
            self.sent
                .lock()
                .push((request.clone(), credential.map(|c| c.access_token.clone())));
            Ok(RemoteTask {
                id: self.reply_id.clone(),
                status: RemoteStatus::Working,
            })
        }

        async fn get_task(
            &self,
            _endpoint: &ServiceEndpoint,
            remote_task_id: &str,
            _credential: Option<&Credential>,
        ) -> Result<RemoteTask> {
            Ok(RemoteTask {
                id: remote_task_id.into(),
                status: RemoteStatus::Completed,
            })
        }
    }

    fn services() -> ServiceTable {
        ServiceTable::new([
            ServiceEndpoint {
                name: "horizon".into(),
                url: "http://localhost:8000".into(),
                requires_auth: true,
            },
            ServiceEndpoint {
                name: "weather".into(),
                url: "http://localhost:8001".into(),
                requires_auth: false,
            },
        ])
    }

    fn credential(tenant: &str) -> Credential {
        let now = chrono::Utc::now();
        Credential {
            session_key: "s1".into(),
            tenant_id: tenant.into(),
            access_token: "at-1".into(),
            access_token_expiry: now + chrono::Duration::hours(1),
            refresh_token: None,
            issued_at: now,
        }
    }

    fn setup(reply_id: &str) -> (DelegationClient, Arc<RecordingTransport>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(RecordingTransport::new(reply_id));
        let client = DelegationClient::new(transport.clone(), services(), store.clone());
        (client, transport, store)
    }

    fn task(store: &MemoryStore, service: &str) -> TaskRecord {
        store
            .create(NewTask {
                session_key: "s1".into(),
                tenant_id: "tenant-abc".into(),
                service: service.into(),
                payload: serde_json::json!({"text": "hi"}),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_protected_service_without_credential_sends_nothing() {
        let (client, transport, store) = setup("rt-1");
        let task = task(&store, "horizon");

        let err = client.dispatch(&task, None).await.unwrap_err();
        assert!(matches!(err, Error::AuthRequired { ref session_key } if session_key == "s1"));
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_links_remote_id() {
        let (client, transport, store) = setup("rt-1");
        let task = task(&store, "horizon");
        let cred = credential("tenant-abc");

        let remote = client.dispatch(&task, Some(&cred)).await.unwrap();
        assert_eq!(remote.id, "rt-1");
        let stored = store.get(&task.id).unwrap().unwrap();
        assert_eq!(stored.remote_task_id.as_deref(), Some("rt-1"));

        let sent = transport.sent.lock();
        assert_eq!(sent[0].0.message.context_id, task.id.as_str());
        assert_eq!(sent[0].1.as_deref(), Some("at-1"));
    }

    #[tokio::test]
    async fn test_second_dispatch_cannot_relink() {
        let (client, _transport, store) = setup("rt-1");
        let task = task(&store, "horizon");
        let cred = credential("tenant-abc");

        client.dispatch(&task, Some(&cred)).await.unwrap();
        let err = client.dispatch(&task, Some(&cred)).await.unwrap_err();
        assert!(matches!(err, Error::IllegalLink(_)));
    }

    #[tokio::test]
    async fn test_open_service_needs_no_credential() {
        let (client, transport, store) = setup("wx-1");
        let task = task(&store, "weather");
        client.dispatch(&task, None).await.unwrap();
        assert_eq!(transport.sent.lock()[0].1, None);
    }

    #[tokio::test]
    async fn test_empty_remote_id_is_rejected() {
        let (client, _transport, store) = setup("");
        let task = task(&store, "weather");
        let err = client.dispatch(&task, None).await.unwrap_err();
        assert!(matches!(err, Error::Delegation(_)));
        assert!(store.get(&task.id).unwrap().unwrap().remote_task_id.is_none());
    }

    #[tokio::test]
    async fn test_foreign_tenant_credential_is_refused() {
        let (client, transport, store) = setup("rt-1");
        let task = task(&store, "horizon");
        let err = client
            .dispatch(&task, Some(&credential("tenant-x")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TenantMismatch { .. }));
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let (client, _transport, store) = setup("rt-1");
        let task = task(&store, "nowhere");
        assert!(matches!(client.dispatch(&task, None).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remote_status_requires_link() {
        let (client, _transport, store) = setup("rt-1");
        let task = task(&store, "weather");
        assert!(client.remote_status(&task, None).await.is_err());

        let linked = store.link_remote(&task.id, "wx-9").unwrap();
        let remote = client.remote_status(&linked, None).await.unwrap();
        assert_eq!(remote.status, RemoteStatus::Completed);
    }
}
