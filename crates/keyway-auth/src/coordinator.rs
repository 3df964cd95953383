//! Browser login via the authorization-code flow with PKCE.
//!
//! `initiate` parks the task and hands back the provider URL; the callback
//! arrives later as an unrelated request and is matched purely by `state`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use url::Url;

use crate::pkce::{new_state, PkcePair};
use crate::provider::IdentityProvider;
use keyway_core::{Error, ProviderConfig, Result};
use keyway_store::{
    Credential, CredentialStore, PendingAuthStore, PendingAuthorization, TaskId, TaskStatus,
    TaskStore,
};

/// Input to [`AuthorizationCoordinator::initiate`].
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub session_key: String,
    pub tenant_id: String,
    /// Where to send the browser after the callback.
    pub return_url: String,
    /// Task to park in `awaiting_auth` and resume after login.
    pub task_id: Option<TaskId>,
}

/// Outcome of a successful callback.
#[derive(Debug, Clone)]
pub struct CallbackResult {
    pub credential: Credential,
    pub task_id: Option<TaskId>,
    pub return_url: String,
}

pub struct AuthorizationCoordinator {
    config: ProviderConfig,
    provider: Arc<dyn IdentityProvider>,
    tasks: Arc<dyn TaskStore>,
    credentials: Arc<dyn CredentialStore>,
    pending: Arc<dyn PendingAuthStore>,
    state_ttl: chrono::Duration,
}

impl AuthorizationCoordinator {
    pub fn new(
        config: ProviderConfig,
        provider: Arc<dyn IdentityProvider>,
        tasks: Arc<dyn TaskStore>,
        credentials: Arc<dyn CredentialStore>,
        pending: Arc<dyn PendingAuthStore>,
    ) -> Self {
        Self {
            config,
            provider,
            tasks,
            credentials,
            pending,
            state_ttl: chrono::Duration::minutes(30),
        }
    }

    pub fn with_state_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// Record a pending login and return the provider URL to redirect to.
    ///
    /// A `submitted` task moves to `awaiting_auth`. A task that is already
    /// `working` keeps its status while a new credential is obtained.
    pub fn initiate(&self, request: AuthorizationRequest) -> Result<String> {
        if let Some(task_id) = &request.task_id {
            self.park_task(task_id, &request.tenant_id)?;
        }

        let pkce = PkcePair::generate();
        let state = new_state();
        let scope = self.config.scope_param();

        let url = Url::parse_with_params(
            &self.config.authorization_endpoint,
            &[
                ("response_type", "code"),
                ("client_id", self.config.client_id.as_str()),
                ("redirect_uri", self.config.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state.as_str()),
                ("code_challenge", pkce.challenge.as_str()),
                ("code_challenge_method", "S256"),
            ],
        )
        .map_err(|e| Error::Config(format!("Invalid authorization endpoint: {}", e)))?;

        self.pending.insert(PendingAuthorization {
            state,
            session_key: request.session_key.clone(),
            tenant_id: request.tenant_id,
            task_id: request.task_id.clone(),
            return_url: request.return_url,
            code_verifier: pkce.verifier,
            created_at: Utc::now(),
        })?;

        info!(
            session_key = %request.session_key,
            task_id = ?request.task_id.as_ref().map(|t| t.as_str()),
            "Authorization initiated"
        );
        Ok(url.into())
    }

    fn park_task(&self, task_id: &TaskId, tenant_id: &str) -> Result<()> {
        let task = self
            .tasks
            .get(task_id)?
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))?;

        if task.tenant_id != tenant_id {
            return Err(Error::TenantMismatch {
                expected: task.tenant_id,
                found: Some(tenant_id.to_string()),
            });
        }

        match task.status {
            TaskStatus::Submitted => {
                self.tasks.set_status(task_id, TaskStatus::AwaitingAuth)?;
            }
            TaskStatus::AwaitingAuth | TaskStatus::Working => {}
            TaskStatus::Completed | TaskStatus::Failed => {
                return Err(Error::InvalidTransition {
                    from: task.status.to_string(),
                    to: TaskStatus::AwaitingAuth.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Redeem `state`, exchange `code` and store the resulting credential.
    ///
    /// The credential is committed before the task flips to `working`.
    pub async fn complete_callback(&self, code: &str, state: &str) -> Result<CallbackResult> {
        let pending = self.pending.take(state)?.ok_or_else(|| {
            warn!("Callback with unknown or replayed state");
            Error::InvalidState
        })?;

        if Utc::now() - pending.created_at > self.state_ttl {
            warn!(session_key = %pending.session_key, "Callback state expired");
            return Err(Error::InvalidState);
        }

        let tokens = self
            .provider
            .exchange_code(code, &self.config.redirect_uri, &pending.code_verifier)
            .await?;
        let credential =
            tokens.into_credential(&pending.session_key, &pending.tenant_id, None, Utc::now());
        self.credentials
            .put(&pending.session_key, credential.clone())?;

        if let Some(task_id) = &pending.task_id {
            match self.tasks.get(task_id)? {
                Some(task) if !task.status.is_terminal() => {
                    self.tasks.set_status(task_id, TaskStatus::Working)?;
                }
                Some(task) => {
                    warn!(task_id = %task_id, status = %task.status, "Login completed for finished task");
                }
                None => warn!(task_id = %task_id, "Login completed for unknown task"),
            }
        }

        info!(session_key = %pending.session_key, "Authorization completed");
        Ok(CallbackResult {
            credential,
            task_id: pending.task_id,
            return_url: pending.return_url,
        })
    }

    /// Consume `state` after the provider reported `error` (e.g.
    /// `access_denied`) and fail the parked task.
    pub fn reject_callback(&self, state: &str, error: &str) -> Result<Option<TaskId>> {
        let pending = self.pending.take(state)?.ok_or(Error::InvalidState)?;
        warn!(session_key = %pending.session_key, "Authorization rejected: {}", error);

        if let Some(task_id) = &pending.task_id {
            if let Some(task) = self.tasks.get(task_id)? {
                if !task.status.is_terminal() {
                    self.tasks
                        .fail(task_id, &format!("authorization failed: {}", error))?;
                }
            }
        }
        Ok(pending.task_id)
    }

    /// Delete pending states older than the state TTL.
    pub fn prune_expired(&self) -> Result<usize> {
        self.pending.prune(Utc::now() - self.state_ttl)
    }
}
