//! Orchestrator: submits tasks to backends and carries them across
//! browser logins and token refreshes.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use keyway_auth::{AuthorizationCoordinator, AuthorizationRequest, CallbackResult, TokenRefreshManager};
use keyway_core::{Error, Result};
use keyway_delegate::{DelegationClient, RemoteStatus, RemoteTask};
use keyway_store::{Credential, TaskId, TaskRecord, TaskStatus, TaskStore};

use crate::types::*;

pub struct Orchestrator {
    tasks: Arc<dyn TaskStore>,
    coordinator: Arc<AuthorizationCoordinator>,
    refresh: Arc<TokenRefreshManager>,
    delegation: DelegationClient,
    public_url: String,
    refresh_skew: chrono::Duration,
    in_flight: DashMap<TaskId, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        coordinator: Arc<AuthorizationCoordinator>,
        refresh: Arc<TokenRefreshManager>,
        delegation: DelegationClient,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            tasks,
            coordinator,
            refresh,
            delegation,
            public_url: public_url.into().trim_end_matches('/').to_string(),
            refresh_skew: chrono::Duration::seconds(30),
            in_flight: DashMap::new(),
        }
    }

    /// Refresh access tokens that expire within `skew` before using them.
    pub fn with_refresh_skew(mut self, skew: chrono::Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    pub fn task(&self, task_id: &TaskId) -> Result<TaskRecord> {
        self.tasks
            .get(task_id)?
            .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
    }

    /// Create a task and attempt its delegation.
    ///
    /// Unknown services fail `NotFound` before a record is written.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Outcome> {
        self.delegation.service(&request.service)?;
        let task = self.tasks.create(request.into())?;
        info!(task_id = %task.id, service = %task.service, "Task submitted");
        self.attempt(task).await
    }

    /// Attempt a stored task again, typically after a login.
    ///
    /// A task that already has a remote identifier is never sent twice.
    pub async fn resume(&self, task_id: &TaskId) -> Result<Outcome> {
        let lock = self.task_lock(task_id);
        let guard = lock.lock().await;
        let result = self.resume_locked(task_id).await;
        drop(guard);
        self.release(task_id, lock);
        result
    }

    async fn resume_locked(&self, task_id: &TaskId) -> Result<Outcome> {
        let task = self.task(task_id)?;
        if let Some(remote_task_id) = task.remote_task_id.clone() {
            debug!(task_id = %task.id, "Task already delegated");
            return Ok(Outcome::Delegated {
                task,
                remote_task_id,
            });
        }
        match task.status {
            TaskStatus::Failed => {
                let reason = task.error.clone().unwrap_or_default();
                Ok(Outcome::Failed { task, reason })
            }
            TaskStatus::Completed => Err(Error::InvalidTransition {
                from: task.status.to_string(),
                to: TaskStatus::Working.to_string(),
            }),
            _ => self.attempt(task).await,
        }
    }

    /// Redeem a login callback, then resume the task it was started for.
    ///
    /// The credential is stored even if the resumed attempt fails; that
    /// failure is recorded on the task.
    pub async fn complete_login(&self, code: &str, state: &str) -> Result<CallbackResult> {
        let result = self.coordinator.complete_callback(code, state).await?;
        if let Some(task_id) = &result.task_id {
            match self.resume(task_id).await {
                Ok(outcome) => debug!(
                    task_id = %task_id,
                    task_status = %outcome.task().status,
                    "Task resumed after login"
                ),
                Err(e) => warn!(task_id = %task_id, "Resume after login failed: {}", e),
            }
        }
        Ok(result)
    }

    /// The provider answered the login with an error; fail the parked task.
    pub fn reject_login(&self, state: &str, error: &str) -> Result<Option<TaskId>> {
        self.coordinator.reject_callback(state, error)
    }

    /// Poll the backend for a delegated task and settle the local record.
    ///
    /// An expired token is refreshed once. A credential that cannot be
    /// refreshed yields a login redirect without parking the task.
    pub async fn refresh_status(&self, task_id: &TaskId) -> Result<Progress> {
        let lock = self.task_lock(task_id);
        let guard = lock.lock().await;
        let result = self.refresh_status_locked(task_id).await;
        drop(guard);
        self.release(task_id, lock);
        result
    }

    async fn refresh_status_locked(&self, task_id: &TaskId) -> Result<Progress> {
        let task = self.task(task_id)?;
        if task.status.is_terminal() || task.remote_task_id.is_none() {
            return Ok(Progress::Current { task });
        }

        let credential = match self.credential_for(&task).await {
            Ok(credential) => credential,
            Err(e) => return self.settle_poll(&task, e),
        };
        let remote = match self.delegation.remote_status(&task, credential.as_ref()).await {
            Ok(remote) => remote,
            Err(Error::ExpiredToken) => {
                let rotated = match self
                    .refresh
                    .on_auth_failure(&task.session_key, &task.tenant_id)
                    .await
                {
                    Ok(credential) => credential,
                    Err(e) => return self.settle_poll(&task, e),
                };
                match self.delegation.remote_status(&task, Some(&rotated)).await {
                    Ok(remote) => remote,
                    Err(Error::ExpiredToken) | Err(Error::Unauthorized(_)) => {
                        warn!(task_id = %task.id, "Refreshed token rejected while polling");
                        return Err(Error::Unauthorized(format!(
                            "{} rejected the refreshed token",
                            task.service
                        )));
                    }
                    Err(e) => return self.settle_poll(&task, e),
                }
            }
            Err(e) => return self.settle_poll(&task, e),
        };
        Ok(Progress::Current {
            task: self.apply_remote_status(&task.id, remote.status)?,
        })
    }

    fn settle_poll(&self, task: &TaskRecord, error: Error) -> Result<Progress> {
        match error {
            Error::AuthRequired { .. } | Error::NoRefreshToken(_) | Error::Unauthorized(_) => {
                let redirect_url = self.login_redirect(task)?;
                Ok(Progress::AuthRequired {
                    task: self.task(&task.id)?,
                    redirect_url,
                })
            }
            Error::TenantMismatch { .. } => self.reject_tenant(task, error),
            other => Err(other),
        }
    }

    /// Fail tasks parked in `awaiting_auth` longer than `retention` and
    /// drop expired login states.
    pub fn sweep(&self, retention: chrono::Duration) -> Result<SweepReport> {
        let report = SweepReport {
            failed_tasks: self.tasks.fail_stale_awaiting(Utc::now() - retention)?,
            pruned_states: self.coordinator.prune_expired()?,
        };
        info!(
            "Sweep complete: {} abandoned tasks failed, {} login states pruned",
            report.failed_tasks, report.pruned_states
        );
        Ok(report)
    }

    // ---------------------------------------------------------------
    // Delegation attempt
    // ---------------------------------------------------------------

    async fn attempt(&self, task: TaskRecord) -> Result<Outcome> {
        let credential = match self.credential_for(&task).await {
            Ok(credential) => credential,
            Err(e) => return self.settle(&task, e),
        };

        match self.delegation.dispatch(&task, credential.as_ref()).await {
            Ok(remote) => self.delegated(&task, remote),
            Err(Error::ExpiredToken) => self.retry_after_refresh(&task).await,
            Err(e) => self.settle(&task, e),
        }
    }

    /// Rotate the credential and send once more. A second rejection fails
    /// the task.
    async fn retry_after_refresh(&self, task: &TaskRecord) -> Result<Outcome> {
        info!(task_id = %task.id, service = %task.service, "Access token expired; refreshing");
        let rotated = match self
            .refresh
            .on_auth_failure(&task.session_key, &task.tenant_id)
            .await
        {
            Ok(credential) => credential,
            Err(e) => return self.settle(task, e),
        };

        match self.delegation.dispatch(task, Some(&rotated)).await {
            Ok(remote) => self.delegated(task, remote),
            Err(Error::ExpiredToken) | Err(Error::Unauthorized(_)) => self.give_up(
                task,
                Error::Unauthorized(format!("{} rejected the refreshed token", task.service)),
            ),
            Err(e) => self.settle(task, e),
        }
    }

    async fn credential_for(&self, task: &TaskRecord) -> Result<Option<Credential>> {
        if !self.delegation.requires_auth(&task.service)? {
            return Ok(None);
        }
        self.refresh
            .usable_credential(&task.session_key, &task.tenant_id, self.refresh_skew)
            .await
    }

    fn settle(&self, task: &TaskRecord, error: Error) -> Result<Outcome> {
        match error {
            Error::AuthRequired { .. } | Error::NoRefreshToken(_) | Error::Unauthorized(_) => {
                self.request_login(task)
            }
            Error::TenantMismatch { .. } => self.reject_tenant(task, error),
            Error::IllegalLink(_)
            | Error::InvalidTransition { .. }
            | Error::Database(_)
            | Error::Storage(_)
            | Error::Internal(_) => Err(error),
            other => self.give_up(task, other),
        }
    }

    /// A foreign-tenant credential is fatal to the task wherever it shows up.
    fn reject_tenant<T>(&self, task: &TaskRecord, error: Error) -> Result<T> {
        warn!(task_id = %task.id, "Tenant mismatch: {}", error);
        self.tasks.fail(&task.id, &error.to_string())?;
        Err(error)
    }

    fn request_login(&self, task: &TaskRecord) -> Result<Outcome> {
        let redirect_url = self.login_redirect(task)?;
        Ok(Outcome::AuthRequired {
            task: self.task(&task.id)?,
            redirect_url,
        })
    }

    fn login_redirect(&self, task: &TaskRecord) -> Result<String> {
        let redirect_url = self.coordinator.initiate(AuthorizationRequest {
            session_key: task.session_key.clone(),
            tenant_id: task.tenant_id.clone(),
            return_url: format!("{}/api/tasks/{}", self.public_url, task.id),
            task_id: Some(task.id.clone()),
        })?;
        info!(task_id = %task.id, "Login requested for task");
        Ok(redirect_url)
    }

    fn delegated(&self, task: &TaskRecord, remote: RemoteTask) -> Result<Outcome> {
        let task = self.apply_remote_status(&task.id, remote.status)?;
        Ok(Outcome::Delegated {
            task,
            remote_task_id: remote.id,
        })
    }

    fn give_up(&self, task: &TaskRecord, error: Error) -> Result<Outcome> {
        let reason = error.to_string();
        warn!(task_id = %task.id, service = %task.service, "Task failed: {}", reason);
        let task = self.tasks.fail(&task.id, &reason)?;
        Ok(Outcome::Failed { task, reason })
    }

    fn apply_remote_status(&self, task_id: &TaskId, status: RemoteStatus) -> Result<TaskRecord> {
        match status {
            RemoteStatus::Completed => self.tasks.set_status(task_id, TaskStatus::Completed),
            RemoteStatus::Failed | RemoteStatus::Canceled => {
                self.tasks.fail(task_id, &format!("remote task {}", status))
            }
            _ => self.tasks.set_status(task_id, TaskStatus::Working),
        }
    }

    // ---------------------------------------------------------------
    // Per-task serialization
    // ---------------------------------------------------------------

    fn task_lock(&self, task_id: &TaskId) -> Arc<Mutex<()>> {
        self.in_flight
            .entry(task_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry unless another caller is queued on it.
    fn release(&self, task_id: &TaskId, lock: Arc<Mutex<()>>) {
        self.in_flight
            .remove_if(task_id, |_, entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2);
    }
}
