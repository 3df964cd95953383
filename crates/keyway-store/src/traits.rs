//! Store interfaces injected into the coordinator, refresh manager,
//! delegation client and orchestrator.

use chrono::{DateTime, Utc};
use keyway_core::Result;

use crate::types::*;

/// Owner of the TaskRecord lifecycle.
pub trait TaskStore: Send + Sync {
    /// Persist a new record in `submitted`.
    fn create(&self, task: NewTask) -> Result<TaskRecord>;

    fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>>;

    /// Move to `status`; non-monotonic moves fail `InvalidTransition`.
    fn set_status(&self, id: &TaskId, status: TaskStatus) -> Result<TaskRecord>;

    /// Move to `failed`, recording `reason`.
    fn fail(&self, id: &TaskId, reason: &str) -> Result<TaskRecord>;

    /// Record the remote identifier. Fails `IllegalLink` if the task is
    /// already linked or `remote_task_id` is empty.
    fn link_remote(&self, id: &TaskId, remote_task_id: &str) -> Result<TaskRecord>;

    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>>;

    /// Fail every `awaiting_auth` record last touched before `older_than`.
    /// Returns the number of records failed.
    fn fail_stale_awaiting(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

/// Per-session OAuth2 token cache. Exactly one credential per session key.
pub trait CredentialStore: Send + Sync {
    fn get(&self, session_key: &str) -> Result<Option<Credential>>;

    /// Insert or overwrite the credential of `session_key`.
    fn put(&self, session_key: &str, credential: Credential) -> Result<()>;

    /// Remove the credential. Returns whether one existed.
    fn clear(&self, session_key: &str) -> Result<bool>;
}

/// Outstanding authorization redirects awaiting their callback.
pub trait PendingAuthStore: Send + Sync {
    fn insert(&self, pending: PendingAuthorization) -> Result<()>;

    /// Read and delete in one step; a second `take` of the same state
    /// returns `None`.
    fn take(&self, state: &str) -> Result<Option<PendingAuthorization>>;

    /// Delete states created before `older_than`. Returns how many went.
    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

pub(crate) fn check_credential_key(session_key: &str, credential: &Credential) -> Result<()> {
    if credential.session_key != session_key {
        return Err(keyway_core::Error::Internal(format!(
            "credential for session {} stored under {}",
            credential.session_key, session_key
        )));
    }
    Ok(())
}
