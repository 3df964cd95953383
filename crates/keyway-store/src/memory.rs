//! In-process store with the same semantics as [`crate::SqliteStore`].
//!
//! Used by tests and by embedders that do not need durability.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::traits::{check_credential_key, CredentialStore, PendingAuthStore, TaskStore};
use crate::types::*;
use keyway_core::{Error, Result};

#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    credentials: RwLock<HashMap<String, Credential>>,
    pending: RwLock<HashMap<String, PendingAuthorization>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(&self, id: &TaskId, status: TaskStatus, error: Option<&str>) -> Result<TaskRecord> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
        task.status.check_transition(status)?;

        if task.status != status || error.is_some() {
            task.status = status;
            task.updated_at = now();
            if let Some(reason) = error {
                task.error = Some(reason.to_string());
            }
        }
        Ok(task.clone())
    }
}

impl TaskStore for MemoryStore {
    fn create(&self, task: NewTask) -> Result<TaskRecord> {
        let record = task.into_record(now());
        self.tasks.write().insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        Ok(self.tasks.read().get(id).cloned())
    }

    fn set_status(&self, id: &TaskId, status: TaskStatus) -> Result<TaskRecord> {
        self.transition(id, status, None)
    }

    fn fail(&self, id: &TaskId, reason: &str) -> Result<TaskRecord> {
        self.transition(id, TaskStatus::Failed, Some(reason))
    }

    fn link_remote(&self, id: &TaskId, remote_task_id: &str) -> Result<TaskRecord> {
        check_remote_id(id, remote_task_id)?;

        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
        if let Some(existing) = &task.remote_task_id {
            return Err(Error::IllegalLink(format!(
                "task {} is already linked to {}",
                id, existing
            )));
        }
        task.remote_task_id = Some(remote_task_id.to_string());
        task.updated_at = now();
        Ok(task.clone())
    }

    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let mut matching: Vec<TaskRecord> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.created_at);
        Ok(matching)
    }

    fn fail_stale_awaiting(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let now = now();
        let mut failed = 0;
        for task in self.tasks.write().values_mut() {
            if task.status == TaskStatus::AwaitingAuth && task.updated_at < older_than {
                task.status = TaskStatus::Failed;
                task.error = Some("login abandoned".to_string());
                task.updated_at = now;
                failed += 1;
            }
        }
        Ok(failed)
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, session_key: &str) -> Result<Option<Credential>> {
        Ok(self.credentials.read().get(session_key).cloned())
    }

    fn put(&self, session_key: &str, credential: Credential) -> Result<()> {
        check_credential_key(session_key, &credential)?;
        self.credentials
            .write()
            .insert(session_key.to_string(), credential);
        Ok(())
    }

    fn clear(&self, session_key: &str) -> Result<bool> {
        Ok(self.credentials.write().remove(session_key).is_some())
    }
}

impl PendingAuthStore for MemoryStore {
    fn insert(&self, pending: PendingAuthorization) -> Result<()> {
        let mut map = self.pending.write();
        if map.contains_key(&pending.state) {
            return Err(Error::Database(format!("duplicate state {}", pending.state)));
        }
        map.insert(pending.state.clone(), pending);
        Ok(())
    }

    fn take(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        Ok(self.pending.write().remove(state))
    }

    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut map = self.pending.write();
        let before = map.len();
        map.retain(|_, p| p.created_at >= older_than);
        Ok(before - map.len())
    }
}
