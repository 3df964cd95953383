//! Runtime types.

use serde::{Deserialize, Serialize};

use keyway_store::{NewTask, TaskRecord};

/// Body of a task submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub session_key: String,
    pub tenant_id: String,
    pub service: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl From<SubmitRequest> for NewTask {
    fn from(req: SubmitRequest) -> Self {
        NewTask {
            session_key: req.session_key,
            tenant_id: req.tenant_id,
            service: req.service,
            payload: req.payload,
        }
    }
}

/// Result of one delegation attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The backend accepted the task and assigned `remote_task_id`.
    Delegated {
        task: TaskRecord,
        remote_task_id: String,
    },
    /// The task is parked until the user logs in at `redirect_url`.
    AuthRequired { task: TaskRecord, redirect_url: String },
    /// The task was failed.
    Failed { task: TaskRecord, reason: String },
}

impl Outcome {
    pub fn task(&self) -> &TaskRecord {
        match self {
            Self::Delegated { task, .. } | Self::AuthRequired { task, .. } | Self::Failed { task, .. } => {
                task
            }
        }
    }
}

/// Result of polling the backend for a delegated task.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Progress {
    /// The local record after applying the backend's status.
    Current { task: TaskRecord },
    /// The stored credential can no longer be used; the task keeps its
    /// status while the user logs in at `redirect_url`.
    AuthRequired { task: TaskRecord, redirect_url: String },
}

impl Progress {
    pub fn task(&self) -> &TaskRecord {
        match self {
            Self::Current { task } | Self::AuthRequired { task, .. } => task,
        }
    }
}

/// What a maintenance sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// `awaiting_auth` tasks failed for exceeding the retention.
    #[serde(rename = "failedTasks")]
    pub failed_tasks: usize,
    /// Pending authorization states older than the state TTL.
    #[serde(rename = "prunedStates")]
    pub pruned_states: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_request_payload_defaults_to_null() {
        let req: SubmitRequest = serde_json::from_value(serde_json::json!({
            "session_key": "s1", "tenant_id": "tenant-abc", "service": "horizon"
        }))
        .unwrap();
        let task: NewTask = req.into();
        assert!(task.payload.is_null());
        assert_eq!(task.service, "horizon");
    }
}
