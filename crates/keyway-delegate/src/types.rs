//! Delegation wire types.

use serde::{Deserialize, Serialize};

/// Task status as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteStatus {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Outbound message. `context_id` is the local task id so the backend can
/// correlate follow-ups; neither field names a remote task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub message_id: String,
    pub context_id: String,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(context_id: &str, payload: serde_json::Value) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            context_id: context_id.to_string(),
            payload,
        }
    }
}

/// Body posted to `<service url>/tasks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub message: OutboundMessage,
}

/// A task as the backend describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub id: String,
    pub status: RemoteStatus,
}

/// Backend response envelope: `{"task": {"id", "status"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: RemoteTask,
}
