//! Data types for task records, credentials and pending authorizations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keyway_core::{Error, Result};

/// Locally generated, opaque task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a delegated work item.
///
/// `submitted → awaiting_auth → working → completed`, or straight from
/// `submitted` to `working` when no login is needed. `failed` is terminal and
/// reachable from every non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    AwaitingAuth,
    Working,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::AwaitingAuth => "awaiting_auth",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Submitted => 0,
            Self::AwaitingAuth => 1,
            Self::Working => 2,
            Self::Completed => 3,
            Self::Failed => 4,
        }
    }

    /// Forward moves only; re-asserting a non-terminal status is a no-op.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next.rank() >= self.rank()
    }

    /// Fail with `InvalidTransition` unless `self → next` is legal.
    pub fn check_transition(&self, next: TaskStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "awaiting_auth" => Ok(Self::AwaitingAuth),
            "working" => Ok(Self::Working),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Storage(format!("unknown task status '{}'", other))),
        }
    }
}

/// Durable record of one delegated unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    /// Identifier assigned by the remote service. Immutable once set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_task_id: Option<String>,
    pub session_key: String,
    pub tenant_id: String,
    /// Name of the delegation target.
    pub service: String,
    /// Original request body, replayed on resume.
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`crate::TaskStore::create`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub session_key: String,
    pub tenant_id: String,
    pub service: String,
    pub payload: serde_json::Value,
}

impl NewTask {
    pub(crate) fn into_record(self, now: DateTime<Utc>) -> TaskRecord {
        TaskRecord {
            id: TaskId::generate(),
            status: TaskStatus::Submitted,
            remote_task_id: None,
            session_key: self.session_key,
            tenant_id: self.tenant_id,
            service: self.service,
            payload: self.payload,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Reject empty remote identifiers before touching storage.
pub(crate) fn check_remote_id(id: &TaskId, remote_task_id: &str) -> Result<()> {
    if remote_task_id.trim().is_empty() {
        return Err(Error::IllegalLink(format!(
            "empty remote task id for task {}",
            id
        )));
    }
    Ok(())
}

/// The single live OAuth2 credential of one session.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub session_key: String,
    pub tenant_id: String,
    pub access_token: String,
    pub access_token_expiry: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the access token is expired, or will be within `skew`.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        now + skew >= self.access_token_expiry
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("session_key", &self.session_key)
            .field("tenant_id", &self.tenant_id)
            .field("access_token", &"<redacted>")
            .field("access_token_expiry", &self.access_token_expiry)
            .field("has_refresh_token", &self.has_refresh_token())
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// One outstanding authorization redirect, keyed by its `state` nonce.
#[derive(Clone, PartialEq)]
pub struct PendingAuthorization {
    pub state: String,
    pub session_key: String,
    pub tenant_id: String,
    pub task_id: Option<TaskId>,
    /// Where the browser goes once the callback completes.
    pub return_url: String,
    /// PKCE verifier matching the challenge sent with the redirect.
    pub code_verifier: String,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for PendingAuthorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAuthorization")
            .field("session_key", &self.session_key)
            .field("tenant_id", &self.tenant_id)
            .field("task_id", &self.task_id)
            .field("return_url", &self.return_url)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

pub(crate) fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Current time truncated to the millisecond precision rows are stored at.
pub(crate) fn now() -> DateTime<Utc> {
    from_millis(millis(Utc::now()))
}
