//! Database schema SQL.

/// Delegated work items.
pub const TASKS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    remote_task_id TEXT,
    session_key TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    service TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    error TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_session ON tasks(session_key);
"#;

/// One live credential per session.
pub const CREDENTIALS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    session_key TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    expires_at INTEGER NOT NULL,
    issued_at INTEGER NOT NULL
);
"#;

/// Authorization redirects awaiting their callback.
pub const PENDING_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pending_authorizations (
    state TEXT PRIMARY KEY,
    session_key TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    task_id TEXT,
    return_url TEXT NOT NULL,
    code_verifier TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_created ON pending_authorizations(created_at);
"#;
