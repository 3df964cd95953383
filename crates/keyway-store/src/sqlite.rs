//! SQLite-backed task, credential and pending-login store.
//!
//! One connection behind a mutex; every read-check-write sequence runs inside
//! a transaction while the lock is held, so callers in this process always
//! observe the last committed write.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::schema::{CREDENTIALS_SQL, PENDING_SQL, TASKS_SQL};
use crate::traits::{check_credential_key, CredentialStore, PendingAuthStore, TaskStore};
use crate::types::*;
use keyway_core::{Error, Result};

/// SQLite store implementing every Keyway store trait.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

impl SqliteStore {
    /// Open or create the database file at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Storage(e.to_string()))?;
            }
        }

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };

        let awaiting = store.count_by_status(TaskStatus::AwaitingAuth)?;
        let working = store.count_by_status(TaskStatus::Working)?;
        info!(
            "SqliteStore initialized: {} tasks awaiting login, {} working, path={}",
            awaiting,
            working,
            store.db_path.display()
        );

        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}\n{}", TASKS_SQL, CREDENTIALS_SQL, PENDING_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Count tasks currently in `status`.
    pub fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Task helpers
    // ---------------------------------------------------------------

    fn load_task(conn: &Connection, id: &TaskId) -> Result<Option<TaskRecord>> {
        conn.prepare_cached("SELECT * FROM tasks WHERE id = ?1")
            .map_err(db_err)?
            .query_row(params![id.as_str()], Self::row_to_task)
            .optional()
            .map_err(db_err)
    }

    fn transition(&self, id: &TaskId, status: TaskStatus, error: Option<&str>) -> Result<TaskRecord> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;

        let mut task = Self::load_task(&tx, id)?
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
        task.status.check_transition(status)?;

        if task.status != status || error.is_some() {
            task.status = status;
            task.updated_at = now();
            if let Some(reason) = error {
                task.error = Some(reason.to_string());
            }
            tx.execute(
                "UPDATE tasks SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
                params![task.status.as_str(), task.error, millis(task.updated_at), id.as_str()],
            )
            .map_err(db_err)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(task)
    }

    // ---------------------------------------------------------------
    // Row Mapping Helpers
    // ---------------------------------------------------------------

    fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
        let status: String = row.get("status")?;
        let status = status.parse::<TaskStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let payload_json: String = row.get("payload_json")?;
        let payload = serde_json::from_str(&payload_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(TaskRecord {
            id: TaskId::from(row.get::<_, String>("id")?),
            status,
            remote_task_id: row.get("remote_task_id")?,
            session_key: row.get("session_key")?,
            tenant_id: row.get("tenant_id")?,
            service: row.get("service")?,
            payload,
            error: row.get("error")?,
            created_at: from_millis(row.get("created_at")?),
            updated_at: from_millis(row.get("updated_at")?),
        })
    }

    fn row_to_credential(row: &rusqlite::Row<'_>) -> rusqlite::Result<Credential> {
        Ok(Credential {
            session_key: row.get("session_key")?,
            tenant_id: row.get("tenant_id")?,
            access_token: row.get("access_token")?,
            access_token_expiry: from_millis(row.get("expires_at")?),
            refresh_token: row.get("refresh_token")?,
            issued_at: from_millis(row.get("issued_at")?),
        })
    }

    fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingAuthorization> {
        Ok(PendingAuthorization {
            state: row.get("state")?,
            session_key: row.get("session_key")?,
            tenant_id: row.get("tenant_id")?,
            task_id: row.get::<_, Option<String>>("task_id")?.map(TaskId::from),
            return_url: row.get("return_url")?,
            code_verifier: row.get("code_verifier")?,
            created_at: from_millis(row.get("created_at")?),
        })
    }
}

impl TaskStore for SqliteStore {
    fn create(&self, task: NewTask) -> Result<TaskRecord> {
        let record = task.into_record(now());
        let payload_json = serde_json::to_string(&record.payload)?;

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO tasks (id, status, remote_task_id, session_key, tenant_id, service, \
             payload_json, error, created_at, updated_at) \
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, NULL, ?7, ?8)",
        )
        .map_err(db_err)?
        .execute(params![
            record.id.as_str(),
            record.status.as_str(),
            record.session_key,
            record.tenant_id,
            record.service,
            payload_json,
            millis(record.created_at),
            millis(record.updated_at),
        ])
        .map_err(db_err)?;

        debug!(task_id = %record.id, service = %record.service, "Task created");
        Ok(record)
    }

    fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock();
        Self::load_task(&conn, id)
    }

    fn set_status(&self, id: &TaskId, status: TaskStatus) -> Result<TaskRecord> {
        self.transition(id, status, None)
    }

    fn fail(&self, id: &TaskId, reason: &str) -> Result<TaskRecord> {
        self.transition(id, TaskStatus::Failed, Some(reason))
    }

    fn link_remote(&self, id: &TaskId, remote_task_id: &str) -> Result<TaskRecord> {
        check_remote_id(id, remote_task_id)?;

        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE tasks SET remote_task_id = ?1, updated_at = ?2 \
                 WHERE id = ?3 AND remote_task_id IS NULL",
                params![remote_task_id, millis(now()), id.as_str()],
            )
            .map_err(db_err)?;

        let task = Self::load_task(&conn, id)?
            .ok_or_else(|| Error::NotFound(format!("task {}", id)))?;
        if count == 0 {
            warn!(task_id = %id, "Rejected second remote link");
            return Err(Error::IllegalLink(format!(
                "task {} is already linked to {}",
                id,
                task.remote_task_id.as_deref().unwrap_or_default()
            )));
        }
        Ok(task)
    }

    fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM tasks WHERE status = ?1 ORDER BY created_at")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![status.as_str()], Self::row_to_task)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn fail_stale_awaiting(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE tasks SET status = 'failed', error = 'login abandoned', updated_at = ?1 \
             WHERE status = 'awaiting_auth' AND updated_at < ?2",
            params![millis(now()), millis(older_than)],
        )
        .map_err(db_err)
    }
}

impl CredentialStore for SqliteStore {
    fn get(&self, session_key: &str) -> Result<Option<Credential>> {
        let conn = self.conn.lock();
        let credential = conn
            .prepare_cached("SELECT * FROM credentials WHERE session_key = ?1")
            .map_err(db_err)?
            .query_row(params![session_key], Self::row_to_credential)
            .optional()
            .map_err(db_err)?;
        Ok(credential)
    }

    fn put(&self, session_key: &str, credential: Credential) -> Result<()> {
        check_credential_key(session_key, &credential)?;

        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO credentials (session_key, tenant_id, access_token, refresh_token, expires_at, issued_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(session_key) DO UPDATE SET \
                tenant_id = excluded.tenant_id, \
                access_token = excluded.access_token, \
                refresh_token = excluded.refresh_token, \
                expires_at = excluded.expires_at, \
                issued_at = excluded.issued_at",
        )
        .map_err(db_err)?
        .execute(params![
            session_key,
            credential.tenant_id,
            credential.access_token,
            credential.refresh_token,
            millis(credential.access_token_expiry),
            millis(credential.issued_at),
        ])
        .map_err(db_err)?;
        Ok(())
    }

    fn clear(&self, session_key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let count = conn
            .execute("DELETE FROM credentials WHERE session_key = ?1", params![session_key])
            .map_err(db_err)?;
        Ok(count > 0)
    }
}

impl PendingAuthStore for SqliteStore {
    fn insert(&self, pending: PendingAuthorization) -> Result<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO pending_authorizations \
             (state, session_key, tenant_id, task_id, return_url, code_verifier, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .map_err(db_err)?
        .execute(params![
            pending.state,
            pending.session_key,
            pending.tenant_id,
            pending.task_id.as_ref().map(|t| t.as_str()),
            pending.return_url,
            pending.code_verifier,
            millis(pending.created_at),
        ])
        .map_err(db_err)?;
        Ok(())
    }

    fn take(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let pending = tx
            .prepare_cached("SELECT * FROM pending_authorizations WHERE state = ?1")
            .map_err(db_err)?
            .query_row(params![state], Self::row_to_pending)
            .optional()
            .map_err(db_err)?;
        if pending.is_some() {
            tx.execute(
                "DELETE FROM pending_authorizations WHERE state = ?1",
                params![state],
            )
            .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(pending)
    }

    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM pending_authorizations WHERE created_at < ?1",
            params![millis(older_than)],
        )
        .map_err(db_err)
    }
}
