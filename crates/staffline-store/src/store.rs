use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, ErrorCode, TransactionBehavior};
use tracing::debug;

use staffline_core::error::{Result, StafflineError};

use crate::tx::StoreTx;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS templates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    lifecycle TEXT NOT NULL,
    department TEXT,
    role TEXT,
    description TEXT,
    version INTEGER NOT NULL,
    state TEXT NOT NULL,
    steps_json TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    published_at TEXT,
    retired_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_templates_lookup
    ON templates(lifecycle, state);

CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    employee_id TEXT NOT NULL,
    template_id TEXT REFERENCES templates(id),
    lifecycle TEXT NOT NULL,
    stage TEXT NOT NULL,
    status TEXT NOT NULL,
    percentage INTEGER NOT NULL CHECK (percentage BETWEEN 0 AND 100),
    start_date TEXT NOT NULL,
    expected_completion TEXT,
    actual_completion TEXT,
    assignments_json TEXT NOT NULL DEFAULT '{}',
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    cancelled_by TEXT,
    cancel_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_instances_employee
    ON instances(employee_id, created_at);
CREATE INDEX IF NOT EXISTS idx_instances_status
    ON instances(status);

CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
    blueprint_id TEXT,
    order_index INTEGER NOT NULL,
    title TEXT NOT NULL,
    category TEXT NOT NULL,
    kind TEXT NOT NULL,
    integration TEXT,
    status TEXT NOT NULL,
    assignee TEXT,
    due_date TEXT,
    mandatory INTEGER NOT NULL DEFAULT 1,
    max_attempts INTEGER,
    started_at TEXT,
    completed_at TEXT,
    completed_by TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_steps_instance
    ON steps(instance_id, order_index);

CREATE TABLE IF NOT EXISTS step_dependencies (
    step_id TEXT NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
    prerequisite_id TEXT NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    PRIMARY KEY (step_id, prerequisite_id),
    CHECK (step_id <> prerequisite_id)
);

CREATE TABLE IF NOT EXISTS integration_attempts (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
    step_id TEXT NOT NULL REFERENCES steps(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    correlation_id TEXT,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    last_attempt_at TEXT,
    next_retry_at TEXT,
    request_json TEXT,
    response_json TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    CHECK (attempt_count <= max_attempts)
);

CREATE INDEX IF NOT EXISTS idx_attempts_step
    ON integration_attempts(step_id, created_at);
CREATE INDEX IF NOT EXISTS idx_attempts_due
    ON integration_attempts(status, next_retry_at);

CREATE TABLE IF NOT EXISTS exceptions (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL REFERENCES instances(id) ON DELETE CASCADE,
    step_id TEXT REFERENCES steps(id) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    severity TEXT NOT NULL,
    status TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    assignee TEXT,
    opened_by TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    resolved_by TEXT,
    resolved_at TEXT,
    resolution_notes TEXT
);

CREATE INDEX IF NOT EXISTS idx_exceptions_instance
    ON exceptions(instance_id, opened_at);
CREATE INDEX IF NOT EXISTS idx_exceptions_status
    ON exceptions(status);
";

/// SQLite-backed store for templates, instances, steps, attempts and exceptions.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StafflineError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for concurrent readers; busy_timeout before surfacing a conflict
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;",
        )
        .map_err(db_err)?;

        Self::init(conn, Some(path))
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<&Path>) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        match path {
            Some(p) => debug!(path = %p.display(), "SQLite store opened"),
            None => debug!("In-memory SQLite store opened"),
        }
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` inside a read transaction. Nothing it does is committed.
    pub fn read<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StafflineError::Database(e.to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(db_err)?;
        let out = f(&StoreTx::new(&tx));
        drop(tx);
        out
    }

    /// Run `f` inside an immediate write transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls back
    /// every statement `f` executed.
    pub fn write<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StafflineError::Database(e.to_string()))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let out = f(&StoreTx::new(&tx))?;
        tx.commit().map_err(db_err)?;
        Ok(out)
    }
}

/// Map a rusqlite error, surfacing lock contention as a retryable conflict.
pub(crate) fn db_err(e: rusqlite::Error) -> StafflineError {
    match e.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            StafflineError::Conflict(e.to_string())
        }
        _ => StafflineError::Database(e.to_string()),
    }
}
