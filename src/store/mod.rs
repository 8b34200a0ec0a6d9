//! SQLite persistence for projects, documents, tasks, and history.
//!
//! All access goes through `DbHandle`, which wraps the connection behind
//! `Arc<Mutex>` and runs closures on tokio's blocking thread pool so
//! synchronous SQLite I/O never ties up async worker threads. Nested
//! sequences (approval history, version trails, checklists) are stored as
//! JSON text columns; every mutable row carries a `record_version` counter
//! for optimistic concurrency.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use uuid::Uuid;

use crate::errors::{WorkflowError, WorkflowResult};
use crate::project::HistoryEntry;

mod projects;
mod tasks;

/// Async-safe handle to the workflow database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<WorkflowDb>>,
}

impl DbHandle {
    pub fn new(db: WorkflowDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> WorkflowResult<R>
    where
        F: FnOnce(&WorkflowDb) -> WorkflowResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| WorkflowError::Database(anyhow::anyhow!("DB lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| WorkflowError::Database(anyhow::anyhow!("DB task panicked: {}", e)))?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests; must not be called from a hot async path.
    pub fn lock_sync(&self) -> WorkflowResult<std::sync::MutexGuard<'_, WorkflowDb>> {
        self.inner
            .lock()
            .map_err(|e| WorkflowError::Database(anyhow::anyhow!("DB lock poisoned: {}", e)))
    }
}

pub struct WorkflowDb {
    conn: Connection,
}

impl WorkflowDb {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> WorkflowResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> WorkflowResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> WorkflowResult<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()?;
        Ok(())
    }

    fn run_migrations(&self) -> WorkflowResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                workflow_phase TEXT NOT NULL DEFAULT 'documentation',
                workflow_step INTEGER NOT NULL DEFAULT 1,
                inventory_created INTEGER NOT NULL DEFAULT 0,
                procurement_initiated INTEGER NOT NULL DEFAULT 0,
                financial_setup INTEGER NOT NULL DEFAULT 0,
                approval_chain TEXT NOT NULL DEFAULT '[]',
                required_documents TEXT NOT NULL DEFAULT '[]',
                record_version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                project_id TEXT NOT NULL REFERENCES projects(id),
                document_type TEXT NOT NULL,
                record TEXT NOT NULL,
                record_version INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (project_id, document_type)
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id),
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                department TEXT NOT NULL,
                assignee TEXT NOT NULL,
                workflow_phase TEXT NOT NULL,
                workflow_step INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress INTEGER NOT NULL DEFAULT 0,
                checklist TEXT NOT NULL DEFAULT '[]',
                due_date TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                completed_by TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                record_version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL REFERENCES projects(id),
                phase TEXT NOT NULL,
                action TEXT NOT NULL,
                triggered_by TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_project_phase
                ON tasks(project_id, workflow_phase);
            CREATE INDEX IF NOT EXISTS idx_history_project
                ON workflow_history(project_id);
            ",
        )?;
        Ok(())
    }

    // ── Workflow history (append-only) ────────────────────────────────────

    pub fn append_history(&self, entry: &HistoryEntry) -> WorkflowResult<()> {
        self.conn.execute(
            "INSERT INTO workflow_history (project_id, phase, action, triggered_by, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                entry.project_id.to_string(),
                entry.phase.as_str(),
                entry.action,
                entry.triggered_by,
                serde_json::to_string(&entry.metadata)?,
                entry.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn history(&self, project_id: Uuid) -> WorkflowResult<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, phase, action, triggered_by, metadata, created_at
             FROM workflow_history WHERE project_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([project_id.to_string()], |row| {
            Ok(HistoryEntry {
                project_id: parse_uuid(0, row.get(0)?)?,
                phase: parse_phase(1, row.get(1)?)?,
                action: row.get(2)?,
                triggered_by: row.get(3)?,
                metadata: parse_json(4, row.get(4)?)?,
                timestamp: parse_timestamp(5, row.get(5)?)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

// ── Row conversion helpers ────────────────────────────────────────────────
//
// rusqlite's mapping closures must return `rusqlite::Error`; these wrap the
// domain parse failures in `FromSqlConversionFailure` so a corrupt row
// surfaces as a database error with the offending column index.

pub(crate) fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

pub(crate) fn parse_uuid(idx: usize, s: String) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_opt_uuid(idx: usize, s: Option<String>) -> rusqlite::Result<Option<Uuid>> {
    s.map(|s| parse_uuid(idx, s)).transpose()
}

pub(crate) fn parse_timestamp(
    idx: usize,
    s: String,
) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_opt_timestamp(
    idx: usize,
    s: Option<String>,
) -> rusqlite::Result<Option<chrono::DateTime<chrono::Utc>>> {
    s.map(|s| parse_timestamp(idx, s)).transpose()
}

pub(crate) fn parse_phase(idx: usize, s: String) -> rusqlite::Result<crate::phase::WorkflowPhase> {
    s.parse().map_err(|e: String| conversion_error(idx, e))
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    idx: usize,
    s: String,
) -> rusqlite::Result<T> {
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::WorkflowPhase;
    use chrono::Utc;

    #[test]
    fn test_migrations_are_idempotent() {
        let db = WorkflowDb::open_in_memory().unwrap();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();
    }

    #[test]
    fn test_history_is_append_only_and_ordered() {
        let db = WorkflowDb::open_in_memory().unwrap();
        let project = crate::project::ProjectWorkflow::new(
            "P",
            vec![crate::project::ApprovalLevel {
                level: "hod".into(),
                department: "Operations".into(),
                approver: None,
            }],
            vec![],
            Utc::now(),
        )
        .unwrap();
        db.insert_project(&project).unwrap();

        for action in ["document_submitted", "document_approved", "inventory_creation_triggered"] {
            db.append_history(&HistoryEntry::new(
                project.id,
                WorkflowPhase::Documentation,
                action,
                "auto",
                serde_json::json!({}),
                Utc::now(),
            ))
            .unwrap();
        }

        let entries = db.history(project.id).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].action, "document_submitted");
        assert_eq!(entries[2].action, "inventory_creation_triggered");
    }

    #[test]
    fn test_lock_sync_gives_direct_access() {
        let handle = DbHandle::new(WorkflowDb::open_in_memory().unwrap());
        let guard = handle.lock_sync().unwrap();
        guard.run_migrations().unwrap();
    }

    #[tokio::test]
    async fn test_db_handle_call_runs_closure() {
        let handle = DbHandle::new(WorkflowDb::open_in_memory().unwrap());
        let count: i64 = handle
            .call(|db| {
                Ok(db
                    .conn
                    .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
