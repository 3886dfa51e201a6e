//! Relational storage driver (sqlx / SQLite).
//!
//! Workflows, completions, and issue mappings live in three tables; the
//! `(issue_number, comment_id)` unique constraint provides completion
//! dedup (empty comment ids are stored as NULL so they never collide).
//! Aggregates are stored as JSON payload columns beside the indexed
//! fields.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::model::{CompletionRecord, PendingApproval, Workflow};
use crate::storage::WorkflowStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    workflow_id   TEXT PRIMARY KEY,
    issue_number  TEXT NOT NULL,
    project_key   TEXT NOT NULL,
    workflow_type TEXT NOT NULL,
    state         TEXT NOT NULL,
    current_step  INTEGER NOT NULL,
    updated_at    TEXT NOT NULL,
    payload_json  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS completions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_number    TEXT NOT NULL,
    completed_agent TEXT NOT NULL,
    next_agent      TEXT NOT NULL DEFAULT '',
    comment_id      TEXT,
    created_at      TEXT NOT NULL,
    payload_json    TEXT NOT NULL,
    UNIQUE(issue_number, comment_id)
);
CREATE TABLE IF NOT EXISTS issue_mappings (
    issue_number TEXT PRIMARY KEY,
    workflow_id  TEXT NOT NULL,
    terminal_at  TEXT
);
CREATE TABLE IF NOT EXISTS pending_approvals (
    issue_number TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_log (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    issue_number TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    details_json TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            database_path.display()
        ))
        .map_err(|e| Error::Config(format!("invalid sqlite path: {e}")))?
        .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::Transient(format!("sqlite connect: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Transient(format!("sqlite connect: {e}")))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Transient(format!("sqlite migration: {e}")))?;
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Transient(format!("sqlite: {e}"))
}

#[async_trait]
impl WorkflowStore for SqliteStore {
    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<()> {
        let previous_updated_at = workflow.updated_at.to_rfc3339();
        workflow.updated_at = Utc::now();
        let payload = serde_json::to_string(workflow)?;

        let updated = sqlx::query(
            "UPDATE workflows SET issue_number = ?, project_key = ?, workflow_type = ?, \
             state = ?, current_step = ?, updated_at = ?, payload_json = ? \
             WHERE workflow_id = ? AND updated_at = ?",
        )
        .bind(&workflow.issue_number)
        .bind(&workflow.project_key)
        .bind(&workflow.workflow_type)
        .bind(workflow.state.as_str())
        .bind(workflow.current_step as i64)
        .bind(workflow.updated_at.to_rfc3339())
        .bind(&payload)
        .bind(&workflow.workflow_id)
        .bind(&previous_updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if updated.rows_affected() > 0 {
            return Ok(());
        }

        let inserted = sqlx::query(
            "INSERT INTO workflows \
             (workflow_id, issue_number, project_key, workflow_type, state, current_step, updated_at, payload_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(workflow_id) DO NOTHING",
        )
        .bind(&workflow.workflow_id)
        .bind(&workflow.issue_number)
        .bind(&workflow.project_key)
        .bind(&workflow.workflow_type)
        .bind(workflow.state.as_str())
        .bind(workflow.current_step as i64)
        .bind(workflow.updated_at.to_rfc3339())
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            return Err(Error::Conflict(format!(
                "workflow {} was modified concurrently",
                workflow.workflow_id
            )));
        }
        Ok(())
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let row = sqlx::query("SELECT payload_json FROM workflows WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Err(Error::NotFound(format!("workflow {workflow_id}")));
        };
        let payload: String = row.get(0);
        serde_json::from_str(&payload)
            .map_err(|e| Error::Corrupt(format!("workflow {workflow_id}: {e}")))
    }

    async fn list_completions(&self, issue_number: &str) -> Result<Vec<CompletionRecord>> {
        let rows = sqlx::query(
            "SELECT payload_json FROM completions WHERE issue_number = ? ORDER BY id DESC",
        )
        .bind(issue_number)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get(0);
            match serde_json::from_str::<CompletionRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping unreadable completion row: {e}"),
            }
        }
        Ok(records)
    }

    async fn save_completion(&self, record: &CompletionRecord) -> Result<String> {
        let payload = serde_json::to_string(record)?;
        let comment_id = if record.comment_id.is_empty() {
            None
        } else {
            Some(record.comment_id.as_str())
        };

        let result = sqlx::query(
            "INSERT INTO completions \
             (issue_number, completed_agent, next_agent, comment_id, created_at, payload_json) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(issue_number, comment_id) DO NOTHING",
        )
        .bind(&record.issue_number)
        .bind(&record.completed_agent)
        .bind(&record.next_agent)
        .bind(comment_id)
        .bind(record.created_at.to_rfc3339())
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid().to_string());
        }

        // Dedup no-op: return the existing row's id.
        let row = sqlx::query(
            "SELECT id FROM completions WHERE issue_number = ? AND comment_id = ?",
        )
        .bind(&record.issue_number)
        .bind(comment_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        let id: i64 = row.get(0);
        Ok(id.to_string())
    }

    async fn issue_workflow_id(&self, issue_number: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT workflow_id FROM issue_mappings WHERE issue_number = ?")
            .bind(issue_number)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn map_issue(&self, issue_number: &str, workflow_id: &str) -> Result<()> {
        if let Some(previous) = self.issue_workflow_id(issue_number).await? {
            if previous != workflow_id && !self.mapping_replaceable(&previous).await? {
                return Err(Error::ActiveMappingExists(issue_number.to_string()));
            }
        }
        sqlx::query(
            "INSERT INTO issue_mappings (issue_number, workflow_id, terminal_at) VALUES (?, ?, NULL) \
             ON CONFLICT(issue_number) DO UPDATE SET workflow_id = excluded.workflow_id, terminal_at = NULL",
        )
        .bind(issue_number)
        .bind(workflow_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_pending_approval(&self, approval: &PendingApproval) -> Result<()> {
        let payload = serde_json::to_string(approval)?;
        sqlx::query(
            "INSERT INTO pending_approvals (issue_number, payload_json) VALUES (?, ?) \
             ON CONFLICT(issue_number) DO UPDATE SET payload_json = excluded.payload_json",
        )
        .bind(&approval.issue_number)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn clear_pending_approval(&self, issue_number: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_approvals WHERE issue_number = ?")
            .bind(issue_number)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn pending_approval(&self, issue_number: &str) -> Result<Option<PendingApproval>> {
        let row = sqlx::query("SELECT payload_json FROM pending_approvals WHERE issue_number = ?")
            .bind(issue_number)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => {
                let payload: String = row.get(0);
                serde_json::from_str(&payload)
                    .map(Some)
                    .map_err(|e| Error::Corrupt(format!("pending approval: {e}")))
            }
            None => Ok(None),
        }
    }

    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        let rows = sqlx::query("SELECT payload_json FROM pending_approvals")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut approvals = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: String = row.get(0);
            match serde_json::from_str(&payload) {
                Ok(approval) => approvals.push(approval),
                Err(e) => tracing::warn!("Skipping unreadable pending approval: {e}"),
            }
        }
        Ok(approvals)
    }

    async fn append_audit(
        &self,
        issue_number: &str,
        event_type: &str,
        details: Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (issue_number, event_type, details_json, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(issue_number)
        .bind(event_type)
        .bind(details.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}
