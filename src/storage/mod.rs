//! Storage abstraction for workflow aggregates, completion records, issue
//! mappings, pending approvals, and the per-issue audit trail.
//!
//! Two drivers: [`file::FileStore`] persists JSON documents with a
//! rename-after-write discipline; the `sqlite` feature adds a relational
//! driver backed by sqlx. Both guarantee that a returned `save_workflow`
//! is durable and that concurrent readers never observe a partially
//! updated workflow.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{CompletionRecord, PendingApproval, Workflow};

pub mod file;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileStore;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Persist the aggregate atomically (all steps together). The store
    /// performs the optimistic-concurrency check against `updated_at` as
    /// loaded, then stamps a fresh `updated_at` before writing.
    /// Returns [`Error::Conflict`] when a concurrent writer got there
    /// first.
    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<()>;

    /// Load by id. [`Error::NotFound`] when absent, [`Error::Corrupt`]
    /// when the payload cannot be parsed.
    async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow>;

    /// Completion records for an issue, newest first.
    async fn list_completions(&self, issue_number: &str) -> Result<Vec<CompletionRecord>>;

    /// Append a completion record, returning the stable id of the stored
    /// row. A record whose `(issue_number, comment_id)` already exists is
    /// a no-op returning the existing id.
    async fn save_completion(&self, record: &CompletionRecord) -> Result<String>;

    /// Active workflow id for an issue, if mapped.
    async fn issue_workflow_id(&self, issue_number: &str) -> Result<Option<String>>;

    /// Map an issue to a workflow. Replaces an existing mapping only when
    /// the previously mapped workflow is terminal (or gone); otherwise
    /// [`Error::ActiveMappingExists`].
    async fn map_issue(&self, issue_number: &str, workflow_id: &str) -> Result<()>;

    async fn set_pending_approval(&self, approval: &PendingApproval) -> Result<()>;

    /// Idempotent.
    async fn clear_pending_approval(&self, issue_number: &str) -> Result<()>;

    async fn pending_approval(&self, issue_number: &str) -> Result<Option<PendingApproval>>;

    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>>;

    /// Append one record to the per-issue audit trail.
    async fn append_audit(
        &self,
        issue_number: &str,
        event_type: &str,
        details: Value,
    ) -> Result<()>;

    /// Whether a completion with this dedup token already exists.
    async fn has_completion(&self, issue_number: &str, comment_id: &str) -> Result<bool> {
        if comment_id.is_empty() {
            return Ok(false);
        }
        let records = self.list_completions(issue_number).await?;
        Ok(records.iter().any(|r| r.comment_id == comment_id))
    }

    /// `map_issue` helper shared by drivers: decide whether an existing
    /// mapping may be replaced.
    async fn mapping_replaceable(&self, previous_workflow_id: &str) -> Result<bool> {
        match self.load_workflow(previous_workflow_id).await {
            Ok(workflow) => Ok(workflow.is_terminal()),
            // A dangling mapping is replaceable; real corruption is not.
            Err(Error::NotFound(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}
