//! Filesystem storage driver.
//!
//! Layout under the storage root:
//!
//! ```text
//! workflows/<workflow_id>.json
//! completions/<issue>/<sequence>.json
//! mappings.json
//! pending_approvals.json
//! audit/<issue>.jsonl
//! ```
//!
//! Every document write goes to a temporary file first and is renamed
//! into place, so a concurrent reader sees either the old or the new
//! payload, never a torn one.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::model::{CompletionRecord, PendingApproval, Workflow};
use crate::storage::WorkflowStore;

pub struct FileStore {
    root: PathBuf,
    // Serializes read-modify-write cycles on the shared documents
    // (mappings, pending approvals) and completion sequence assignment.
    write_lock: Mutex<()>,
}

impl FileStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("workflows")).await?;
        fs::create_dir_all(root.join("completions")).await?;
        fs::create_dir_all(root.join("audit")).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn workflow_path(&self, workflow_id: &str) -> PathBuf {
        self.root.join("workflows").join(format!("{workflow_id}.json"))
    }

    fn completions_dir(&self, issue_number: &str) -> PathBuf {
        self.root.join("completions").join(issue_number)
    }

    fn mappings_path(&self) -> PathBuf {
        self.root.join("mappings.json")
    }

    fn approvals_path(&self) -> PathBuf {
        self.root.join("pending_approvals.json")
    }

    fn audit_path(&self, issue_number: &str) -> PathBuf {
        self.root.join("audit").join(format!("{issue_number}.jsonl"))
    }

    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await?;
        }
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_json_map<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<HashMap<String, T>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(path).await?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Corrupt(format!("{}: {e}", path.display())))
    }

    async fn write_json_map<T: serde::Serialize>(
        &self,
        path: &Path,
        map: &HashMap<String, T>,
    ) -> Result<()> {
        let content = serde_json::to_string_pretty(map)?;
        self.write_atomic(path, &content).await
    }
}

#[async_trait]
impl WorkflowStore for FileStore {
    async fn save_workflow(&self, workflow: &mut Workflow) -> Result<()> {
        let path = self.workflow_path(&workflow.workflow_id);
        if path.exists() {
            let content = fs::read_to_string(&path).await?;
            let stored: Workflow = serde_json::from_str(&content)
                .map_err(|e| Error::Corrupt(format!("{}: {e}", path.display())))?;
            if stored.updated_at != workflow.updated_at {
                return Err(Error::Conflict(format!(
                    "workflow {} was modified concurrently",
                    workflow.workflow_id
                )));
            }
        }
        workflow.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(workflow)?;
        self.write_atomic(&path, &content).await
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Workflow> {
        let path = self.workflow_path(workflow_id);
        if !path.exists() {
            return Err(Error::NotFound(format!("workflow {workflow_id}")));
        }
        let content = fs::read_to_string(&path).await?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Corrupt(format!("{}: {e}", path.display())))
    }

    async fn list_completions(&self, issue_number: &str) -> Result<Vec<CompletionRecord>> {
        let dir = self.completions_dir(issue_number);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    names.push(name.to_string());
                }
            }
        }
        // Sequence numbers are zero-padded, so lexical order is
        // chronological; newest first.
        names.sort();
        names.reverse();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let path = dir.join(&name);
            let content = fs::read_to_string(&path).await?;
            match serde_json::from_str::<CompletionRecord>(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!("Skipping unreadable completion record {name}: {e}");
                }
            }
        }
        Ok(records)
    }

    async fn save_completion(&self, record: &CompletionRecord) -> Result<String> {
        let _guard = self.write_lock.lock().await;

        if !record.comment_id.is_empty() {
            let existing = self.list_completions(&record.issue_number).await?;
            if existing.iter().any(|r| r.comment_id == record.comment_id) {
                return Ok(record.comment_id.clone());
            }
        }

        let dir = self.completions_dir(&record.issue_number);
        fs::create_dir_all(&dir).await?;
        let mut count = 0usize;
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_str().is_some_and(|n| n.ends_with(".json")) {
                count += 1;
            }
        }

        let name = format!("{:04}.json", count + 1);
        let path = dir.join(&name);
        let content = serde_json::to_string_pretty(record)?;
        self.write_atomic(&path, &content).await?;
        Ok(format!("{}/{name}", record.issue_number))
    }

    async fn issue_workflow_id(&self, issue_number: &str) -> Result<Option<String>> {
        let mappings: HashMap<String, String> = self.read_json_map(&self.mappings_path()).await?;
        Ok(mappings.get(issue_number).cloned())
    }

    async fn map_issue(&self, issue_number: &str, workflow_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.mappings_path();
        let mut mappings: HashMap<String, String> = self.read_json_map(&path).await?;

        if let Some(previous) = mappings.get(issue_number) {
            if previous != workflow_id && !self.mapping_replaceable(previous).await? {
                return Err(Error::ActiveMappingExists(issue_number.to_string()));
            }
        }

        mappings.insert(issue_number.to_string(), workflow_id.to_string());
        self.write_json_map(&path, &mappings).await
    }

    async fn set_pending_approval(&self, approval: &PendingApproval) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.approvals_path();
        let mut approvals: HashMap<String, PendingApproval> = self.read_json_map(&path).await?;
        approvals.insert(approval.issue_number.clone(), approval.clone());
        self.write_json_map(&path, &approvals).await
    }

    async fn clear_pending_approval(&self, issue_number: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.approvals_path();
        let mut approvals: HashMap<String, PendingApproval> = self.read_json_map(&path).await?;
        if approvals.remove(issue_number).is_some() {
            self.write_json_map(&path, &approvals).await?;
        }
        Ok(())
    }

    async fn pending_approval(&self, issue_number: &str) -> Result<Option<PendingApproval>> {
        let approvals: HashMap<String, PendingApproval> =
            self.read_json_map(&self.approvals_path()).await?;
        Ok(approvals.get(issue_number).cloned())
    }

    async fn list_pending_approvals(&self) -> Result<Vec<PendingApproval>> {
        let approvals: HashMap<String, PendingApproval> =
            self.read_json_map(&self.approvals_path()).await?;
        Ok(approvals.into_values().collect())
    }

    async fn append_audit(
        &self,
        issue_number: &str,
        event_type: &str,
        details: Value,
    ) -> Result<()> {
        let record = serde_json::json!({
            "timestamp": Utc::now(),
            "issue_number": issue_number,
            "event_type": event_type,
            "details": details,
        });
        let line = format!("{}\n", serde_json::to_string(&record)?);
        let path = self.audit_path(issue_number);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
