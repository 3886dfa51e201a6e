//! Interfaces the kernel consumes from its host (inversion of control).
//!
//! The kernel never spawns agent processes or talks to a ticket platform
//! directly; the host wires in implementations of these traits at startup.
//! Test doubles live with the integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;

use crate::error::Result;
use crate::events::{AlertAction, AlertSeverity};

/// Result of a successful agent launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentLaunch {
    pub pid: u32,
    /// The tool the host used to run the agent.
    pub tool: String,
}

/// Abstract subprocess launcher provided by the host.
///
/// `Ok(None)` means the host declined or failed to launch; callers treat
/// it as a transient dispatch failure subject to their retry policy.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn launch_agent(
        &self,
        issue_number: &str,
        agent_type: &str,
        trigger_source: &str,
    ) -> Result<Option<AgentLaunch>>;
}

/// A comment on a remote ticket.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IssueDetails {
    pub number: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IssueSummary {
    pub number: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Remote ticket platform operations the kernel consumes.
#[async_trait]
pub trait IssuePlatform: Send + Sync {
    async fn get_issue(&self, issue_number: &str, fields: &[&str]) -> Result<Option<IssueDetails>>;

    /// Returns the platform-assigned comment id.
    async fn add_comment(&self, issue_number: &str, body: &str) -> Result<String>;

    async fn get_comments(
        &self,
        issue_number: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>>;

    async fn close_issue(&self, issue_number: &str, comment: Option<&str>) -> Result<()>;

    async fn create_pr_from_changes(
        &self,
        repo_dir: &Path,
        issue_number: &str,
        title: &str,
        body: &str,
    ) -> Result<Option<String>>;

    async fn list_open_issues(&self, limit: usize, labels: &[String]) -> Result<Vec<IssueSummary>>;
}

/// Outbound notification rendered to humans by a chat adapter.
#[derive(Debug, Clone)]
pub struct Notification {
    pub message: String,
    pub severity: AlertSeverity,
    pub issue_number: String,
    pub project_key: String,
    pub actions: Vec<AlertAction>,
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// Injectable time source. Production uses [`SystemClock`]; tests advance
/// a fixed clock to exercise windows and expiries deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
