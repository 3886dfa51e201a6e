//! Core data model: per-issue workflow instances, their steps, completion
//! records, and approval state.
//!
//! `Workflow` aggregates are mutated only through `WorkflowEngine`
//! operations and persisted atomically by a storage driver. Step `agent`
//! fields are snapshots copied from the definition at creation time, so
//! later edits to a definition never alter a running workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::definition::{AgentSpec, BackoffStrategy, RouterSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Created,
    Running,
    Paused,
    ApprovalWait,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Created => "created",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::ApprovalWait => "approval_wait",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One stage of a workflow instance, bound to an agent capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub step_num: u32,
    pub name: String,
    /// Agent snapshot copied from the definition at workflow creation.
    pub agent: AgentSpec,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub effective_max_retries: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default)]
    pub initial_delay_seconds: f64,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub approval_required: bool,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub approval_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<RouterSpec>,
}

impl WorkflowStep {
    pub fn is_router(&self) -> bool {
        self.router.is_some()
    }

    /// Effective timeout: step override or the agent default.
    pub fn effective_timeout_seconds(&self) -> u64 {
        self.timeout_seconds
            .unwrap_or(self.agent.default_timeout_seconds)
    }
}

/// Per-issue instance of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    pub issue_number: String,
    pub project_key: String,
    pub workflow_type: String,
    pub state: WorkflowState,
    /// `step_num` of the step the workflow is positioned at.
    pub current_step: u32,
    pub steps: Vec<WorkflowStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Denormalized view of the current running step's agent name.
    #[serde(default)]
    pub active_agent_type: String,
}

impl Workflow {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn step(&self, step_num: u32) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.step_num == step_num)
    }

    pub fn step_mut(&mut self, step_num: u32) -> Option<&mut WorkflowStep> {
        self.steps.iter_mut().find(|s| s.step_num == step_num)
    }

    pub fn step_index(&self, step_num: u32) -> Option<usize> {
        self.steps.iter().position(|s| s.step_num == step_num)
    }

    pub fn running_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Running)
    }

    pub fn running_step_mut(&mut self) -> Option<&mut WorkflowStep> {
        self.steps
            .iter_mut()
            .find(|s| s.status == StepStatus::Running)
    }

    /// The step completion validation compares against: the running step,
    /// or the pointed step when a retry transition left it pending.
    pub fn active_step(&self) -> Option<&WorkflowStep> {
        self.running_step().or_else(|| self.step(self.current_step))
    }

    /// Merged outputs of all steps in declaration order. Later steps win
    /// on key collision; routers consume this view.
    pub fn merged_outputs(&self) -> HashMap<String, Value> {
        let mut merged = HashMap::new();
        for step in &self.steps {
            for (key, value) in &step.outputs {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Append-only audit of structured agent completions per issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub issue_number: String,
    pub completed_agent: String,
    #[serde(default)]
    pub next_agent: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    /// Dedup token; `(issue_number, comment_id)` is unique when non-empty.
    #[serde(default)]
    pub comment_id: String,
    /// `local`, `remote`, or `reconciled`.
    #[serde(default)]
    pub source: String,
    pub created_at: DateTime<Utc>,
}

/// A workflow suspended at an approval gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub issue_number: String,
    pub workflow_id: String,
    pub step_num: u32,
    pub agent_name: String,
    pub approvers: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Read-only status projection consumed by observers and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub issue_number: String,
    pub state: WorkflowState,
    pub current_step: u32,
    pub total_steps: usize,
    pub current_agent: String,
    pub current_step_name: String,
    pub workflow_type: String,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowStatus {
    pub fn from_workflow(workflow: &Workflow) -> Self {
        let (agent, step_name) = workflow
            .running_step()
            .or_else(|| workflow.step(workflow.current_step))
            .map(|s| (s.agent.name.clone(), s.name.clone()))
            .unwrap_or_default();

        Self {
            workflow_id: workflow.workflow_id.clone(),
            issue_number: workflow.issue_number.clone(),
            state: workflow.state,
            current_step: workflow.current_step,
            total_steps: workflow.steps.len(),
            current_agent: agent,
            current_step_name: step_name,
            workflow_type: workflow.workflow_type.clone(),
            updated_at: workflow.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::AgentSpec;

    fn step(num: u32, agent: &str, status: StepStatus) -> WorkflowStep {
        WorkflowStep {
            step_num: num,
            name: format!("step-{num}"),
            agent: AgentSpec {
                name: agent.to_string(),
                display_name: agent.to_string(),
                default_timeout_seconds: 3600,
                default_max_retries: 2,
            },
            status,
            started_at: None,
            completed_at: None,
            outputs: HashMap::new(),
            error: None,
            retry_count: 0,
            effective_max_retries: 2,
            backoff_strategy: BackoffStrategy::Exponential,
            initial_delay_seconds: 1.0,
            timeout_seconds: None,
            approval_required: false,
            approvers: vec![],
            approval_timeout_seconds: None,
            router: None,
        }
    }

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        Workflow {
            workflow_id: "proj-42-full".to_string(),
            issue_number: "42".to_string(),
            project_key: "proj".to_string(),
            workflow_type: "full".to_string(),
            state: WorkflowState::Running,
            current_step: 1,
            steps,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            active_agent_type: String::new(),
        }
    }

    #[test]
    fn running_step_found_among_others() {
        let wf = workflow(vec![
            step(1, "triage", StepStatus::Completed),
            step(2, "developer", StepStatus::Running),
            step(3, "reviewer", StepStatus::Pending),
        ]);
        assert_eq!(wf.running_step().map(|s| s.step_num), Some(2));
    }

    #[test]
    fn active_step_falls_back_to_pointer_when_pending() {
        let mut wf = workflow(vec![
            step(1, "triage", StepStatus::Completed),
            step(2, "developer", StepStatus::Pending),
        ]);
        wf.current_step = 2;
        assert_eq!(wf.active_step().map(|s| s.agent.name.as_str()), Some("developer"));
    }

    #[test]
    fn merged_outputs_later_steps_win() {
        let mut first = step(1, "triage", StepStatus::Completed);
        first
            .outputs
            .insert("status".to_string(), serde_json::json!("complete"));
        first
            .outputs
            .insert("scope".to_string(), serde_json::json!("small"));
        let mut second = step(2, "developer", StepStatus::Completed);
        second
            .outputs
            .insert("status".to_string(), serde_json::json!("failed"));

        let wf = workflow(vec![first, second]);
        let merged = wf.merged_outputs();
        assert_eq!(merged["status"], serde_json::json!("failed"));
        assert_eq!(merged["scope"], serde_json::json!("small"));
    }

    #[test]
    fn terminal_states() {
        for state in [
            WorkflowState::Completed,
            WorkflowState::Failed,
            WorkflowState::Cancelled,
        ] {
            assert!(state.is_terminal());
        }
        assert!(!WorkflowState::Running.is_terminal());
        assert!(!WorkflowState::ApprovalWait.is_terminal());
    }
}
