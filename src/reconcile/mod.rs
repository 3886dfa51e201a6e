//! Reconciliation: rebuild workflow position from remote comment signals
//! when the local store is behind, and merge the three truths (workflow,
//! local completion record, remote comment) into a drift-flagged
//! snapshot.
//!
//! The reconciler is the only component permitted to act on drift;
//! snapshot consumers render it to humans.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::normalize_agent_key;
use crate::engine::WorkflowEngine;
use crate::error::Result;
use crate::events::{AlertSeverity, NexusEvent};
use crate::model::CompletionRecord;
use crate::orchestrator::ProcessOrchestrator;
use crate::runtime::IssuePlatform;

pub mod signals;

pub use signals::{extract_completion_signals, parse_completion_signal, CompletionSignal};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub signals_scanned: usize,
    pub signals_applied: usize,
    pub completion_seeded: bool,
    pub workflow_state: String,
    pub workflow_step: String,
    pub workflow_agent: String,
}

impl ReconcileSummary {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            signals_scanned: 0,
            signals_applied: 0,
            completion_seeded: false,
            workflow_state: "unknown".to_string(),
            workflow_step: "?/?".to_string(),
            workflow_agent: "unknown".to_string(),
        }
    }
}

/// Snapshot of the three state sources with pairwise drift flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub issue_number: String,
    pub workflow_id: Option<String>,
    pub workflow_state: String,
    pub current_step: String,
    pub current_step_name: String,
    pub current_agent: String,
    pub expected_running_agent: String,
    pub process_running: bool,
    pub pid: Option<u32>,
    pub local_from: String,
    pub local_next: String,
    pub comment_from: String,
    pub comment_next: String,
    pub drift_flags: Vec<String>,
}

pub struct Reconciler {
    engine: Arc<WorkflowEngine>,
}

impl Reconciler {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Replay the issue's structured completion comments through the
    /// engine. Dedup by comment id makes the replay idempotent. A paused
    /// workflow is resumed for the replay and re-paused afterwards.
    pub async fn reconcile_issue_from_signals(
        &self,
        issue_number: &str,
        project_key: &str,
        platform: &dyn IssuePlatform,
    ) -> Result<ReconcileSummary> {
        let Some(issue) = platform
            .get_issue(issue_number, &["comments", "title"])
            .await?
        else {
            return Ok(ReconcileSummary::failed(format!(
                "Could not fetch issue #{issue_number} data."
            )));
        };

        let signals = extract_completion_signals(&issue.comments);
        if signals.is_empty() {
            return Ok(ReconcileSummary::failed(format!(
                "No structured completion comments found for issue #{issue_number}."
            )));
        }

        let status_before = self.engine.get_workflow_status(issue_number).await?;
        let was_paused = status_before
            .as_ref()
            .map(|s| s.state == crate::model::WorkflowState::Paused)
            .unwrap_or(false);
        if was_paused {
            self.engine.resume_workflow(issue_number).await?;
        }

        let mut applied = 0usize;
        for signal in &signals {
            let outputs = signal_outputs(signal);
            match self
                .engine
                .complete_step_for_issue(
                    issue_number,
                    &signal.completed_agent,
                    outputs,
                    &signal.comment_id,
                )
                .await
            {
                Ok(Some(_)) => applied += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(
                        "Reconcile skipped signal for issue #{issue_number} ({} -> {}): {e}",
                        signal.completed_agent,
                        signal.next_agent
                    );
                }
            }
        }

        if was_paused {
            self.engine
                .pause_workflow(issue_number, "Reconciled replay")
                .await?;
        }

        // Keep /continue resumable even when workflow rows are missing but
        // structured comments still carry the latest handoff.
        let completion_seeded = applied == 0;
        if let Some(signal) = signals.last() {
            if completion_seeded {
                tracing::warn!(
                    "Reconcile issue #{issue_number}: no workflow transitions applied; seeding completion from latest signal {} -> {}",
                    signal.completed_agent,
                    signal.next_agent
                );
                self.engine
                    .event_bus()
                    .emit(
                        NexusEvent::alert(
                            format!(
                                "Workflow state missing for issue #{issue_number}; seeded resumption anchor from comment {}",
                                signal.comment_id
                            ),
                            AlertSeverity::Warning,
                            "reconciler",
                        )
                        .with_data("drift", json!("workflow_state_missing"))
                        .with_data("project_key", json!(project_key))
                        .with_data("issue_number", json!(issue_number)),
                    )
                    .await;
            }
            let record = CompletionRecord {
                issue_number: issue_number.to_string(),
                completed_agent: signal.completed_agent.clone(),
                next_agent: signal.next_agent.clone(),
                summary: format!("Reconciled from comment {}", signal.comment_id),
                key_findings: Vec::new(),
                comment_id: signal.comment_id.clone(),
                source: "reconciled".to_string(),
                created_at: signal.created_at,
            };
            self.engine.store().save_completion(&record).await?;
        }

        let status_after = self.engine.get_workflow_status(issue_number).await?;
        let (state, step, agent) = match status_after {
            Some(status) => (
                status.state.as_str().to_string(),
                format!("{}/{}", status.current_step, status.total_steps),
                if status.current_agent.is_empty() {
                    "unknown".to_string()
                } else {
                    status.current_agent
                },
            ),
            None => ("unknown".to_string(), "?/?".to_string(), "unknown".to_string()),
        };

        Ok(ReconcileSummary {
            ok: true,
            error: None,
            signals_scanned: signals.len(),
            signals_applied: applied,
            completion_seeded,
            workflow_state: state,
            workflow_step: step,
            workflow_agent: agent,
        })
    }

    /// Merge live workflow status, the latest local completion record,
    /// and the latest remote comment signal into one snapshot with drift
    /// flags for every pairwise disagreement.
    pub async fn build_workflow_snapshot(
        &self,
        issue_number: &str,
        platform: &dyn IssuePlatform,
        orchestrator: Option<&ProcessOrchestrator>,
    ) -> Result<WorkflowSnapshot> {
        let workflow = self.engine.get_workflow_for_issue(issue_number).await?;
        let workflow_id = workflow.as_ref().map(|w| w.workflow_id.clone());
        let expected_running = self
            .engine
            .expected_running_agent(issue_number)
            .await?
            .unwrap_or_default();

        let (workflow_state, current_step, current_step_name, current_agent) = match &workflow {
            Some(w) => {
                let status = crate::model::WorkflowStatus::from_workflow(w);
                (
                    status.state.as_str().to_string(),
                    format!("{}/{}", status.current_step, status.total_steps),
                    status.current_step_name,
                    status.current_agent,
                )
            }
            None => (
                "unknown".to_string(),
                "?/?".to_string(),
                "unknown".to_string(),
                String::new(),
            ),
        };

        let local = self
            .engine
            .store()
            .list_completions(issue_number)
            .await?
            .into_iter()
            .next();
        let local_from = local
            .as_ref()
            .map(|r| r.completed_agent.clone())
            .unwrap_or_default();
        let local_next = local
            .as_ref()
            .map(|r| r.next_agent.clone())
            .unwrap_or_default();

        let comments = platform.get_comments(issue_number, None).await?;
        let remote_signals = extract_completion_signals(&comments);
        let latest_signal = remote_signals.last();
        let comment_from = latest_signal
            .map(|s| s.completed_agent.clone())
            .unwrap_or_default();
        let comment_next = latest_signal
            .map(|s| s.next_agent.clone())
            .unwrap_or_default();

        let (process_running, pid) = match orchestrator {
            Some(orchestrator) => {
                let record = orchestrator.launch_record(issue_number).await;
                (
                    orchestrator.is_issue_process_running(issue_number).await,
                    record.map(|r| r.pid),
                )
            }
            None => (false, None),
        };

        let mut drift_flags = Vec::new();
        let expected_key = if !expected_running.is_empty() {
            normalize_agent_key(&expected_running)
        } else {
            normalize_agent_key(&current_agent)
        };
        let local_next_key = normalize_agent_key(&local_next);
        let comment_next_key = normalize_agent_key(&comment_next);

        if !expected_key.is_empty() && !local_next_key.is_empty() && expected_key != local_next_key
        {
            drift_flags.push("workflow_vs_local".to_string());
        }
        if !expected_key.is_empty()
            && !comment_next_key.is_empty()
            && expected_key != comment_next_key
        {
            drift_flags.push("workflow_vs_comment".to_string());
        }
        if !local_next_key.is_empty()
            && !comment_next_key.is_empty()
            && local_next_key != comment_next_key
        {
            drift_flags.push("local_vs_comment".to_string());
        }
        if (workflow_state == "unknown" || workflow_state.is_empty())
            && (!expected_key.is_empty()
                || !local_next_key.is_empty()
                || !comment_next_key.is_empty())
        {
            drift_flags.push("workflow_state_missing".to_string());
        }

        Ok(WorkflowSnapshot {
            issue_number: issue_number.to_string(),
            workflow_id,
            workflow_state,
            current_step,
            current_step_name,
            current_agent,
            expected_running_agent: expected_running,
            process_running,
            pid,
            local_from,
            local_next,
            comment_from,
            comment_next,
            drift_flags,
        })
    }
}

fn signal_outputs(signal: &CompletionSignal) -> HashMap<String, Value> {
    let mut outputs: HashMap<String, Value> = HashMap::new();
    outputs.insert("status".to_string(), json!("complete"));
    outputs.insert("agent_type".to_string(), json!(signal.completed_agent));
    outputs.insert("next_agent".to_string(), json!(signal.next_agent));
    outputs.insert(
        "summary".to_string(),
        json!(format!("Reconciled from comment {}", signal.comment_id)),
    );
    outputs.insert("source".to_string(), json!("reconciled"));
    for (key, value) in &signal.structured_outputs {
        outputs.entry(key.clone()).or_insert_with(|| json!(value));
    }
    outputs
}
