//! Workflow engine: the step state machine.
//!
//! All write operations are serialized per workflow through an internal
//! lock map and persist before their events are emitted; within one
//! workflow a `step.completed` is always emitted before the successor's
//! `step.started`. Event handlers must not call back into the engine
//! synchronously — a handler that needs to mutate a workflow schedules
//! the call on a separate task.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::NexusConfig;
use crate::definition::{
    load_definition, normalize_agent_key, normalize_workflow_type, StepDefinition,
    WorkflowDefinition, DEFAULT_WORKFLOW_TYPE,
};
use crate::error::{Error, Result};
use crate::events::{AlertSeverity, EventBus, EventKind, NexusEvent};
use crate::model::{
    PendingApproval, StepStatus, Workflow, WorkflowState, WorkflowStatus, WorkflowStep,
};
use crate::runtime::{Clock, SystemClock};
use crate::storage::WorkflowStore;

pub mod retry;
pub mod router;

pub use retry::{apply_retry_transition, compute_retry_backoff_seconds, RetryTransition};

/// Parameters for [`WorkflowEngine::create_workflow_for_issue`].
#[derive(Debug, Clone, Default)]
pub struct CreateWorkflowRequest {
    pub issue_number: String,
    pub issue_title: String,
    pub project_name: String,
    pub workflow_type: String,
    pub task_type: String,
    pub description: String,
    /// Cancel and replace a non-terminal workflow already mapped to the
    /// issue. Without it the call fails with
    /// [`Error::ActiveMappingExists`].
    pub replace_existing: bool,
}

enum Advance {
    Completed,
    ApprovalWait(PendingApproval),
    Started,
}

enum MisalignedCompletion {
    /// Same agent as the previously completed step; dedup and move on.
    Duplicate,
    /// Remote truth is ahead; position advanced to this step.
    Advanced(u32),
    /// Unknown agent; record in history, do not advance.
    Mismatch,
}

pub struct WorkflowEngine {
    store: Arc<dyn WorkflowStore>,
    bus: Arc<EventBus>,
    config: NexusConfig,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn WorkflowStore>, bus: Arc<EventBus>, config: NexusConfig) -> Self {
        Self::with_clock(store, bus, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn WorkflowStore>,
        bus: Arc<EventBus>,
        config: NexusConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn store(&self) -> Arc<dyn WorkflowStore> {
        self.store.clone()
    }

    fn lock_for(&self, workflow_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("engine lock map poisoned");
        locks
            .entry(workflow_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn emit_all(&self, events: Vec<NexusEvent>) {
        for event in events {
            self.bus.emit(event).await;
        }
    }

    /// Create and persist a workflow for an issue without starting
    /// execution. Emits `workflow.started`; `start_workflow` performs the
    /// first step transition.
    pub async fn create_workflow_for_issue(&self, request: CreateWorkflowRequest) -> Result<String> {
        let workflow_type =
            normalize_workflow_type(&request.workflow_type, DEFAULT_WORKFLOW_TYPE);
        let definition = load_definition(self.config.definition_path(&workflow_type))
            .map_err(|e| Error::InvalidDefinition(format!("{e:#}")))?;

        let mut events = Vec::new();
        if let Some(previous_id) = self.store.issue_workflow_id(&request.issue_number).await? {
            match self.store.load_workflow(&previous_id).await {
                Ok(mut previous) if !previous.is_terminal() => {
                    if !request.replace_existing {
                        return Err(Error::ActiveMappingExists(request.issue_number.clone()));
                    }
                    let lock = self.lock_for(&previous_id);
                    let _guard = lock.lock().await;
                    previous.state = WorkflowState::Cancelled;
                    previous.active_agent_type.clear();
                    for step in previous.steps.iter_mut() {
                        if step.status == StepStatus::Running {
                            step.status = StepStatus::Pending;
                        }
                    }
                    self.store.save_workflow(&mut previous).await?;
                    self.store
                        .clear_pending_approval(&request.issue_number)
                        .await?;
                    events.push(NexusEvent::with_workflow(
                        EventKind::WorkflowCancelled,
                        previous_id.clone(),
                    ));
                    tracing::info!(
                        "Replaced active workflow {previous_id} for issue #{}",
                        request.issue_number
                    );
                }
                Ok(_) => {}
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let workflow_id = format!(
            "{}-{}-{}",
            request.project_name, request.issue_number, workflow_type
        );
        let now = self.clock.now();
        let mut workflow = instantiate_workflow(&definition, &request, &workflow_id, now);

        // Re-creating under the same id overwrites the archived run.
        if let Ok(stored) = self.store.load_workflow(&workflow_id).await {
            workflow.updated_at = stored.updated_at;
        }

        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;
        self.store.save_workflow(&mut workflow).await?;
        self.store
            .map_issue(&request.issue_number, &workflow_id)
            .await?;
        self.store
            .append_audit(
                &request.issue_number,
                "WORKFLOW_CREATED",
                json!({
                    "workflow_id": workflow_id,
                    "workflow_type": workflow_type,
                    "title": request.issue_title,
                    "task_type": request.task_type,
                    "description": request.description,
                }),
            )
            .await?;

        events.push(NexusEvent::with_workflow(
            EventKind::WorkflowStarted,
            workflow_id.clone(),
        ));
        self.emit_all(events).await;
        Ok(workflow_id)
    }

    /// Transition `created -> running` and launch the first agent step.
    /// Returns false when the workflow is not in `created`.
    pub async fn start_workflow(&self, workflow_id: &str) -> Result<bool> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store.load_workflow(workflow_id).await?;
        if workflow.state != WorkflowState::Created {
            return Ok(false);
        }

        let now = self.clock.now();
        workflow.state = WorkflowState::Running;
        let mut events = Vec::new();
        let advance = self.advance(&mut workflow, 0, &mut events, now)?;
        self.store.save_workflow(&mut workflow).await?;
        if let Advance::ApprovalWait(approval) = &advance {
            self.store.set_pending_approval(approval).await?;
        }
        self.emit_all(events).await;
        Ok(true)
    }

    /// Record a structured completion for the issue's running step and
    /// advance the workflow. Returns the updated workflow, or `None` when
    /// no workflow is mapped to the issue.
    pub async fn complete_step_for_issue(
        &self,
        issue_number: &str,
        completed_agent_type: &str,
        outputs: HashMap<String, Value>,
        event_id: &str,
    ) -> Result<Option<Workflow>> {
        let Some(workflow_id) = self.store.issue_workflow_id(issue_number).await? else {
            return Ok(None);
        };
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;

        let mut workflow = match self.store.load_workflow(&workflow_id).await {
            Ok(w) => w,
            Err(Error::NotFound(_)) => {
                tracing::warn!(
                    "Issue #{issue_number} maps to missing workflow {workflow_id}"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if workflow.state == WorkflowState::Paused {
            return Err(Error::WorkflowPaused(issue_number.to_string()));
        }
        if workflow.is_terminal() {
            tracing::warn!(
                "Completion from {completed_agent_type} ignored: workflow {workflow_id} is {}",
                workflow.state.as_str()
            );
            return Ok(Some(workflow));
        }
        if !event_id.is_empty() && self.store.has_completion(issue_number, event_id).await? {
            tracing::debug!(
                "Duplicate completion event {event_id} for issue #{issue_number}; ignoring"
            );
            return Ok(Some(workflow));
        }

        let completed_key = normalize_agent_key(completed_agent_type);
        let active_num = workflow.active_step().map(|s| s.step_num);
        let mut events = Vec::new();

        let aligned = active_num
            .and_then(|num| workflow.step(num))
            .map(|s| normalize_agent_key(&s.agent.name) == completed_key)
            .unwrap_or(false);

        let step_num = match (aligned, active_num) {
            (true, Some(num)) => num,
            _ => match self.resolve_misaligned_completion(
                &mut workflow,
                issue_number,
                completed_agent_type,
                &completed_key,
                active_num,
                &mut events,
            ) {
                MisalignedCompletion::Duplicate => {
                    self.record_completion(issue_number, completed_agent_type, &outputs, event_id)
                        .await?;
                    return Ok(Some(workflow));
                }
                MisalignedCompletion::Mismatch => {
                    // Recorded in history, workflow position untouched.
                    self.record_completion(issue_number, completed_agent_type, &outputs, event_id)
                        .await?;
                    self.store
                        .append_audit(
                            issue_number,
                            "COMPLETION_MISMATCH",
                            json!({
                                "completed_agent": completed_agent_type,
                                "expected_agent":
                                    workflow.active_step().map(|s| s.agent.name.clone()),
                                "event_id": event_id,
                            }),
                        )
                        .await?;
                    self.emit_all(events).await;
                    return Ok(Some(workflow));
                }
                MisalignedCompletion::Advanced(num) => num,
            },
        };

        let now = self.clock.now();
        let failed = outputs.get("status").and_then(|v| v.as_str()) == Some("failed");

        {
            let step = workflow
                .step_mut(step_num)
                .ok_or_else(|| Error::NotFound(format!("step {step_num}")))?;
            step.completed_at = Some(now);
            for (key, value) in &outputs {
                step.outputs.insert(key.clone(), value.clone());
            }
        }

        if failed {
            let error = outputs
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("step reported failure")
                .to_string();
            let step = workflow
                .step_mut(step_num)
                .ok_or_else(|| Error::NotFound(format!("step {step_num}")))?;
            step.error = Some(error.clone());
            let transition =
                apply_retry_transition(step, self.config.default_backoff_base_seconds);
            let step_name = step.name.clone();
            let agent_name = step.agent.name.clone();
            let retry_count = step.retry_count;

            if transition.will_retry {
                workflow.current_step = step_num;
                workflow.active_agent_type.clear();
                self.store.save_workflow(&mut workflow).await?;
                self.record_completion(issue_number, completed_agent_type, &outputs, event_id)
                    .await?;
                let backoff = transition.backoff_seconds.unwrap_or(0.0);
                self.store
                    .append_audit(
                        issue_number,
                        "STEP_RETRY",
                        json!({
                            "step_num": step_num,
                            "step_name": step_name,
                            "retry_count": retry_count,
                            "backoff_seconds": backoff,
                            "error": error,
                        }),
                    )
                    .await?;
                tracing::info!(
                    "Retrying step {step_num} in workflow {} (attempt {retry_count}/{}, backoff {backoff}s)",
                    workflow.workflow_id,
                    transition.max_retries
                );
                events.push(NexusEvent::with_workflow(
                    EventKind::AgentRetry {
                        agent_name,
                        attempt: retry_count,
                        backoff_seconds: backoff,
                    },
                    workflow.workflow_id.clone(),
                ));
                self.emit_all(events).await;
                return Ok(Some(workflow));
            }

            workflow.state = WorkflowState::Failed;
            workflow.active_agent_type.clear();
            self.store.save_workflow(&mut workflow).await?;
            self.record_completion(issue_number, completed_agent_type, &outputs, event_id)
                .await?;
            self.store
                .append_audit(
                    issue_number,
                    "WORKFLOW_FAILED",
                    json!({ "step_num": step_num, "error": error }),
                )
                .await?;
            events.push(NexusEvent::with_workflow(
                EventKind::StepFailed {
                    step_num,
                    step_name,
                    agent_type: agent_name.clone(),
                    error: error.clone(),
                },
                workflow.workflow_id.clone(),
            ));
            events.push(NexusEvent::with_workflow(
                EventKind::WorkflowFailed {
                    error: format!("step {step_num} failed after {retry_count} retries: {error}"),
                },
                workflow.workflow_id.clone(),
            ));
            events.push(
                NexusEvent::alert(
                    format!(
                        "Workflow {} failed at step {step_num} ({agent_name}): {error}",
                        workflow.workflow_id
                    ),
                    AlertSeverity::Error,
                    "workflow_engine",
                )
                .with_data("issue_number", json!(issue_number)),
            );
            self.emit_all(events).await;
            return Ok(Some(workflow));
        }

        {
            let step = workflow
                .step_mut(step_num)
                .ok_or_else(|| Error::NotFound(format!("step {step_num}")))?;
            step.status = StepStatus::Completed;
            step.error = None;
            events.push(NexusEvent::with_workflow(
                EventKind::StepCompleted {
                    step_num,
                    step_name: step.name.clone(),
                    agent_type: step.agent.name.clone(),
                    outputs: outputs.clone().into_iter().collect(),
                },
                workflow.workflow_id.clone(),
            ));
        }

        let from_idx = workflow
            .step_index(step_num)
            .ok_or_else(|| Error::NotFound(format!("step {step_num}")))?;
        let advance = self.advance(&mut workflow, from_idx + 1, &mut events, now)?;

        self.store.save_workflow(&mut workflow).await?;
        self.record_completion(issue_number, completed_agent_type, &outputs, event_id)
            .await?;
        if let Advance::ApprovalWait(approval) = &advance {
            self.store.set_pending_approval(approval).await?;
        }
        self.emit_all(events).await;
        Ok(Some(workflow))
    }

    /// Resolve a completion whose agent does not match the active step.
    fn resolve_misaligned_completion(
        &self,
        workflow: &mut Workflow,
        issue_number: &str,
        completed_agent_type: &str,
        completed_key: &str,
        active_num: Option<u32>,
        events: &mut Vec<NexusEvent>,
    ) -> MisalignedCompletion {
        let duplicate_of_previous = workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed && !s.is_router())
            .next_back()
            .map(|s| normalize_agent_key(&s.agent.name) == completed_key)
            .unwrap_or(false);
        if duplicate_of_previous {
            tracing::debug!(
                "Completion from {completed_agent_type} duplicates the previous step for issue #{issue_number}"
            );
            return MisalignedCompletion::Duplicate;
        }

        let active_idx = active_num
            .and_then(|n| workflow.step_index(n))
            .unwrap_or(0);
        let later = workflow
            .steps
            .iter()
            .enumerate()
            .skip(active_idx + 1)
            .find(|(_, s)| !s.is_router() && normalize_agent_key(&s.agent.name) == *completed_key)
            .map(|(idx, s)| (idx, s.step_num));

        let Some((later_idx, later_num)) = later else {
            tracing::warn!(
                "Completion from unknown agent {completed_agent_type} for issue #{issue_number}; not advancing"
            );
            events.push(
                NexusEvent::alert(
                    format!(
                        "Completion mismatch on issue #{issue_number}: {completed_agent_type} is not the running agent"
                    ),
                    AlertSeverity::Warning,
                    "workflow_engine",
                )
                .with_data("drift", json!("completion_mismatch"))
                .with_data("issue_number", json!(issue_number)),
            );
            return MisalignedCompletion::Mismatch;
        };

        // Drift recovery: the remote truth is ahead of the local pointer.
        let now = self.clock.now();
        for step in workflow.steps[active_idx..later_idx].iter_mut() {
            if matches!(step.status, StepStatus::Running | StepStatus::Pending) {
                step.status = StepStatus::Skipped;
            }
        }
        if let Some(step) = workflow.step_mut(later_num) {
            step.status = StepStatus::Running;
            if step.started_at.is_none() {
                step.started_at = Some(now);
            }
        }
        workflow.current_step = later_num;
        tracing::warn!(
            "Workflow {} advanced to later step {later_num} to match completion from {completed_agent_type}",
            workflow.workflow_id
        );
        events.push(
            NexusEvent::alert(
                format!(
                    "Workflow position advanced to step {later_num} on issue #{issue_number} to match {completed_agent_type}"
                ),
                AlertSeverity::Warning,
                "workflow_engine",
            )
            .with_data("drift", json!("advanced_to_later_step"))
            .with_data("issue_number", json!(issue_number)),
        );
        MisalignedCompletion::Advanced(later_num)
    }

    /// Walk forward from `next_idx`, evaluating routers inline, until an
    /// agent step is chosen (marked running or gated) or the workflow
    /// completes.
    fn advance(
        &self,
        workflow: &mut Workflow,
        next_idx: usize,
        events: &mut Vec<NexusEvent>,
        now: DateTime<Utc>,
    ) -> Result<Advance> {
        let mut idx = next_idx;
        let mut hops = 0u32;

        while idx < workflow.steps.len() && workflow.steps[idx].is_router() {
            hops += 1;
            if hops > 16 {
                return Err(Error::InvalidOperation(format!(
                    "router chain exceeded 16 hops in workflow {}",
                    workflow.workflow_id
                )));
            }

            let router_spec = workflow.steps[idx]
                .router
                .clone()
                .ok_or_else(|| Error::InvalidOperation("router step without spec".to_string()))?;
            let loop_count = workflow.steps[idx]
                .outputs
                .get("loop_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32;
            let merged = workflow.merged_outputs();
            let decision = router::select_branch(&router_spec, &merged, loop_count);

            {
                let router_step = &mut workflow.steps[idx];
                router_step.status = StepStatus::Completed;
                router_step.completed_at = Some(now);
                router_step
                    .outputs
                    .insert("selected_step".to_string(), json!(decision.next_step_num));
                if decision.is_loop {
                    router_step
                        .outputs
                        .insert("loop_count".to_string(), json!(loop_count + 1));
                }
            }

            let target_idx = workflow
                .step_index(decision.next_step_num)
                .ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "router branch targets missing step {}",
                        decision.next_step_num
                    ))
                })?;

            if decision.is_loop {
                // Reset the segment that re-runs.
                for step in workflow.steps[target_idx..idx].iter_mut() {
                    if !step.is_router() {
                        step.status = StepStatus::Pending;
                        step.started_at = None;
                        step.completed_at = None;
                        step.error = None;
                    }
                }
            } else if target_idx > idx + 1 {
                for step in workflow.steps[idx + 1..target_idx].iter_mut() {
                    if step.status == StepStatus::Pending {
                        step.status = StepStatus::Skipped;
                    }
                }
            }
            idx = target_idx;
        }

        if idx >= workflow.steps.len() {
            workflow.state = WorkflowState::Completed;
            workflow.active_agent_type.clear();
            events.push(NexusEvent::with_workflow(
                EventKind::WorkflowCompleted,
                workflow.workflow_id.clone(),
            ));
            return Ok(Advance::Completed);
        }

        let workflow_id = workflow.workflow_id.clone();
        let issue_number = workflow.issue_number.clone();
        let step = &mut workflow.steps[idx];
        let step_num = step.step_num;

        if step.approval_required {
            let approval = PendingApproval {
                issue_number,
                workflow_id: workflow_id.clone(),
                step_num,
                agent_name: step.agent.name.clone(),
                approvers: step.approvers.clone(),
                expires_at: step
                    .approval_timeout_seconds
                    .map(|t| now + ChronoDuration::seconds(t as i64)),
            };
            events.push(NexusEvent::with_workflow(
                EventKind::ApprovalRequired {
                    step_num,
                    step_name: step.name.clone(),
                    agent: step.agent.name.clone(),
                    approvers: step.approvers.clone(),
                },
                workflow_id,
            ));
            workflow.state = WorkflowState::ApprovalWait;
            workflow.current_step = step_num;
            workflow.active_agent_type.clear();
            return Ok(Advance::ApprovalWait(approval));
        }

        step.status = StepStatus::Running;
        step.started_at = Some(now);
        let step_name = step.name.clone();
        let agent_type = step.agent.name.clone();
        workflow.current_step = step_num;
        workflow.active_agent_type = agent_type.clone();
        events.push(NexusEvent::with_workflow(
            EventKind::StepStarted {
                step_num,
                step_name,
                agent_type,
            },
            workflow_id,
        ));
        Ok(Advance::Started)
    }

    async fn record_completion(
        &self,
        issue_number: &str,
        completed_agent: &str,
        outputs: &HashMap<String, Value>,
        event_id: &str,
    ) -> Result<()> {
        let text = |key: &str| {
            outputs
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let key_findings = outputs
            .get("key_findings")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let record = crate::model::CompletionRecord {
            issue_number: issue_number.to_string(),
            completed_agent: completed_agent.to_string(),
            next_agent: text("next_agent"),
            summary: text("summary"),
            key_findings,
            comment_id: event_id.to_string(),
            source: {
                let source = text("source");
                if source.is_empty() {
                    "local".to_string()
                } else {
                    source
                }
            },
            created_at: self.clock.now(),
        };
        self.store.save_completion(&record).await?;
        Ok(())
    }

    /// Approve the gated step. Valid only in `approval_wait`; transitions
    /// to `running` and launches the step.
    pub async fn approve_step(&self, issue_number: &str, approver: &str) -> Result<bool> {
        let Some(workflow_id) = self.store.issue_workflow_id(issue_number).await? else {
            return Ok(false);
        };
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store.load_workflow(&workflow_id).await?;
        if workflow.state != WorkflowState::ApprovalWait {
            return Ok(false);
        }

        if let Some(approval) = self.store.pending_approval(issue_number).await? {
            if !approval.approvers.is_empty()
                && !approval.approvers.iter().any(|a| a == approver)
            {
                tracing::warn!(
                    "Approval for issue #{issue_number} rejected: {approver} is not an authorized approver"
                );
                return Ok(false);
            }
        }

        let now = self.clock.now();
        let step_num = workflow.current_step;
        let mut events = Vec::new();
        {
            let step = workflow
                .step_mut(step_num)
                .ok_or_else(|| Error::NotFound(format!("step {step_num}")))?;
            step.status = StepStatus::Running;
            step.started_at = Some(now);
            let step_name = step.name.clone();
            let agent_type = step.agent.name.clone();
            workflow.active_agent_type = agent_type.clone();
            events.push(NexusEvent::with_workflow(
                EventKind::StepStarted {
                    step_num,
                    step_name,
                    agent_type,
                },
                workflow_id.clone(),
            ));
        }
        workflow.state = WorkflowState::Running;
        self.store.save_workflow(&mut workflow).await?;
        self.store.clear_pending_approval(issue_number).await?;
        self.store
            .append_audit(
                issue_number,
                "STEP_APPROVED",
                json!({ "step_num": step_num, "approver": approver }),
            )
            .await?;
        self.emit_all(events).await;
        Ok(true)
    }

    /// Deny the gated step: the workflow fails with the denial reason.
    pub async fn deny_step(&self, issue_number: &str, approver: &str) -> Result<bool> {
        let Some(workflow_id) = self.store.issue_workflow_id(issue_number).await? else {
            return Ok(false);
        };
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store.load_workflow(&workflow_id).await?;
        if workflow.state != WorkflowState::ApprovalWait {
            return Ok(false);
        }

        workflow.state = WorkflowState::Failed;
        workflow.active_agent_type.clear();
        self.store.save_workflow(&mut workflow).await?;
        self.store.clear_pending_approval(issue_number).await?;
        self.store
            .append_audit(
                issue_number,
                "STEP_DENIED",
                json!({ "step_num": workflow.current_step, "approver": approver }),
            )
            .await?;
        self.emit_all(vec![NexusEvent::with_workflow(
            EventKind::WorkflowFailed {
                error: format!("step {} denied by {approver}", workflow.current_step),
            },
            workflow_id,
        )])
        .await;
        Ok(true)
    }

    /// Pause a running workflow. Completions are rejected while paused.
    pub async fn pause_workflow(&self, issue_number: &str, reason: &str) -> Result<bool> {
        let Some(workflow_id) = self.store.issue_workflow_id(issue_number).await? else {
            return Ok(false);
        };
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store.load_workflow(&workflow_id).await?;
        if workflow.state != WorkflowState::Running {
            return Ok(false);
        }
        workflow.state = WorkflowState::Paused;
        self.store.save_workflow(&mut workflow).await?;
        self.store
            .append_audit(issue_number, "WORKFLOW_PAUSED", json!({ "reason": reason }))
            .await?;
        self.emit_all(vec![NexusEvent::with_workflow(
            EventKind::WorkflowPaused {
                reason: reason.to_string(),
            },
            workflow_id,
        )])
        .await;
        Ok(true)
    }

    pub async fn resume_workflow(&self, issue_number: &str) -> Result<bool> {
        let Some(workflow_id) = self.store.issue_workflow_id(issue_number).await? else {
            return Ok(false);
        };
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store.load_workflow(&workflow_id).await?;
        if workflow.state != WorkflowState::Paused {
            return Ok(false);
        }
        workflow.state = WorkflowState::Running;
        self.store.save_workflow(&mut workflow).await?;
        self.store
            .append_audit(issue_number, "WORKFLOW_RESUMED", json!({}))
            .await?;
        Ok(true)
    }

    /// Cancel a non-terminal workflow.
    pub async fn cancel_workflow(&self, issue_number: &str, reason: &str) -> Result<bool> {
        let Some(workflow_id) = self.store.issue_workflow_id(issue_number).await? else {
            return Ok(false);
        };
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store.load_workflow(&workflow_id).await?;
        if workflow.is_terminal() {
            return Ok(false);
        }
        workflow.state = WorkflowState::Cancelled;
        workflow.active_agent_type.clear();
        for step in workflow.steps.iter_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
                step.started_at = None;
            }
        }
        self.store.save_workflow(&mut workflow).await?;
        self.store.clear_pending_approval(issue_number).await?;
        self.store
            .append_audit(issue_number, "WORKFLOW_CANCELLED", json!({ "reason": reason }))
            .await?;
        self.emit_all(vec![NexusEvent::with_workflow(
            EventKind::WorkflowCancelled,
            workflow_id,
        )])
        .await;
        Ok(true)
    }

    /// Rewind the workflow to the first step whose agent matches
    /// `agent_type`; the step returns to `pending` and any running step
    /// is cleared. Manual recovery hook.
    pub async fn reset_to_agent_for_issue(
        &self,
        issue_number: &str,
        agent_type: &str,
    ) -> Result<bool> {
        let Some(workflow_id) = self.store.issue_workflow_id(issue_number).await? else {
            return Ok(false);
        };
        let lock = self.lock_for(&workflow_id);
        let _guard = lock.lock().await;
        let mut workflow = self.store.load_workflow(&workflow_id).await?;

        let key = normalize_agent_key(agent_type);
        let Some(target_num) = workflow
            .steps
            .iter()
            .find(|s| !s.is_router() && normalize_agent_key(&s.agent.name) == key)
            .map(|s| s.step_num)
        else {
            tracing::warn!(
                "Cannot reset issue #{issue_number}: no step runs agent {agent_type}"
            );
            return Ok(false);
        };

        for step in workflow.steps.iter_mut() {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
                step.started_at = None;
            }
        }
        if let Some(step) = workflow.step_mut(target_num) {
            step.status = StepStatus::Pending;
            step.started_at = None;
            step.completed_at = None;
            step.error = None;
        }
        workflow.current_step = target_num;
        workflow.state = WorkflowState::Running;
        workflow.active_agent_type.clear();
        self.store.save_workflow(&mut workflow).await?;
        self.store.clear_pending_approval(issue_number).await?;
        self.store
            .append_audit(
                issue_number,
                "WORKFLOW_RESET",
                json!({ "agent_type": agent_type, "step_num": target_num }),
            )
            .await?;
        Ok(true)
    }

    /// Read-only status projection.
    pub async fn get_workflow_status(&self, issue_number: &str) -> Result<Option<WorkflowStatus>> {
        Ok(self
            .get_workflow_for_issue(issue_number)
            .await?
            .map(|w| WorkflowStatus::from_workflow(&w)))
    }

    pub async fn get_workflow_for_issue(&self, issue_number: &str) -> Result<Option<Workflow>> {
        let Some(workflow_id) = self.store.issue_workflow_id(issue_number).await? else {
            return Ok(None);
        };
        match self.store.load_workflow(&workflow_id).await {
            Ok(w) => Ok(Some(w)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The agent the workflow expects to be running, if any. `None` for
    /// terminal workflows and unmapped issues.
    pub async fn expected_running_agent(&self, issue_number: &str) -> Result<Option<String>> {
        let Some(workflow) = self.get_workflow_for_issue(issue_number).await? else {
            return Ok(None);
        };
        if workflow.is_terminal() {
            return Ok(None);
        }
        Ok(workflow
            .running_step()
            .map(|s| s.agent.name.clone())
            .or_else(|| {
                workflow
                    .step(workflow.current_step)
                    .filter(|s| !s.is_router())
                    .map(|s| s.agent.name.clone())
            }))
    }

    /// Fail workflows whose approval gate expired. Returns how many were
    /// expired. Invoked from the orchestrator's poll loop.
    pub async fn expire_pending_approvals(&self) -> Result<u32> {
        let now = self.clock.now();
        let mut expired = 0u32;
        for approval in self.store.list_pending_approvals().await? {
            let Some(expires_at) = approval.expires_at else {
                continue;
            };
            if expires_at > now {
                continue;
            }

            let lock = self.lock_for(&approval.workflow_id);
            let _guard = lock.lock().await;
            let mut workflow = match self.store.load_workflow(&approval.workflow_id).await {
                Ok(w) => w,
                Err(_) => {
                    self.store
                        .clear_pending_approval(&approval.issue_number)
                        .await?;
                    continue;
                }
            };
            if workflow.state != WorkflowState::ApprovalWait
                || workflow.current_step != approval.step_num
            {
                self.store
                    .clear_pending_approval(&approval.issue_number)
                    .await?;
                continue;
            }

            workflow.state = WorkflowState::Failed;
            workflow.active_agent_type.clear();
            self.store.save_workflow(&mut workflow).await?;
            self.store
                .clear_pending_approval(&approval.issue_number)
                .await?;
            self.store
                .append_audit(
                    &approval.issue_number,
                    "APPROVAL_TIMEOUT",
                    json!({ "step_num": approval.step_num, "agent": approval.agent_name }),
                )
                .await?;
            self.emit_all(vec![
                NexusEvent::with_workflow(
                    EventKind::WorkflowFailed {
                        error: "approval_timeout".to_string(),
                    },
                    approval.workflow_id.clone(),
                ),
                NexusEvent::alert(
                    format!(
                        "Approval for step {} on issue #{} expired",
                        approval.step_num, approval.issue_number
                    ),
                    AlertSeverity::Error,
                    "workflow_engine",
                )
                .with_data("issue_number", json!(approval.issue_number)),
            ])
            .await;
            expired += 1;
        }
        Ok(expired)
    }
}

fn instantiate_step(definition: &StepDefinition) -> WorkflowStep {
    let agent = definition.agent.clone().unwrap_or_default();
    WorkflowStep {
        step_num: definition.step_num,
        name: definition.name.clone(),
        effective_max_retries: definition
            .max_retries
            .unwrap_or(agent.default_max_retries),
        agent,
        status: StepStatus::Pending,
        started_at: None,
        completed_at: None,
        outputs: HashMap::new(),
        error: None,
        retry_count: 0,
        backoff_strategy: definition.backoff_strategy,
        initial_delay_seconds: definition.initial_delay_seconds.unwrap_or(0.0),
        timeout_seconds: definition.timeout_seconds,
        approval_required: definition.approval_required,
        approvers: definition.approvers.clone(),
        approval_timeout_seconds: definition.approval_timeout_seconds,
        router: definition.router.clone(),
    }
}

fn instantiate_workflow(
    definition: &WorkflowDefinition,
    request: &CreateWorkflowRequest,
    workflow_id: &str,
    now: DateTime<Utc>,
) -> Workflow {
    let steps: Vec<WorkflowStep> = definition.steps.iter().map(instantiate_step).collect();
    let first_step = steps
        .iter()
        .find(|s| !s.is_router())
        .map(|s| s.step_num)
        .unwrap_or(0);
    Workflow {
        workflow_id: workflow_id.to_string(),
        issue_number: request.issue_number.clone(),
        project_key: request.project_name.clone(),
        workflow_type: definition.workflow_type.clone(),
        state: WorkflowState::Created,
        current_step: first_step,
        steps,
        created_at: now,
        updated_at: now,
        active_agent_type: String::new(),
    }
}
