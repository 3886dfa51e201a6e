//! End-to-end engine scenarios: happy path, retries, approval gates,
//! pause semantics, drift recovery, and router loops.

mod common;

use common::*;
use nexus_core::error::Error;
use nexus_core::model::{StepStatus, WorkflowState};
use nexus_core::WorkflowStore;

#[tokio::test]
async fn happy_path_three_steps() {
    let h = harness(THREE_STEP_FULL).await;

    let workflow_id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    assert_eq!(workflow_id, "proj-42-full");
    assert_eq!(h.count("workflow.started"), 1);

    assert!(h.engine.start_workflow(&workflow_id).await.unwrap());
    let status = h.engine.get_workflow_status("42").await.unwrap().unwrap();
    assert_eq!(status.state, WorkflowState::Running);
    assert_eq!(status.current_step, 1);
    assert_eq!(status.current_agent, "triage");

    h.engine
        .complete_step_for_issue("42", "triage", complete_outputs("developer"), "c1")
        .await
        .unwrap();
    let status = h.engine.get_workflow_status("42").await.unwrap().unwrap();
    assert_eq!(status.current_step, 2);
    assert_eq!(status.current_agent, "developer");

    h.engine
        .complete_step_for_issue("42", "developer", complete_outputs("reviewer"), "c2")
        .await
        .unwrap();
    let workflow = h
        .engine
        .complete_step_for_issue("42", "reviewer", complete_outputs(""), "c3")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(workflow.state, WorkflowState::Completed);
    assert!(workflow.running_step().is_none());
    assert_eq!(h.count("step.completed"), 3);
    assert_eq!(h.count("workflow.completed"), 1);

    // step.completed for N always precedes step.started for N+1.
    let recorded = h.recorded();
    let first_completed = recorded.iter().position(|e| e == "step.completed").unwrap();
    let second_started = recorded
        .iter()
        .enumerate()
        .filter(|(_, e)| *e == "step.started")
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    assert!(first_completed < second_started);
}

#[tokio::test]
async fn completion_is_idempotent_on_event_id() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    let first = h
        .engine
        .complete_step_for_issue("42", "triage", complete_outputs("developer"), "c1")
        .await
        .unwrap()
        .unwrap();
    let second = h
        .engine
        .complete_step_for_issue("42", "triage", complete_outputs("developer"), "c1")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.current_step, second.current_step);
    assert_eq!(first.state, second.state);
    assert_eq!(h.count("step.completed"), 1);
}

#[tokio::test]
async fn retry_then_exhaustion_fails_workflow() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    h.engine
        .complete_step_for_issue("42", "triage", complete_outputs("developer"), "c1")
        .await
        .unwrap();

    // First failure: back to pending, retry scheduled at +1s.
    let workflow = h
        .engine
        .complete_step_for_issue("42", "developer", failed_outputs("timeout"), "c-fail-1")
        .await
        .unwrap()
        .unwrap();
    let step = workflow.step(2).unwrap();
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(step.retry_count, 1);
    assert!(step.completed_at.is_none());
    assert_eq!(workflow.state, WorkflowState::Running);
    assert_eq!(h.count("agent.retry"), 1);

    // Second failure doubles the backoff.
    let workflow = h
        .engine
        .complete_step_for_issue("42", "developer", failed_outputs("timeout"), "c-fail-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workflow.step(2).unwrap().retry_count, 2);
    assert_eq!(h.count("agent.retry"), 2);

    // Third failure exhausts max_retries=2.
    let workflow = h
        .engine
        .complete_step_for_issue("42", "developer", failed_outputs("timeout"), "c-fail-3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workflow.step(2).unwrap().status, StepStatus::Failed);
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert_eq!(h.count("step.failed"), 1);
    assert_eq!(h.count("workflow.failed"), 1);
}

#[tokio::test]
async fn approval_gate_suspends_then_approval_resumes() {
    let h = harness(APPROVAL_GATED).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    let workflow = h
        .engine
        .complete_step_for_issue("42", "developer", complete_outputs("deployer"), "c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workflow.state, WorkflowState::ApprovalWait);
    assert_eq!(workflow.step(2).unwrap().status, StepStatus::Pending);
    assert_eq!(h.count("workflow.approval_required"), 1);

    let approval = h.store.pending_approval("42").await.unwrap().unwrap();
    assert_eq!(approval.step_num, 2);
    assert_eq!(approval.approvers, vec!["alice".to_string()]);
    assert!(approval.expires_at.is_some());

    // Unauthorized approver is ignored.
    assert!(!h.engine.approve_step("42", "mallory").await.unwrap());

    assert!(h.engine.approve_step("42", "alice").await.unwrap());
    let workflow = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();
    assert_eq!(workflow.state, WorkflowState::Running);
    assert_eq!(workflow.step(2).unwrap().status, StepStatus::Running);
    assert!(h.store.pending_approval("42").await.unwrap().is_none());
    assert_eq!(h.count("step.started"), 2);
}

#[tokio::test]
async fn denial_fails_workflow() {
    let h = harness(APPROVAL_GATED).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    h.engine
        .complete_step_for_issue("42", "developer", complete_outputs("deployer"), "c1")
        .await
        .unwrap();

    assert!(h.engine.deny_step("42", "alice").await.unwrap());
    let workflow = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert_eq!(h.count("workflow.failed"), 1);
}

#[tokio::test]
async fn approval_timeout_fails_workflow() {
    let h = harness(APPROVAL_GATED).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    h.engine
        .complete_step_for_issue("42", "developer", complete_outputs("deployer"), "c1")
        .await
        .unwrap();

    // Not yet expired.
    assert_eq!(h.engine.expire_pending_approvals().await.unwrap(), 0);

    h.clock.advance(chrono::Duration::seconds(3601));
    assert_eq!(h.engine.expire_pending_approvals().await.unwrap(), 1);

    let workflow = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();
    assert_eq!(workflow.state, WorkflowState::Failed);
    assert!(h.store.pending_approval("42").await.unwrap().is_none());
}

#[tokio::test]
async fn paused_workflow_rejects_completion() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    assert!(h.engine.pause_workflow("42", "maintenance").await.unwrap());

    let err = h
        .engine
        .complete_step_for_issue("42", "triage", complete_outputs("developer"), "c1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WorkflowPaused(_)));

    // Nothing persisted: the step is still running after resume.
    assert!(h.engine.resume_workflow("42").await.unwrap());
    let workflow = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();
    assert_eq!(workflow.step(1).unwrap().status, StepStatus::Running);
}

#[tokio::test]
async fn unknown_agent_completion_does_not_advance() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    let workflow = h
        .engine
        .complete_step_for_issue("42", "rogue-agent", complete_outputs("developer"), "c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workflow.current_step, 1);
    assert_eq!(workflow.step(1).unwrap().status, StepStatus::Running);
    assert_eq!(h.count("step.completed"), 0);
    // Recorded in history for the reconciler.
    let completions = h.store.list_completions("42").await.unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].completed_agent, "rogue-agent");
    assert_eq!(h.count("system.alert"), 1);
}

#[tokio::test]
async fn duplicate_of_previous_step_is_deduplicated() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    h.engine
        .complete_step_for_issue("42", "triage", complete_outputs("developer"), "c1")
        .await
        .unwrap();

    // Same agent posts again under a fresh comment id.
    let workflow = h
        .engine
        .complete_step_for_issue("42", "triage", complete_outputs("developer"), "c1-dup")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workflow.current_step, 2);
    assert_eq!(h.count("step.completed"), 1);
}

#[tokio::test]
async fn later_step_completion_recovers_drift() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    // Local pointer says triage, but the reviewer already finished.
    let workflow = h
        .engine
        .complete_step_for_issue("42", "reviewer", complete_outputs(""), "c9")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(workflow.state, WorkflowState::Completed);
    assert_eq!(workflow.step(1).unwrap().status, StepStatus::Skipped);
    assert_eq!(workflow.step(2).unwrap().status, StepStatus::Skipped);
    assert_eq!(workflow.step(3).unwrap().status, StepStatus::Completed);
    assert_eq!(h.count("system.alert"), 1);
}

#[tokio::test]
async fn agent_names_match_after_normalization() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    let workflow = h
        .engine
        .complete_step_for_issue("42", "Triage", complete_outputs("developer"), "c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(workflow.current_step, 2);
    assert_eq!(h.count("step.completed"), 1);
}

#[tokio::test]
async fn router_loops_back_then_takes_default() {
    let h = harness(REVIEW_LOOP).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    h.engine
        .complete_step_for_issue("42", "developer", complete_outputs("reviewer"), "c1")
        .await
        .unwrap();
    let mut rework = complete_outputs("developer");
    rework.insert(
        "review_verdict".to_string(),
        serde_json::json!("changes_requested"),
    );
    let workflow = h
        .engine
        .complete_step_for_issue("42", "reviewer", rework, "c2")
        .await
        .unwrap()
        .unwrap();

    // Back-edge taken: develop re-runs, loop counter recorded.
    assert_eq!(workflow.current_step, 1);
    assert_eq!(workflow.step(1).unwrap().status, StepStatus::Running);
    assert_eq!(
        workflow.step(3).unwrap().outputs.get("loop_count"),
        Some(&serde_json::json!(1))
    );

    h.engine
        .complete_step_for_issue("42", "developer", complete_outputs("reviewer"), "c3")
        .await
        .unwrap();
    let mut approved = complete_outputs("finalizer");
    approved.insert("review_verdict".to_string(), serde_json::json!("approved"));
    let workflow = h
        .engine
        .complete_step_for_issue("42", "reviewer", approved, "c4")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(workflow.current_step, 4);
    assert_eq!(workflow.step(4).unwrap().status, StepStatus::Running);
    assert_eq!(workflow.step(4).unwrap().agent.name, "finalizer");
}

#[tokio::test]
async fn active_mapping_blocks_second_workflow_without_replace() {
    let h = harness(THREE_STEP_FULL).await;
    h.engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();

    let err = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ActiveMappingExists(_)));

    let mut replace = create_request("42");
    replace.replace_existing = true;
    let id = h.engine.create_workflow_for_issue(replace).await.unwrap();
    assert_eq!(id, "proj-42-full");
    assert_eq!(h.count("workflow.cancelled"), 1);
}

#[tokio::test]
async fn reset_rewinds_to_agent_step() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    h.engine
        .complete_step_for_issue("42", "triage", complete_outputs("developer"), "c1")
        .await
        .unwrap();
    h.engine
        .complete_step_for_issue("42", "developer", complete_outputs("reviewer"), "c2")
        .await
        .unwrap();

    assert!(h
        .engine
        .reset_to_agent_for_issue("42", "developer")
        .await
        .unwrap());
    let workflow = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();
    assert_eq!(workflow.current_step, 2);
    assert_eq!(workflow.step(2).unwrap().status, StepStatus::Pending);
    assert!(workflow.running_step().is_none());
    assert_eq!(workflow.state, WorkflowState::Running);

    assert!(!h
        .engine
        .reset_to_agent_for_issue("42", "nonexistent")
        .await
        .unwrap());
}

#[tokio::test]
async fn exactly_one_step_running_at_all_times() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    for (agent, next, event) in [
        ("triage", "developer", "c1"),
        ("developer", "reviewer", "c2"),
        ("reviewer", "", "c3"),
    ] {
        let workflow = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();
        let running = workflow
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Running)
            .count();
        assert_eq!(running, 1, "exactly one step running before {agent}");
        h.engine
            .complete_step_for_issue("42", agent, complete_outputs(next), event)
            .await
            .unwrap();
    }

    let workflow = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();
    assert!(workflow.is_terminal());
    assert!(workflow.running_step().is_none());
}
