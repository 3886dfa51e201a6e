//! Reconciliation scenarios: replaying remote completion signals into a
//! drifted local workflow, seeding when local state is missing, and
//! snapshot drift flags.

mod common;

use common::*;
use nexus_core::model::WorkflowState;
use nexus_core::Reconciler;
use nexus_core::WorkflowStore;

#[tokio::test]
async fn replays_remote_signals_into_drifted_workflow() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    // Local store is at step 1; the remote issue has two completions.
    let platform = MockPlatform::new(vec![
        completion_comment("c-a", "triage", "developer", 20),
        completion_comment("c-b", "developer", "reviewer", 10),
    ]);

    let reconciler = Reconciler::new(h.engine.clone());
    let summary = reconciler
        .reconcile_issue_from_signals("42", "proj", &platform)
        .await
        .unwrap();

    assert!(summary.ok);
    assert_eq!(summary.signals_scanned, 2);
    assert_eq!(summary.signals_applied, 2);
    assert!(!summary.completion_seeded);
    assert_eq!(summary.workflow_state, "running");
    assert_eq!(summary.workflow_step, "3/3");
    assert_eq!(summary.workflow_agent, "reviewer");

    let completions = h.store.list_completions("42").await.unwrap();
    assert!(completions.iter().any(|c| c.comment_id == "c-a"));
    assert!(completions.iter().any(|c| c.comment_id == "c-b"));
    assert!(completions.iter().any(|c| c.source == "reconciled"));
}

#[tokio::test]
async fn replay_is_idempotent() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();

    let platform = MockPlatform::new(vec![
        completion_comment("c-a", "triage", "developer", 20),
        completion_comment("c-b", "developer", "reviewer", 10),
    ]);
    let reconciler = Reconciler::new(h.engine.clone());

    reconciler
        .reconcile_issue_from_signals("42", "proj", &platform)
        .await
        .unwrap();
    let first = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();

    reconciler
        .reconcile_issue_from_signals("42", "proj", &platform)
        .await
        .unwrap();
    let second = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();

    assert_eq!(first.current_step, second.current_step);
    assert_eq!(first.state, second.state);
    // Each remote comment produced exactly one step.completed.
    assert_eq!(h.count("step.completed"), 2);
}

#[tokio::test]
async fn paused_workflow_is_resumed_for_replay_then_repaused() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    h.engine.pause_workflow("42", "hold").await.unwrap();

    let platform = MockPlatform::new(vec![completion_comment("c-a", "triage", "developer", 5)]);
    let reconciler = Reconciler::new(h.engine.clone());
    let summary = reconciler
        .reconcile_issue_from_signals("42", "proj", &platform)
        .await
        .unwrap();

    assert_eq!(summary.signals_applied, 1);
    let workflow = h.engine.get_workflow_for_issue("42").await.unwrap().unwrap();
    assert_eq!(workflow.state, WorkflowState::Paused);
    assert_eq!(workflow.current_step, 2);
}

#[tokio::test]
async fn missing_workflow_seeds_resumption_anchor() {
    let h = harness(THREE_STEP_FULL).await;
    // No workflow was ever created for this issue.

    let platform = MockPlatform::new(vec![
        completion_comment("c-a", "triage", "developer", 20),
        completion_comment("c-b", "developer", "reviewer", 10),
    ]);
    let reconciler = Reconciler::new(h.engine.clone());
    let summary = reconciler
        .reconcile_issue_from_signals("77", "proj", &platform)
        .await
        .unwrap();

    assert!(summary.ok);
    assert_eq!(summary.signals_applied, 0);
    assert!(summary.completion_seeded);
    assert_eq!(summary.workflow_state, "unknown");

    // The latest signal became the local resumption anchor.
    let completions = h.store.list_completions("77").await.unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].completed_agent, "developer");
    assert_eq!(completions[0].next_agent, "reviewer");
    assert_eq!(completions[0].source, "reconciled");
    assert_eq!(h.count("system.alert"), 1);
}

#[tokio::test]
async fn no_signals_is_reported_not_fatal() {
    let h = harness(THREE_STEP_FULL).await;
    let platform = MockPlatform::new(vec![]);
    let reconciler = Reconciler::new(h.engine.clone());

    let summary = reconciler
        .reconcile_issue_from_signals("42", "proj", &platform)
        .await
        .unwrap();
    assert!(!summary.ok);
    assert!(summary.error.unwrap().contains("No structured completion"));
}

#[tokio::test]
async fn snapshot_flags_pairwise_drift() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    // Workflow expects triage to be running; the remote comment says the
    // developer already handed off to the reviewer.
    let platform = MockPlatform::new(vec![completion_comment("c-b", "developer", "reviewer", 5)]);

    let reconciler = Reconciler::new(h.engine.clone());
    let snapshot = reconciler
        .build_workflow_snapshot("42", &platform, None)
        .await
        .unwrap();

    assert_eq!(snapshot.workflow_state, "running");
    assert_eq!(snapshot.expected_running_agent, "triage");
    assert_eq!(snapshot.comment_next, "reviewer");
    assert!(snapshot
        .drift_flags
        .contains(&"workflow_vs_comment".to_string()));
    assert!(!snapshot
        .drift_flags
        .contains(&"workflow_state_missing".to_string()));
}

#[tokio::test]
async fn snapshot_flags_missing_workflow_state() {
    let h = harness(THREE_STEP_FULL).await;
    let platform = MockPlatform::new(vec![completion_comment("c-a", "triage", "developer", 5)]);

    let reconciler = Reconciler::new(h.engine.clone());
    let snapshot = reconciler
        .build_workflow_snapshot("99", &platform, None)
        .await
        .unwrap();

    assert_eq!(snapshot.workflow_state, "unknown");
    assert!(snapshot
        .drift_flags
        .contains(&"workflow_state_missing".to_string()));
}

#[tokio::test]
async fn snapshot_agrees_after_reconciliation() {
    let h = harness(THREE_STEP_FULL).await;
    let id = h
        .engine
        .create_workflow_for_issue(create_request("42"))
        .await
        .unwrap();
    h.engine.start_workflow(&id).await.unwrap();
    let platform = MockPlatform::new(vec![completion_comment("c-a", "triage", "developer", 5)]);

    let reconciler = Reconciler::new(h.engine.clone());
    reconciler
        .reconcile_issue_from_signals("42", "proj", &platform)
        .await
        .unwrap();
    let snapshot = reconciler
        .build_workflow_snapshot("42", &platform, None)
        .await
        .unwrap();

    assert_eq!(snapshot.expected_running_agent, "developer");
    assert_eq!(snapshot.local_next, "developer");
    assert_eq!(snapshot.comment_next, "developer");
    assert!(snapshot.drift_flags.is_empty());
}
