//! Shared fixtures: a tempdir-backed engine harness, a scripted agent
//! runtime, a canned issue platform, and a settable clock.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use nexus_core::config::NexusConfig;
use nexus_core::engine::WorkflowEngine;
use nexus_core::events::EventBus;
use nexus_core::runtime::{
    AgentLaunch, AgentRuntime, Clock, Comment, IssueDetails, IssuePlatform, IssueSummary,
};
use nexus_core::storage::FileStore;

pub const THREE_STEP_FULL: &str = r#"
name: full-delivery
workflow_type: full
steps:
  - step_num: 1
    name: triage
    agent:
      name: triage
      display_name: Triage
  - step_num: 2
    name: develop
    agent:
      name: developer
      display_name: Developer
    max_retries: 2
    initial_delay_seconds: 1.0
    backoff_strategy: exponential
  - step_num: 3
    name: review
    agent:
      name: reviewer
      display_name: Reviewer
"#;

pub const APPROVAL_GATED: &str = r#"
name: gated-delivery
workflow_type: full
steps:
  - step_num: 1
    name: develop
    agent:
      name: developer
  - step_num: 2
    name: deploy
    agent:
      name: deployer
    approval_required: true
    approvers: [alice]
    approval_timeout_seconds: 3600
"#;

pub const REVIEW_LOOP: &str = r#"
name: looped-delivery
workflow_type: full
steps:
  - step_num: 1
    name: develop
    agent:
      name: developer
  - step_num: 2
    name: review
    agent:
      name: reviewer
  - step_num: 3
    name: review-gate
    router:
      branches:
        - predicate: "review_verdict == changes_requested"
          next_step_num: 1
          loop: true
      default: 4
      max_loops: 2
  - step_num: 4
    name: finalize
    agent:
      name: finalizer
"#;

pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(Utc::now()),
        })
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

pub struct TestHarness {
    pub engine: Arc<WorkflowEngine>,
    pub bus: Arc<EventBus>,
    pub store: Arc<FileStore>,
    pub clock: Arc<MockClock>,
    pub events: Arc<Mutex<Vec<String>>>,
    pub config: NexusConfig,
    _root: TempDir,
}

/// Build an engine over a temp storage root with the given definition
/// installed for its workflow type. Every emitted event type is recorded
/// in order.
pub async fn harness(definition_yaml: &str) -> TestHarness {
    let root = TempDir::new().unwrap();
    let storage_root = root.path().join("storage");
    let definitions_dir = root.path().join("workflows");
    std::fs::create_dir_all(&definitions_dir).unwrap();

    let definition = nexus_core::definition::parse_definition(definition_yaml).unwrap();
    std::fs::write(
        definitions_dir.join(format!("{}.yaml", definition.workflow_type)),
        definition_yaml,
    )
    .unwrap();

    let config = NexusConfig {
        storage_root: storage_root.clone(),
        definitions_dir,
        ..NexusConfig::default()
    };

    let store = Arc::new(FileStore::new(storage_root).await.unwrap());
    let bus = Arc::new(EventBus::new());
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = events.clone();
    bus.subscribe_pattern(
        "*",
        EventBus::handler(move |event| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().unwrap().push(event.event_type().to_string());
                Ok(())
            }
        }),
    );

    let clock = MockClock::new();
    let engine = Arc::new(WorkflowEngine::with_clock(
        store.clone(),
        bus.clone(),
        config.clone(),
        clock.clone(),
    ));

    TestHarness {
        engine,
        bus,
        store,
        clock,
        events,
        config,
        _root: root,
    }
}

impl TestHarness {
    pub fn recorded(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.recorded().iter().filter(|e| *e == event_type).count()
    }
}

/// Scripted launcher: records calls, optionally declining the first N.
pub struct MockRuntime {
    pub launches: Mutex<Vec<(String, String, String)>>,
    pub decline_first: usize,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: Mutex::new(Vec::new()),
            decline_first: 0,
        })
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn launch_agent(
        &self,
        issue_number: &str,
        agent_type: &str,
        trigger_source: &str,
    ) -> nexus_core::Result<Option<AgentLaunch>> {
        let mut launches = self.launches.lock().unwrap();
        launches.push((
            issue_number.to_string(),
            agent_type.to_string(),
            trigger_source.to_string(),
        ));
        if launches.len() <= self.decline_first {
            return Ok(None);
        }
        Ok(Some(AgentLaunch {
            pid: 10_000 + launches.len() as u32,
            tool: "copilot".to_string(),
        }))
    }
}

/// Canned ticket platform serving a fixed comment stream.
pub struct MockPlatform {
    pub comments: Mutex<Vec<Comment>>,
}

impl MockPlatform {
    pub fn new(comments: Vec<Comment>) -> Self {
        Self {
            comments: Mutex::new(comments),
        }
    }
}

pub fn completion_comment(id: &str, agent: &str, next: &str, minutes_ago: i64) -> Comment {
    let body = if next.is_empty() {
        format!("## Work Complete — {agent}\n\nAll done.")
    } else {
        format!("## Work Complete — {agent}\n\nReady for **@{next}**")
    };
    Comment {
        id: id.to_string(),
        author: "agent-bot".to_string(),
        body,
        created_at: Utc::now() - Duration::minutes(minutes_ago),
        url: String::new(),
    }
}

#[async_trait]
impl IssuePlatform for MockPlatform {
    async fn get_issue(
        &self,
        issue_number: &str,
        _fields: &[&str],
    ) -> nexus_core::Result<Option<IssueDetails>> {
        Ok(Some(IssueDetails {
            number: issue_number.to_string(),
            title: "test issue".to_string(),
            body: String::new(),
            state: "open".to_string(),
            labels: vec!["workflow:full".to_string()],
            comments: self.comments.lock().unwrap().clone(),
        }))
    }

    async fn add_comment(&self, _issue_number: &str, body: &str) -> nexus_core::Result<String> {
        let mut comments = self.comments.lock().unwrap();
        let id = format!("c-{}", comments.len() + 1);
        comments.push(Comment {
            id: id.clone(),
            author: "agent-bot".to_string(),
            body: body.to_string(),
            created_at: Utc::now(),
            url: String::new(),
        });
        Ok(id)
    }

    async fn get_comments(
        &self,
        _issue_number: &str,
        _since: Option<DateTime<Utc>>,
    ) -> nexus_core::Result<Vec<Comment>> {
        Ok(self.comments.lock().unwrap().clone())
    }

    async fn close_issue(
        &self,
        _issue_number: &str,
        _comment: Option<&str>,
    ) -> nexus_core::Result<()> {
        Ok(())
    }

    async fn create_pr_from_changes(
        &self,
        _repo_dir: &std::path::Path,
        _issue_number: &str,
        _title: &str,
        _body: &str,
    ) -> nexus_core::Result<Option<String>> {
        Ok(None)
    }

    async fn list_open_issues(
        &self,
        _limit: usize,
        _labels: &[String],
    ) -> nexus_core::Result<Vec<IssueSummary>> {
        Ok(vec![])
    }
}

/// Outputs map for a successful completion.
pub fn complete_outputs(next_agent: &str) -> HashMap<String, serde_json::Value> {
    let mut outputs = HashMap::new();
    outputs.insert("status".to_string(), serde_json::json!("complete"));
    if !next_agent.is_empty() {
        outputs.insert("next_agent".to_string(), serde_json::json!(next_agent));
    }
    outputs
}

/// Outputs map for a failed completion.
pub fn failed_outputs(error: &str) -> HashMap<String, serde_json::Value> {
    let mut outputs = HashMap::new();
    outputs.insert("status".to_string(), serde_json::json!("failed"));
    outputs.insert("error".to_string(), serde_json::json!(error));
    outputs
}

pub fn create_request(issue: &str) -> nexus_core::CreateWorkflowRequest {
    nexus_core::CreateWorkflowRequest {
        issue_number: issue.to_string(),
        issue_title: "add feature".to_string(),
        project_name: "proj".to_string(),
        workflow_type: "full".to_string(),
        task_type: "feature".to_string(),
        description: String::new(),
        replace_existing: false,
    }
}
