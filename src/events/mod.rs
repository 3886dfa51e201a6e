//! Typed events emitted by the workflow engine and process orchestrator,
//! plus the in-process publish/subscribe bus that decouples them from
//! notifiers and observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod bus;

pub use bus::{EventBus, EventHandler, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// Interactive action attached to a `SystemAlert`, rendered by
/// notification channels as inline buttons.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertAction {
    pub label: String,
    #[serde(default)]
    pub callback_data: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed {
        error: String,
    },
    WorkflowPaused {
        reason: String,
    },
    WorkflowCancelled,
    ApprovalRequired {
        step_num: u32,
        step_name: String,
        agent: String,
        approvers: Vec<String>,
    },
    StepStarted {
        step_num: u32,
        step_name: String,
        agent_type: String,
    },
    StepCompleted {
        step_num: u32,
        step_name: String,
        agent_type: String,
        outputs: Map<String, Value>,
    },
    StepFailed {
        step_num: u32,
        step_name: String,
        agent_type: String,
        error: String,
    },
    AgentLaunched {
        agent_name: String,
    },
    AgentTimeout {
        agent_name: String,
        pid: Option<u32>,
    },
    AgentRetry {
        agent_name: String,
        attempt: u32,
        backoff_seconds: f64,
    },
    SystemAlert {
        message: String,
        severity: AlertSeverity,
        source: String,
        project_key: String,
        issue_number: String,
        actions: Vec<AlertAction>,
    },
    AuditLogged {
        audit_event_type: String,
    },
}

impl EventKind {
    /// Dotted event-type name used for subscription matching.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow.started",
            EventKind::WorkflowCompleted => "workflow.completed",
            EventKind::WorkflowFailed { .. } => "workflow.failed",
            EventKind::WorkflowPaused { .. } => "workflow.paused",
            EventKind::WorkflowCancelled => "workflow.cancelled",
            EventKind::ApprovalRequired { .. } => "workflow.approval_required",
            EventKind::StepStarted { .. } => "step.started",
            EventKind::StepCompleted { .. } => "step.completed",
            EventKind::StepFailed { .. } => "step.failed",
            EventKind::AgentLaunched { .. } => "agent.launched",
            EventKind::AgentTimeout { .. } => "agent.timeout",
            EventKind::AgentRetry { .. } => "agent.retry",
            EventKind::SystemAlert { .. } => "system.alert",
            EventKind::AuditLogged { .. } => "audit.logged",
        }
    }
}

/// An event on the bus: a typed kind plus the common envelope fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NexusEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl NexusEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            workflow_id: None,
            data: Map::new(),
        }
    }

    pub fn with_workflow(kind: EventKind, workflow_id: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            workflow_id: Some(workflow_id.into()),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    pub fn alert(
        message: impl Into<String>,
        severity: AlertSeverity,
        source: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::SystemAlert {
            message: message.into(),
            severity,
            source: source.into(),
            project_key: String::new(),
            issue_number: String::new(),
            actions: Vec::new(),
        })
    }
}
