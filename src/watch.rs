//! Bridge from engine events to outbound notifications.
//!
//! Subscribes to workflow, step, and alert events on the bus and relays
//! them to a host-provided [`NotificationChannel`]. Deliveries are
//! throttled per issue and identical consecutive event keys are
//! deduplicated, so a chatty workflow does not flood the channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::events::{AlertSeverity, EventBus, EventKind, NexusEvent, SubscriptionId};
use crate::runtime::{Notification, NotificationChannel};

const DEFAULT_THROTTLE: Duration = Duration::from_secs(2);

#[derive(Clone)]
struct DeliveryState {
    last_sent_at: Instant,
    last_event_key: String,
}

struct WatchInner {
    channel: Arc<dyn NotificationChannel>,
    throttle: Duration,
    deliveries: Mutex<HashMap<String, DeliveryState>>,
}

pub struct WorkflowWatch {
    inner: Arc<WatchInner>,
}

impl WorkflowWatch {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self::with_throttle(channel, DEFAULT_THROTTLE)
    }

    pub fn with_throttle(channel: Arc<dyn NotificationChannel>, throttle: Duration) -> Self {
        Self {
            inner: Arc::new(WatchInner {
                channel,
                throttle,
                deliveries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Attach to the bus. Returns the subscription ids so the host can
    /// detach on shutdown.
    pub fn attach(&self, bus: &EventBus) -> Vec<SubscriptionId> {
        let mut ids = Vec::new();
        for pattern in ["workflow.*", "step.*", "system.alert"] {
            let inner = self.inner.clone();
            ids.push(bus.subscribe_pattern(
                pattern,
                EventBus::handler(move |event| {
                    let inner = inner.clone();
                    async move {
                        inner.relay(event).await;
                        Ok(())
                    }
                }),
            ));
        }
        ids
    }
}

impl WatchInner {
    async fn relay(&self, event: NexusEvent) {
        let Some(notification) = render(&event) else {
            return;
        };

        let key = format!(
            "{}:{}:{}",
            event.event_type(),
            event.workflow_id.as_deref().unwrap_or(""),
            notification.message
        );
        let gate_key = if notification.issue_number.is_empty() {
            event
                .workflow_id
                .clone()
                .unwrap_or_else(|| "global".to_string())
        } else {
            notification.issue_number.clone()
        };

        {
            let mut deliveries = self
                .deliveries
                .lock()
                .expect("watch delivery lock poisoned");
            if let Some(state) = deliveries.get(&gate_key) {
                let critical = notification.severity >= AlertSeverity::Error;
                if !critical
                    && (state.last_event_key == key
                        || state.last_sent_at.elapsed() < self.throttle)
                {
                    return;
                }
            }
            deliveries.insert(
                gate_key,
                DeliveryState {
                    last_sent_at: Instant::now(),
                    last_event_key: key,
                },
            );
        }

        if let Err(e) = self.channel.send(notification).await {
            tracing::warn!("Watch notification delivery failed: {e}");
        }
    }
}

fn render(event: &NexusEvent) -> Option<Notification> {
    let workflow_id = event.workflow_id.as_deref().unwrap_or("");
    let issue_number = event
        .data
        .get("issue_number")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let (message, severity, actions) = match &event.kind {
        EventKind::WorkflowStarted => (
            format!("Workflow {workflow_id} created"),
            AlertSeverity::Info,
            vec![],
        ),
        EventKind::WorkflowCompleted => (
            format!("Workflow {workflow_id} completed"),
            AlertSeverity::Info,
            vec![],
        ),
        EventKind::WorkflowFailed { error } => (
            format!("Workflow {workflow_id} failed: {error}"),
            AlertSeverity::Error,
            vec![],
        ),
        EventKind::WorkflowPaused { reason } => (
            format!("Workflow {workflow_id} paused: {reason}"),
            AlertSeverity::Info,
            vec![],
        ),
        EventKind::WorkflowCancelled => (
            format!("Workflow {workflow_id} cancelled"),
            AlertSeverity::Info,
            vec![],
        ),
        EventKind::ApprovalRequired {
            step_num,
            step_name,
            agent,
            approvers,
        } => (
            format!(
                "Approval required for step {step_num} ({step_name}, agent {agent}); approvers: {}",
                approvers.join(", ")
            ),
            AlertSeverity::Warning,
            vec![
                crate::events::AlertAction {
                    label: "Approve".to_string(),
                    callback_data: format!("approve:{workflow_id}:{step_num}"),
                    url: String::new(),
                },
                crate::events::AlertAction {
                    label: "Deny".to_string(),
                    callback_data: format!("deny:{workflow_id}:{step_num}"),
                    url: String::new(),
                },
            ],
        ),
        EventKind::StepStarted {
            step_num,
            step_name,
            agent_type,
        } => (
            format!("Step {step_num} ({step_name}) started with {agent_type}"),
            AlertSeverity::Info,
            vec![],
        ),
        EventKind::StepCompleted {
            step_num, step_name, ..
        } => (
            format!("Step {step_num} ({step_name}) completed"),
            AlertSeverity::Info,
            vec![],
        ),
        EventKind::StepFailed {
            step_num,
            step_name,
            error,
            ..
        } => (
            format!("Step {step_num} ({step_name}) failed: {error}"),
            AlertSeverity::Warning,
            vec![],
        ),
        EventKind::SystemAlert {
            message,
            severity,
            actions,
            issue_number: alert_issue,
            ..
        } => {
            let issue = if alert_issue.is_empty() {
                issue_number.clone()
            } else {
                alert_issue.clone()
            };
            return Some(Notification {
                message: message.clone(),
                severity: *severity,
                issue_number: issue,
                project_key: event
                    .data
                    .get("project_key")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                actions: actions.clone(),
            });
        }
        // Agent lifecycle and audit events are not surfaced to humans.
        _ => return None,
    };

    Some(Notification {
        message,
        severity,
        issue_number,
        project_key: String::new(),
        actions,
    })
}
