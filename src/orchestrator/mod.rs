//! Process orchestration: launch registry, stuck-agent detection, kill
//! escalation, dead-agent recovery, and the per-issue retry fuse.
//!
//! The orchestrator owns the only mutable view of running agent
//! processes. Its poll loop reconciles three signals — registry PIDs,
//! log-file activity, and workflow position — and never unwinds workflow
//! state itself: failures become audit records and alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::MonitorConfig;
use crate::definition::normalize_agent_key;
use crate::engine::WorkflowEngine;
use crate::error::Result;
use crate::events::{AlertSeverity, EventBus, EventKind, NexusEvent};
use crate::runtime::{AgentRuntime, Clock, SystemClock};

pub mod fuse;
pub mod monitor;

pub use fuse::{FuseDecision, RetryFuseState, RetryFuseStatus};

const REGISTRY_FILE: &str = "launched_agents.json";

/// One tracked agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub pid: u32,
    pub agent_type: String,
    pub log_file_path: PathBuf,
    pub launched_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_fuse: Option<RetryFuseState>,
}

pub struct ProcessOrchestrator {
    registry_path: PathBuf,
    registry: Mutex<HashMap<String, LaunchRecord>>,
    engine: Arc<WorkflowEngine>,
    runtime: Arc<dyn AgentRuntime>,
    bus: Arc<EventBus>,
    config: MonitorConfig,
    clock: Arc<dyn Clock>,
}

impl ProcessOrchestrator {
    pub fn new(
        engine: Arc<WorkflowEngine>,
        runtime: Arc<dyn AgentRuntime>,
        bus: Arc<EventBus>,
        storage_root: &std::path::Path,
        config: MonitorConfig,
    ) -> Result<Self> {
        Self::with_clock(engine, runtime, bus, storage_root, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        engine: Arc<WorkflowEngine>,
        runtime: Arc<dyn AgentRuntime>,
        bus: Arc<EventBus>,
        storage_root: &std::path::Path,
        config: MonitorConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let registry_path = storage_root.join(REGISTRY_FILE);
        let registry = if registry_path.exists() {
            let content = std::fs::read_to_string(&registry_path)?;
            serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Launch registry unreadable, starting empty: {e}");
                HashMap::new()
            })
        } else {
            HashMap::new()
        };
        Ok(Self {
            registry_path,
            registry: Mutex::new(registry),
            engine,
            runtime,
            bus,
            config,
            clock,
        })
    }

    async fn persist(&self, registry: &HashMap<String, LaunchRecord>) -> Result<()> {
        let content = serde_json::to_string_pretty(registry)?;
        let tmp = self.registry_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.registry_path).await?;
        Ok(())
    }

    /// Track a freshly launched agent. The retry fuse for the issue
    /// survives relaunches.
    pub async fn register_launch(
        &self,
        issue_number: &str,
        pid: u32,
        agent_type: &str,
        log_file_path: PathBuf,
    ) -> Result<()> {
        {
            let mut registry = self.registry.lock().await;
            let retry_fuse = registry
                .get(issue_number)
                .and_then(|r| r.retry_fuse.clone());
            registry.insert(
                issue_number.to_string(),
                LaunchRecord {
                    pid,
                    agent_type: agent_type.to_string(),
                    log_file_path,
                    launched_at: self.clock.now(),
                    retry_fuse,
                },
            );
            self.persist(&registry).await?;
        }
        self.bus
            .emit(NexusEvent::new(EventKind::AgentLaunched {
                agent_name: agent_type.to_string(),
            }))
            .await;
        Ok(())
    }

    pub async fn clear_launch(&self, issue_number: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if registry.remove(issue_number).is_some() {
            self.persist(&registry).await?;
        }
        Ok(())
    }

    pub async fn launch_record(&self, issue_number: &str) -> Option<LaunchRecord> {
        self.registry.lock().await.get(issue_number).cloned()
    }

    /// Registry lookup combined with a platform liveness check.
    pub async fn is_issue_process_running(&self, issue_number: &str) -> bool {
        match self.launch_record(issue_number).await {
            Some(record) => monitor::pid_alive(record.pid),
            None => false,
        }
    }

    /// Check the tracked process for a stale log. Returns the live PID
    /// when the agent is stuck.
    pub async fn check_timeout(&self, issue_number: &str) -> Option<u32> {
        let record = self.launch_record(issue_number).await?;
        let timeout = self
            .effective_timeout(issue_number)
            .await
            .unwrap_or(self.config.agent_timeout);

        if !monitor::check_log_timeout(&record.log_file_path, timeout) {
            return None;
        }
        if !monitor::pid_alive(record.pid) {
            return None;
        }
        tracing::warn!(
            "Issue #{issue_number}: agent timeout detected (PID: {})",
            record.pid
        );
        Some(record.pid)
    }

    async fn effective_timeout(&self, issue_number: &str) -> Option<std::time::Duration> {
        let workflow = self
            .engine
            .get_workflow_for_issue(issue_number)
            .await
            .ok()??;
        workflow
            .running_step()
            .map(|s| std::time::Duration::from_secs(s.effective_timeout_seconds()))
    }

    /// Kill a stuck agent with graceful-then-force escalation, recording
    /// an audit event and a warning alert.
    pub async fn kill_agent(&self, pid: u32, issue_number: &str) -> Result<bool> {
        let record = self.launch_record(issue_number).await;
        let killed = monitor::kill_with_escalation(pid, self.config.kill_grace).await;
        if !killed {
            tracing::error!("Failed to kill agent PID {pid} for issue #{issue_number}");
            self.bus
                .emit(
                    NexusEvent::alert(
                        format!("Failed to kill stuck agent PID {pid} on issue #{issue_number}"),
                        AlertSeverity::Warning,
                        "process_orchestrator",
                    )
                    .with_data("issue_number", json!(issue_number)),
                )
                .await;
            return Ok(false);
        }

        tracing::warn!("Killed stuck agent PID {pid} for issue #{issue_number}");
        let last_activity = record
            .as_ref()
            .and_then(|r| std::fs::metadata(&r.log_file_path).ok())
            .and_then(|m| m.modified().ok())
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string());

        self.engine
            .store()
            .append_audit(
                issue_number,
                "AGENT_TIMEOUT_KILL",
                json!({ "pid": pid, "last_activity": last_activity }),
            )
            .await?;
        self.bus
            .emit(NexusEvent::new(EventKind::AgentTimeout {
                agent_name: record
                    .as_ref()
                    .map(|r| r.agent_type.clone())
                    .unwrap_or_default(),
                pid: Some(pid),
            }))
            .await;
        self.bus
            .emit(
                NexusEvent::alert(
                    format!(
                        "Killed stuck agent PID {pid} on issue #{issue_number} (last activity {last_activity})"
                    ),
                    AlertSeverity::Warning,
                    "process_orchestrator",
                )
                .with_data("issue_number", json!(issue_number)),
            )
            .await;
        self.bus
            .emit(NexusEvent::new(EventKind::AuditLogged {
                audit_event_type: "AGENT_TIMEOUT_KILL".to_string(),
            }))
            .await;
        Ok(true)
    }

    /// Consult the retry fuse for `(issue, agent)` and record the
    /// attempt. Trips emit an error-severity alert and block retries.
    pub async fn should_retry(&self, issue_number: &str, agent_type: &str) -> bool {
        let now = self.clock.now().timestamp() as f64;
        let decision;
        let newly_alerted;
        {
            let mut registry = self.registry.lock().await;
            let record = registry
                .entry(issue_number.to_string())
                .or_insert_with(|| LaunchRecord {
                    pid: 0,
                    agent_type: agent_type.to_string(),
                    log_file_path: PathBuf::new(),
                    launched_at: self.clock.now(),
                    retry_fuse: None,
                });
            let state = record.retry_fuse.get_or_insert_with(RetryFuseState::default);
            decision = fuse::register_attempt(state, agent_type, now, &self.config.fuse);
            newly_alerted = !decision.allowed() && !state.alerted;
            if newly_alerted {
                state.alerted = true;
            }
            if let Err(e) = self.persist(&registry).await {
                tracing::error!("Failed to persist retry fuse state: {e}");
            }
        }

        if newly_alerted {
            let message = match decision {
                FuseDecision::HardTripped => format!(
                    "Retry fuse hard stop for issue #{issue_number} ({agent_type}): second trip within the hard window; manual reset required"
                ),
                _ => format!(
                    "Retry fuse tripped for issue #{issue_number} ({agent_type}): too many retries in window"
                ),
            };
            self.bus
                .emit(
                    NexusEvent::alert(message, AlertSeverity::Error, "process_orchestrator")
                        .with_data("issue_number", json!(issue_number)),
                )
                .await;
        }
        decision.allowed()
    }

    pub async fn fuse_status(&self, issue_number: &str) -> RetryFuseStatus {
        let now = self.clock.now().timestamp() as f64;
        let registry = self.registry.lock().await;
        fuse::fuse_status(
            registry.get(issue_number).and_then(|r| r.retry_fuse.as_ref()),
            now,
            &self.config.fuse,
        )
    }

    /// Manual fuse reset; clears soft and hard trips.
    pub async fn reset_fuse(&self, issue_number: &str) -> Result<bool> {
        let mut registry = self.registry.lock().await;
        let Some(record) = registry.get_mut(issue_number) else {
            return Ok(false);
        };
        if record.retry_fuse.take().is_none() {
            return Ok(false);
        }
        self.persist(&registry).await?;
        Ok(true)
    }

    /// One poll iteration: expire approval gates, then reconcile every
    /// tracked process against its log activity and workflow position.
    pub async fn tick(&self) {
        if let Err(e) = self.engine.expire_pending_approvals().await {
            tracing::error!("Approval expiry sweep failed: {e}");
        }

        let snapshot: Vec<(String, LaunchRecord)> = {
            let registry = self.registry.lock().await;
            registry
                .iter()
                .filter(|(_, r)| r.pid != 0)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        for (issue_number, record) in snapshot {
            if !monitor::pid_alive(record.pid) {
                self.handle_dead_agent(&issue_number, &record).await;
                continue;
            }
            if let Some(pid) = self.check_timeout(&issue_number).await {
                match self.kill_agent(pid, &issue_number).await {
                    Ok(true) => {
                        self.retry_after_stop(&issue_number, &record, "timeout-retry")
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            "Kill escalation bookkeeping failed for issue #{issue_number}: {e}"
                        );
                    }
                }
            }
        }
    }

    /// A dead agent is one whose PID is gone while its workflow step is
    /// still running.
    async fn handle_dead_agent(&self, issue_number: &str, record: &LaunchRecord) {
        let workflow = match self.engine.get_workflow_for_issue(issue_number).await {
            Ok(Some(w)) => w,
            Ok(None) => {
                let _ = self.clear_launch(issue_number).await;
                return;
            }
            Err(e) => {
                tracing::error!("Dead-agent check could not load workflow for #{issue_number}: {e}");
                return;
            }
        };

        if workflow.is_terminal() {
            let _ = self.clear_launch(issue_number).await;
            return;
        }

        let running_matches = workflow
            .running_step()
            .map(|s| normalize_agent_key(&s.agent.name) == normalize_agent_key(&record.agent_type))
            .unwrap_or(false);

        if running_matches {
            tracing::warn!(
                "Agent {} for issue #{issue_number} died mid-step (PID {}); scheduling retry",
                record.agent_type,
                record.pid
            );
            self.retry_after_stop(issue_number, record, "dead-agent-retry")
                .await;
        } else {
            tracing::warn!(
                "Issue #{issue_number}: dead PID {} belongs to {} but workflow runs {:?}; leaving drift to the reconciler",
                record.pid,
                record.agent_type,
                workflow.running_step().map(|s| s.agent.name.clone())
            );
        }
    }

    async fn retry_after_stop(&self, issue_number: &str, record: &LaunchRecord, trigger: &str) {
        if !self.should_retry(issue_number, &record.agent_type).await {
            return;
        }

        match self
            .runtime
            .launch_agent(issue_number, &record.agent_type, trigger)
            .await
        {
            Ok(Some(launch)) => {
                let attempt = {
                    let registry = self.registry.lock().await;
                    registry
                        .get(issue_number)
                        .and_then(|r| r.retry_fuse.as_ref())
                        .map(|f| f.attempts)
                        .unwrap_or(1)
                };
                if let Err(e) = self
                    .register_launch(
                        issue_number,
                        launch.pid,
                        &record.agent_type,
                        record.log_file_path.clone(),
                    )
                    .await
                {
                    tracing::error!("Failed to track relaunched agent: {e}");
                }
                self.bus
                    .emit(NexusEvent::new(EventKind::AgentRetry {
                        agent_name: record.agent_type.clone(),
                        attempt,
                        backoff_seconds: 0.0,
                    }))
                    .await;
            }
            Ok(None) => {
                tracing::warn!(
                    "Runtime declined relaunch of {} for issue #{issue_number}",
                    record.agent_type
                );
            }
            Err(e) => {
                tracing::error!(
                    "Relaunch of {} for issue #{issue_number} failed: {e}",
                    record.agent_type
                );
            }
        }
    }

    /// Poll until the host signals shutdown. In-flight work for the
    /// current tick drains before the loop exits; no new escalations
    /// start after the signal.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Process orchestrator shutting down");
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}
