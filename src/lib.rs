//! # nexus-core
//!
//! Workflow orchestration kernel that drives issue-bound agent pipelines:
//! each ticket is bound to a workflow instance whose ordered steps each
//! nominate an agent, run it as a monitored subprocess, and advance when
//! the agent posts a structured completion signal on the remote ticket.
//!
//! ## Modules
//!
//! - `config` - Kernel configuration with TOML file and env overrides
//! - `definition` - Workflow definition loading and label normalization
//! - `engine` - Step state machine, routers, retries, approval gates
//! - `events` - Typed events and the in-process pub/sub bus
//! - `handoff` - Signed agent-to-agent handoff payloads and dispatch
//! - `model` - Workflow aggregates, steps, completions, approvals
//! - `orchestrator` - Launch registry, stuck-agent monitor, retry fuse
//! - `reconcile` - Remote-signal replay and drift-flagged snapshots
//! - `runtime` - Interfaces the host provides (launcher, platform, clock)
//! - `storage` - Filesystem and relational persistence drivers
//! - `watch` - Event-to-notification bridge with throttling

pub mod cli;
pub mod config;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod handoff;
pub mod model;
pub mod orchestrator;
pub mod reconcile;
pub mod runtime;
pub mod storage;
pub mod watch;

pub use config::NexusConfig;
pub use engine::{CreateWorkflowRequest, WorkflowEngine};
pub use error::{Error, Result};
pub use events::{EventBus, NexusEvent};
pub use model::{Workflow, WorkflowState, WorkflowStatus};
pub use orchestrator::ProcessOrchestrator;
pub use reconcile::Reconciler;
pub use storage::{FileStore, WorkflowStore};
