//! Operator CLI: local-state inspection and manual recovery commands.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::NexusConfig;
use crate::definition::load_definition;
use crate::engine::WorkflowEngine;
use crate::events::EventBus;
use crate::orchestrator::ProcessOrchestrator;
use crate::runtime::{AgentLaunch, AgentRuntime};
use crate::storage::FileStore;

#[derive(Parser)]
#[command(name = "nexus", about = "Workflow orchestration kernel operator tools")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a workflow definition file
    Validate {
        /// Path to the definition YAML
        path: PathBuf,
    },
    /// Show workflow status for an issue
    Status {
        issue: String,
    },
    /// Approve the gated step for an issue
    Approve {
        issue: String,
        approver: String,
    },
    /// Deny the gated step for an issue
    Deny {
        issue: String,
        approver: String,
    },
    /// Pause a running workflow
    Pause {
        issue: String,
        #[arg(long, default_value = "Operator requested")]
        reason: String,
    },
    /// Resume a paused workflow
    Resume {
        issue: String,
    },
    /// Rewind the workflow to the step run by the given agent
    Reset {
        issue: String,
        agent: String,
    },
    /// Show (or reset) the retry fuse for an issue
    Fuse {
        issue: String,
        #[arg(long)]
        reset: bool,
    },
}

/// Launch refusal stub: operator commands never spawn agents.
struct NullRuntime;

#[async_trait]
impl AgentRuntime for NullRuntime {
    async fn launch_agent(
        &self,
        _issue_number: &str,
        _agent_type: &str,
        _trigger_source: &str,
    ) -> crate::error::Result<Option<AgentLaunch>> {
        Ok(None)
    }
}

async fn build_engine(config: &NexusConfig) -> Result<Arc<WorkflowEngine>> {
    let store = Arc::new(FileStore::new(config.storage_root.clone()).await?);
    let bus = Arc::new(EventBus::new());
    Ok(Arc::new(WorkflowEngine::new(store, bus, config.clone())))
}

pub async fn execute_command(command: Commands, config_path: Option<PathBuf>) -> Result<()> {
    let config = NexusConfig::load(config_path.as_deref())?;

    match command {
        Commands::Validate { path } => {
            let definition = load_definition(&path)
                .with_context(|| format!("Definition {path:?} is invalid"))?;
            println!(
                "OK: {} ({}) with {} step(s)",
                definition.name,
                definition.workflow_type,
                definition.steps.len()
            );
        }
        Commands::Status { issue } => {
            let engine = build_engine(&config).await?;
            match engine.get_workflow_status(&issue).await? {
                Some(status) => {
                    println!("workflow:  {}", status.workflow_id);
                    println!("state:     {}", status.state.as_str());
                    println!("step:      {}/{}", status.current_step, status.total_steps);
                    println!("step name: {}", status.current_step_name);
                    println!("agent:     {}", status.current_agent);
                    println!("updated:   {}", status.updated_at.to_rfc3339());
                }
                None => println!("No workflow mapped to issue #{issue}"),
            }
        }
        Commands::Approve { issue, approver } => {
            let engine = build_engine(&config).await?;
            if engine.approve_step(&issue, &approver).await? {
                println!("Approved: issue #{issue} resumed");
            } else {
                println!("No approval pending for issue #{issue} (or {approver} not authorized)");
            }
        }
        Commands::Deny { issue, approver } => {
            let engine = build_engine(&config).await?;
            if engine.deny_step(&issue, &approver).await? {
                println!("Denied: workflow for issue #{issue} failed");
            } else {
                println!("No approval pending for issue #{issue}");
            }
        }
        Commands::Pause { issue, reason } => {
            let engine = build_engine(&config).await?;
            if engine.pause_workflow(&issue, &reason).await? {
                println!("Paused workflow for issue #{issue}");
            } else {
                println!("Workflow for issue #{issue} is not running");
            }
        }
        Commands::Resume { issue } => {
            let engine = build_engine(&config).await?;
            if engine.resume_workflow(&issue).await? {
                println!("Resumed workflow for issue #{issue}");
            } else {
                println!("Workflow for issue #{issue} is not paused");
            }
        }
        Commands::Reset { issue, agent } => {
            let engine = build_engine(&config).await?;
            if engine.reset_to_agent_for_issue(&issue, &agent).await? {
                println!("Workflow for issue #{issue} reset to agent {agent}");
            } else {
                println!("Could not reset issue #{issue} to agent {agent}");
            }
        }
        Commands::Fuse { issue, reset } => {
            let engine = build_engine(&config).await?;
            let orchestrator = ProcessOrchestrator::new(
                engine.clone(),
                Arc::new(NullRuntime),
                engine.event_bus(),
                &config.storage_root,
                config.monitor.clone(),
            )?;
            if reset {
                if orchestrator.reset_fuse(&issue).await? {
                    println!("Retry fuse reset for issue #{issue}");
                } else {
                    println!("No fuse state for issue #{issue}");
                }
            } else {
                let status = orchestrator.fuse_status(&issue).await;
                if !status.exists {
                    println!("No fuse state for issue #{issue}");
                } else {
                    println!("agent:          {}", status.agent);
                    println!("attempts:       {}", status.attempts);
                    println!("tripped:        {}", status.tripped);
                    println!("hard tripped:   {}", status.hard_tripped);
                    println!("trips (hard window): {}", status.trip_count_in_hard_window);
                    println!(
                        "window remaining:    {:.0}s",
                        status.window_remaining_seconds
                    );
                }
            }
        }
    }

    Ok(())
}
