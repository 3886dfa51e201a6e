//! Kernel configuration.
//!
//! Loaded once at startup from an optional TOML file with environment
//! overrides; every component receives the values it needs by constructor
//! injection. The handoff signing secret itself is never stored here —
//! only the name of the environment variable that carries it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const HANDOFF_SECRET_ENV: &str = "NEXUS_HANDOFF_SECRET";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryFuseConfig {
    /// Attempts allowed within the soft window before the fuse trips.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub soft_window: Duration,
    /// A second trip within this window hard-stops retries until manual
    /// reset.
    #[serde(with = "humantime_serde")]
    pub hard_window: Duration,
}

impl Default for RetryFuseConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            soft_window: Duration::from_secs(600),
            hard_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Default stuck-agent threshold when neither step nor agent override
    /// one.
    #[serde(with = "humantime_serde")]
    pub agent_timeout: Duration,
    /// Grace window between the polite signal and force kill.
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,
    pub fuse: RetryFuseConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            agent_timeout: Duration::from_secs(3600),
            kill_grace: Duration::from_secs(5),
            fuse: RetryFuseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NexusConfig {
    /// Root of the filesystem storage tree.
    pub storage_root: PathBuf,
    /// Directory holding `<workflow_type>.yaml` definition files.
    pub definitions_dir: PathBuf,
    /// Base delay used when a step declares no `initial_delay_seconds`.
    pub default_backoff_base_seconds: f64,
    /// Environment variable carrying the handoff signing secret.
    pub handoff_secret_env: String,
    pub monitor: MonitorConfig,
}

impl Default for NexusConfig {
    fn default() -> Self {
        let base = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nexus");
        Self {
            storage_root: base.join("storage"),
            definitions_dir: base.join("workflows"),
            default_backoff_base_seconds: 5.0,
            handoff_secret_env: HANDOFF_SECRET_ENV.to_string(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl NexusConfig {
    /// Load from a TOML file, falling back to defaults when the file is
    /// absent. `NEXUS_STORAGE_ROOT` and `NEXUS_DEFINITIONS_DIR` override
    /// the file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("invalid config file {p:?}: {e}")))?
            }
            _ => Self::default(),
        };

        if let Ok(root) = std::env::var("NEXUS_STORAGE_ROOT") {
            if !root.trim().is_empty() {
                config.storage_root = PathBuf::from(root);
            }
        }
        if let Ok(dir) = std::env::var("NEXUS_DEFINITIONS_DIR") {
            if !dir.trim().is_empty() {
                config.definitions_dir = PathBuf::from(dir);
            }
        }

        Ok(config)
    }

    /// Path of the definition file for a normalized workflow type.
    pub fn definition_path(&self, workflow_type: &str) -> PathBuf {
        self.definitions_dir.join(format!("{workflow_type}.yaml"))
    }
}
