use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt storage payload: {0}")]
    Corrupt(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Active workflow mapping exists for issue #{0}")]
    ActiveMappingExists(String),

    #[error("Workflow for issue #{0} is paused")]
    WorkflowPaused(String),

    #[error("Handoff payload expired at {0}")]
    Expired(String),

    #[error("Retry fuse tripped for issue #{issue} agent {agent}")]
    PolicyBlocked { issue: String, agent: String },

    #[error("Handoff secret not configured: set {0}")]
    MissingSecret(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// True for failures that callers may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Io(_) | Error::Conflict(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
