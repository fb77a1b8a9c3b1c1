use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Workload submission failed: {0}")]
    Submission(String),

    #[error("Workload already exists: {0}")]
    WorkloadConflict(String),

    #[error("timeout")]
    Timeout,

    #[error("Store unavailable: {0}")]
    TransientStore(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Cluster query failed: {0}")]
    Cluster(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Errors that are absorbed locally (logged and retried) rather than
    /// turned into a FAILED job status.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::TransientStore(_)
                | OrchestratorError::Cluster(_)
                | OrchestratorError::MalformedMessage(_)
        )
    }
}

impl From<rusqlite::Error> for OrchestratorError {
    fn from(e: rusqlite::Error) -> Self {
        OrchestratorError::TransientStore(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
