use crate::build::BuildError;
use crate::cluster::ClusterError;
use crate::instance::InstanceState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition for instance {instance_id}: {from} -> {to}")]
    InvalidTransition {
        instance_id: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Cluster resource error: {0}")]
    Resource(ClusterError),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ClusterError> for OrchestratorError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Transient(msg) => OrchestratorError::Transient(msg),
            ClusterError::Timeout(msg) => OrchestratorError::Timeout(msg),
            other => OrchestratorError::Resource(other),
        }
    }
}

impl From<BuildError> for OrchestratorError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Cancelled => OrchestratorError::Cancelled("build cancelled".to_string()),
            BuildError::Timeout(limit) => {
                OrchestratorError::Timeout(format!("build exceeded {}s", limit.as_secs()))
            }
            other => OrchestratorError::BuildFailed(other.to_string()),
        }
    }
}

impl OrchestratorError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Transient(_) | OrchestratorError::Timeout(_)
        )
    }
}
