//! DevContainer builds: admission queue, build contexts and the executor.

pub mod executor;
pub mod queue;
pub mod workspace;

pub use executor::{BuildContext, BuildExecutor, DevcontainerCliExecutor};
pub use queue::{BuildQueue, BuildSlot, CancelOutcome, QueuedBuild, WaitingBuild};
pub use workspace::{BuildSource, BuildWorkspace};

use crate::retry::Retryable;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("build queue is full ({0} builds waiting)")]
    QueueFull(usize),

    #[error("a build for instance {0} is already queued")]
    AlreadyQueued(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("build timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{program} exited with code {code}: {message}")]
    ToolFailed {
        program: String,
        code: i32,
        message: String,
    },

    #[error("failed to push {image}: {message}")]
    PushFailed { image: String, message: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid build context: {0}")]
    Context(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Retryable for BuildError {
    /// Builds are never retried automatically; a failed build fails the instance.
    fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;

    #[test]
    fn test_build_errors_map_to_orchestrator_errors() {
        assert!(!BuildError::QueueFull(64).is_retryable());
        assert!(matches!(
            OrchestratorError::from(BuildError::Cancelled),
            OrchestratorError::Cancelled(_)
        ));
        assert!(matches!(
            OrchestratorError::from(BuildError::Timeout(Duration::from_secs(1800))),
            OrchestratorError::Timeout(_)
        ));

        let push = OrchestratorError::from(BuildError::PushFailed {
            image: "localhost:32000/vscode-devcontainer-a-1:latest".to_string(),
            message: "connection refused".to_string(),
        });
        assert!(matches!(push, OrchestratorError::BuildFailed(_)));
        assert!(push.to_string().contains("failed to push"));
    }
}
