//! Error types for the core module.

use crate::core::agent::AgentError;
use crate::core::backend::BackendError;
use crate::core::github::GitHubError;
use crate::core::kv::KvError;

/// Core error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No project with this id in the index.
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// A turn is already running for this project.
    #[error("a turn is already running for project {0}")]
    TurnInProgress(String),

    /// The agent loop failed.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// The execution backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// GitHub deployment failed.
    #[error(transparent)]
    GitHub(#[from] GitHubError),

    /// Storage failed.
    #[error("storage error: {0}")]
    Kv(#[from] KvError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
