//! Agent error types.

use crate::core::backend::BackendError;
use crate::core::kv::KvError;
use crate::core::session::SessionError;

/// Agent-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// API key not configured.
    #[error("API key not configured")]
    ApiKeyMissing,

    /// Sandbox could not be booted or reached. Fatal to the current turn.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Tool name is not one of the registered tools.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// Tool arguments failed validation.
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Tool execution failed.
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// Session or todo log could not be written or updated.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Third-party API (KV, workers, GitHub) failed.
    #[error("external API error: {0}")]
    ExternalApi(String),

    /// Transcript update was rejected.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Failed to parse API response.
    #[error("failed to parse response: {0}")]
    Parse(String),

    /// Stream ended unexpectedly.
    #[error("stream ended unexpectedly")]
    StreamEnded,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),
}

impl AgentError {
    /// Whether the error must end the current turn instead of being recorded on a call.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

impl From<BackendError> for AgentError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(reason) => Self::BackendUnavailable(reason),
            other => Self::ToolExecution(other.to_string()),
        }
    }
}

impl From<KvError> for AgentError {
    fn from(e: KvError) -> Self {
        Self::ExternalApi(e.to_string())
    }
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
