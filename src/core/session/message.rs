//! Transcript messages and the tool calls embedded in them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{SessionError, new_message_id, now_ms};

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A transcript entry.
///
/// Assistant content embeds a `[TOOL_CALL:<id>]` marker for each call it made, in
/// emission order, so renderers can interleave text and calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Message {
    /// Unique message identifier.
    pub id: String,
    /// Author.
    pub role: Role,
    /// Text content with embedded markers.
    pub content: String,
    /// Tool calls requested by this message, in emission order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Creation time (ms since epoch).
    pub created_at: i64,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            id: new_message_id(),
            role,
            content: content.into(),
            tool_calls,
            created_at: now_ms(),
        }
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, Vec::new())
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self::new(Role::Assistant, content, tool_calls)
    }

    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, Vec::new())
    }

    /// Find a tool call by id.
    #[must_use]
    pub fn tool_call(&self, id: &str) -> Option<&ToolCall> {
        self.tool_calls.iter().find(|c| c.id == id)
    }

    /// Whether any embedded call has not reached a terminal state.
    #[must_use]
    pub fn has_unresolved_calls(&self) -> bool {
        self.tool_calls.iter().any(|c| !c.state.is_terminal())
    }
}

/// Marker embedded in assistant content for a tool call.
#[must_use]
pub fn tool_call_marker(id: &str) -> String {
    format!("[TOOL_CALL:{id}]")
}

/// Coarse tool call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Tool call lifecycle.
///
/// Success and error payloads live on distinct variants, so a call can never carry
/// both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolCallState {
    /// Emitted by the model, not started.
    Pending,
    /// Handler is executing.
    Running { started_at: i64 },
    /// Handler returned a result.
    Success {
        output: String,
        started_at: i64,
        finished_at: i64,
    },
    /// Validation or handler failure.
    Error {
        error: String,
        started_at: i64,
        finished_at: i64,
    },
}

impl ToolCallState {
    /// Coarse status.
    #[must_use]
    pub const fn status(&self) -> ToolStatus {
        match self {
            Self::Pending => ToolStatus::Pending,
            Self::Running { .. } => ToolStatus::Running,
            Self::Success { .. } => ToolStatus::Success,
            Self::Error { .. } => ToolStatus::Error,
        }
    }

    /// Whether the call is resolved.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Error { .. })
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ToolCall {
    /// Identifier, unique within the session.
    pub id: String,
    /// Wire name of the tool.
    pub name: String,
    /// Arguments as emitted by the model.
    #[schema(value_type = Object)]
    pub input: Value,
    /// Lifecycle state.
    pub state: ToolCallState,
    /// When the model emitted the call (ms since epoch).
    pub created_at: i64,
}

impl ToolCall {
    /// Create a pending call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            state: ToolCallState::Pending,
            created_at: now_ms(),
        }
    }

    /// Coarse status.
    #[must_use]
    pub const fn status(&self) -> ToolStatus {
        self.state.status()
    }

    /// Result payload: the output on success, the message on error.
    #[must_use]
    pub fn result(&self) -> Option<&str> {
        match &self.state {
            ToolCallState::Success { output, .. } => Some(output),
            ToolCallState::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Move to `status`, storing `result` on terminal transitions.
    ///
    /// Allowed moves are `pending → running`, `pending → error`,
    /// `running → success` and `running → error`. Everything else is rejected and
    /// leaves the call unchanged.
    pub fn transition(
        &mut self,
        status: ToolStatus,
        result: Option<String>,
    ) -> Result<(), SessionError> {
        let now = now_ms();
        let next = match (&self.state, status) {
            (ToolCallState::Pending, ToolStatus::Running) => {
                ToolCallState::Running { started_at: now }
            }
            (ToolCallState::Pending, ToolStatus::Error) => ToolCallState::Error {
                error: result.unwrap_or_default(),
                started_at: now,
                finished_at: now,
            },
            (ToolCallState::Running { started_at }, ToolStatus::Success) => {
                ToolCallState::Success {
                    output: result.unwrap_or_default(),
                    started_at: *started_at,
                    finished_at: now,
                }
            }
            (ToolCallState::Running { started_at }, ToolStatus::Error) => ToolCallState::Error {
                error: result.unwrap_or_default(),
                started_at: *started_at,
                finished_at: now,
            },
            (current, _) => {
                return Err(SessionError::InvalidTransition {
                    id: self.id.clone(),
                    from: current.status(),
                    to: status,
                });
            }
        };
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> ToolCall {
        ToolCall::new("call_1", "writeFile", serde_json::json!({"path": "a.js"}))
    }

    #[test]
    fn happy_path_transitions() {
        let mut c = call();
        c.transition(ToolStatus::Running, None).unwrap();
        c.transition(ToolStatus::Success, Some("ok".to_string()))
            .unwrap();
        assert_eq!(c.status(), ToolStatus::Success);
        assert_eq!(c.result(), Some("ok"));
    }

    #[test]
    fn validation_failure_skips_running() {
        let mut c = call();
        c.transition(ToolStatus::Error, Some("bad args".to_string()))
            .unwrap();
        assert_eq!(c.status(), ToolStatus::Error);
    }

    #[test]
    fn terminal_states_do_not_regress() {
        let mut c = call();
        c.transition(ToolStatus::Running, None).unwrap();
        c.transition(ToolStatus::Error, Some("boom".to_string()))
            .unwrap();

        for status in [
            ToolStatus::Pending,
            ToolStatus::Running,
            ToolStatus::Success,
            ToolStatus::Error,
        ] {
            assert!(c.transition(status, None).is_err());
        }
        assert_eq!(c.result(), Some("boom"));
    }

    #[test]
    fn pending_cannot_jump_to_success() {
        let mut c = call();
        assert!(matches!(
            c.transition(ToolStatus::Success, Some("x".to_string())),
            Err(SessionError::InvalidTransition {
                from: ToolStatus::Pending,
                to: ToolStatus::Success,
                ..
            })
        ));
        assert_eq!(c.status(), ToolStatus::Pending);
    }

    #[test]
    fn running_cannot_restart() {
        let mut c = call();
        c.transition(ToolStatus::Running, None).unwrap();
        assert!(c.transition(ToolStatus::Running, None).is_err());
        assert!(c.transition(ToolStatus::Pending, None).is_err());
    }

    #[test]
    fn state_serializes_with_status_tag() {
        let mut c = call();
        c.transition(ToolStatus::Running, None).unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["state"]["status"], "running");
        assert!(json["state"].get("output").is_none());
    }
}
