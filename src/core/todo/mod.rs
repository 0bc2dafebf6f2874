//! Project roadmap kept as an append-only log of `manage_todo` events.
//!
//! The transcript only references events by tool call id. The materialized list is
//! updated as events are appended, and can be rebuilt from a transcript when the
//! stored log is missing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::session::{Message, ToolStatus};

/// Tool name whose successful calls feed the log.
pub const MANAGE_TODO: &str = "manage_todo";

/// Todo errors.
#[derive(Debug, Error)]
pub enum TodoError {
    /// Update or delete named an id that does not exist.
    #[error("todo {0} not found")]
    UnknownId(String),
}

/// Todo completion state.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum TodoStatus {
    #[default]
    Pending,
    Completed,
}

impl std::fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// A materialized roadmap entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TodoItem {
    pub id: String,
    pub text: String,
    pub status: TodoStatus,
    /// Ms since epoch of the last event that touched this entry.
    pub updated_at: i64,
}

/// A single change to the roadmap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum TodoOp {
    /// Seed an entry, replacing any existing one with the same id.
    Create {
        id: String,
        text: String,
        status: TodoStatus,
    },
    /// Merge the given fields into an existing entry.
    Update {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<TodoStatus>,
    },
    /// Remove an entry.
    Delete { id: String },
}

/// A logged change and the tool call that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoEvent {
    pub tool_call_id: String,
    pub timestamp: i64,
    pub op: TodoOp,
}

/// `manage_todo` action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoAction {
    Create,
    Update,
    Delete,
}

/// Arguments of a `manage_todo` call.
#[derive(Debug, Clone, Deserialize)]
pub struct ManageTodoArgs {
    pub action: TodoAction,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub status: Option<TodoStatus>,
}

impl ManageTodoArgs {
    /// Check the fields each action needs and build the operation.
    ///
    /// A create without an explicit id takes the tool call id, so replaying the same
    /// transcript always yields the same ids.
    pub fn into_op(self, tool_call_id: &str) -> Result<TodoOp, String> {
        let id = self.id.filter(|id| !id.trim().is_empty());
        match self.action {
            TodoAction::Create => {
                let text = self
                    .text
                    .filter(|t| !t.trim().is_empty())
                    .ok_or("create requires non-empty text")?;
                Ok(TodoOp::Create {
                    id: id.unwrap_or_else(|| tool_call_id.to_string()),
                    text,
                    status: self.status.unwrap_or_default(),
                })
            }
            TodoAction::Update => {
                let id = id.ok_or("update requires id")?;
                if self.text.is_none() && self.status.is_none() {
                    return Err("update requires text or status".to_string());
                }
                Ok(TodoOp::Update {
                    id,
                    text: self.text,
                    status: self.status,
                })
            }
            TodoAction::Delete => Ok(TodoOp::Delete {
                id: id.ok_or("delete requires id")?,
            }),
        }
    }
}

/// Append-only todo event log with its materialized list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TodoLog {
    events: Vec<TodoEvent>,
    items: Vec<TodoItem>,
}

impl TodoLog {
    /// Rebuild from stored events.
    #[must_use]
    pub fn from_events(events: Vec<TodoEvent>) -> Self {
        let mut log = Self::default();
        for event in events {
            if let Err(e) = log.append(event) {
                tracing::debug!(error = %e, "skipping stale todo event");
            }
        }
        log
    }

    /// Rebuild from successful `manage_todo` calls, ordered by call timestamp.
    ///
    /// Updates and deletes naming unknown ids are ignored.
    #[must_use]
    pub fn replay(messages: &[Message]) -> Self {
        let mut events: Vec<TodoEvent> = messages
            .iter()
            .flat_map(|m| &m.tool_calls)
            .filter(|c| c.name == MANAGE_TODO && c.status() == ToolStatus::Success)
            .filter_map(|c| {
                let args: ManageTodoArgs = serde_json::from_value(c.input.clone()).ok()?;
                let op = args.into_op(&c.id).ok()?;
                Some(TodoEvent {
                    tool_call_id: c.id.clone(),
                    timestamp: c.created_at,
                    op,
                })
            })
            .collect();
        events.sort_by_key(|e| e.timestamp);
        Self::from_events(events)
    }

    /// Apply and record an event.
    ///
    /// Events naming unknown ids are rejected and not recorded.
    pub fn append(&mut self, event: TodoEvent) -> Result<(), TodoError> {
        match &event.op {
            TodoOp::Create { id, text, status } => {
                let item = TodoItem {
                    id: id.clone(),
                    text: text.clone(),
                    status: *status,
                    updated_at: event.timestamp,
                };
                match self.items.iter_mut().find(|t| t.id == *id) {
                    Some(existing) => *existing = item,
                    None => self.items.push(item),
                }
            }
            TodoOp::Update { id, text, status } => {
                let item = self
                    .items
                    .iter_mut()
                    .find(|t| t.id == *id)
                    .ok_or_else(|| TodoError::UnknownId(id.clone()))?;
                if let Some(text) = text {
                    item.text.clone_from(text);
                }
                if let Some(status) = status {
                    item.status = *status;
                }
                item.updated_at = event.timestamp;
            }
            TodoOp::Delete { id } => {
                let idx = self
                    .items
                    .iter()
                    .position(|t| t.id == *id)
                    .ok_or_else(|| TodoError::UnknownId(id.clone()))?;
                self.items.remove(idx);
            }
        }
        self.events.push(event);
        Ok(())
    }

    /// Recorded events in append order.
    #[must_use]
    pub fn events(&self) -> &[TodoEvent] {
        &self.events
    }

    /// Current entries in creation order.
    #[must_use]
    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    /// Plain-text listing, as handed back to the model.
    #[must_use]
    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return "No todos.".to_string();
        }
        let lines: Vec<String> = self
            .items
            .iter()
            .map(|t| {
                let mark = if t.status == TodoStatus::Completed {
                    "x"
                } else {
                    " "
                };
                format!("- [{mark}] {} ({})", t.text, t.id)
            })
            .collect();
        format!("Todos:\n{}", lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::ToolCall;

    fn event(call: &str, ts: i64, op: TodoOp) -> TodoEvent {
        TodoEvent {
            tool_call_id: call.to_string(),
            timestamp: ts,
            op,
        }
    }

    fn create(id: &str, text: &str) -> TodoOp {
        TodoOp::Create {
            id: id.to_string(),
            text: text.to_string(),
            status: TodoStatus::Pending,
        }
    }

    fn todo_call(id: &str, ts: i64, input: serde_json::Value, ok: bool) -> ToolCall {
        let mut call = ToolCall::new(id, MANAGE_TODO, input);
        call.created_at = ts;
        call.transition(ToolStatus::Running, None).unwrap();
        let status = if ok {
            ToolStatus::Success
        } else {
            ToolStatus::Error
        };
        call.transition(status, Some(String::new())).unwrap();
        call
    }

    #[test]
    fn create_update_delete() {
        let mut log = TodoLog::default();
        log.append(event("c1", 1, create("t1", "Scaffold app")))
            .unwrap();
        log.append(event(
            "c2",
            2,
            TodoOp::Update {
                id: "t1".to_string(),
                text: None,
                status: Some(TodoStatus::Completed),
            },
        ))
        .unwrap();
        assert_eq!(log.items()[0].status, TodoStatus::Completed);
        assert_eq!(log.items()[0].text, "Scaffold app");
        assert_eq!(log.items()[0].updated_at, 2);

        log.append(event(
            "c3",
            3,
            TodoOp::Delete {
                id: "t1".to_string(),
            },
        ))
        .unwrap();
        assert!(log.items().is_empty());
        assert_eq!(log.events().len(), 3);
    }

    #[test]
    fn live_update_of_unknown_id_is_rejected() {
        let mut log = TodoLog::default();
        let result = log.append(event(
            "c1",
            1,
            TodoOp::Delete {
                id: "ghost".to_string(),
            },
        ));
        assert!(matches!(result, Err(TodoError::UnknownId(_))));
        assert!(log.events().is_empty());
    }

    #[test]
    fn delete_wins_until_recreated() {
        let mut log = TodoLog::default();
        log.append(event("c1", 1, create("t1", "A"))).unwrap();
        log.append(event(
            "c2",
            2,
            TodoOp::Delete {
                id: "t1".to_string(),
            },
        ))
        .unwrap();
        assert!(
            log.append(event(
                "c3",
                3,
                TodoOp::Update {
                    id: "t1".to_string(),
                    text: Some("B".to_string()),
                    status: None,
                },
            ))
            .is_err()
        );
        log.append(event("c4", 4, create("t1", "C"))).unwrap();
        assert_eq!(log.items().len(), 1);
        assert_eq!(log.items()[0].text, "C");
    }

    #[test]
    fn replay_orders_by_timestamp_and_skips_failures() {
        let messages = vec![
            Message::assistant(
                "",
                vec![
                    todo_call(
                        "c2",
                        20,
                        serde_json::json!({"action": "update", "id": "t1", "status": "completed"}),
                        true,
                    ),
                    todo_call(
                        "c3",
                        30,
                        serde_json::json!({"action": "create", "id": "t2", "text": "Failed"}),
                        false,
                    ),
                ],
            ),
            Message::assistant(
                "",
                vec![todo_call(
                    "c1",
                    10,
                    serde_json::json!({"action": "create", "id": "t1", "text": "Build UI"}),
                    true,
                )],
            ),
        ];

        let log = TodoLog::replay(&messages);
        assert_eq!(log.items().len(), 1);
        assert_eq!(log.items()[0].id, "t1");
        assert_eq!(log.items()[0].status, TodoStatus::Completed);
        let order: Vec<_> = log.events().iter().map(|e| e.tool_call_id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c2"]);
    }

    #[test]
    fn replay_ignores_unknown_ids() {
        let messages = vec![Message::assistant(
            "",
            vec![todo_call(
                "c1",
                1,
                serde_json::json!({"action": "delete", "id": "nope"}),
                true,
            )],
        )];
        assert!(TodoLog::replay(&messages).items().is_empty());
    }

    #[test]
    fn create_defaults_id_to_call_id() {
        let args: ManageTodoArgs =
            serde_json::from_value(serde_json::json!({"action": "create", "text": "Ship"}))
                .unwrap();
        assert_eq!(
            args.into_op("call_9").unwrap(),
            TodoOp::Create {
                id: "call_9".to_string(),
                text: "Ship".to_string(),
                status: TodoStatus::Pending,
            }
        );
    }

    #[test]
    fn args_validation() {
        let parse = |v: serde_json::Value| -> ManageTodoArgs { serde_json::from_value(v).unwrap() };
        assert!(parse(serde_json::json!({"action": "create"})).into_op("c").is_err());
        assert!(parse(serde_json::json!({"action": "update", "id": "t"})).into_op("c").is_err());
        assert!(parse(serde_json::json!({"action": "delete"})).into_op("c").is_err());
    }

    #[test]
    fn events_roundtrip_through_json() {
        let mut log = TodoLog::default();
        log.append(event("c1", 1, create("t1", "A"))).unwrap();
        let json = serde_json::to_string(log.events()).unwrap();
        let restored = TodoLog::from_events(serde_json::from_str(&json).unwrap());
        assert_eq!(restored, log);
    }
}
