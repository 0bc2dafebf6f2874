//! Conversation sessions: the per-project transcript and its persistence.
//!
//! A session is append-only. The only in-place change allowed is resolving tool
//! calls on the tail message, which replaces that message with an updated copy.

mod activity;
mod message;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

pub use activity::{ActivityEntry, ActivityKind, activity, reasoning_spans, strip_markers};
pub use message::{Message, Role, ToolCall, ToolCallState, ToolStatus, tool_call_marker};

use crate::core::agent::AgentMode;
use crate::core::kv::{self, KvError, KvStore};
use crate::core::todo::{TodoEvent, TodoLog};

/// Generate a new message ID.
#[must_use]
pub fn new_message_id() -> String {
    format!("msg_{}", Ulid::new())
}

/// Generate a new tool call ID.
#[must_use]
pub fn new_tool_call_id() -> String {
    format!("call_{}", Ulid::new())
}

/// Current time in milliseconds since the epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Only the last message may be updated.
    #[error("message {index} is not the tail of a {len}-message session")]
    NotTail { index: usize, len: usize },

    /// No call with this id on the message.
    #[error("tool call not found: {0}")]
    ToolCallNotFound(String),

    /// Status change would regress or skip a state.
    #[error("tool call {id}: cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: ToolStatus,
        to: ToolStatus,
    },
}

/// Model settings for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(default)]
pub struct ModelConfig {
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Maximum tokens per model response.
    pub max_tokens: u32,
    /// Overrides the mode prompt when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Which built-in prompt to use.
    pub mode: AgentMode,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 8192,
            system_prompt: None,
            mode: AgentMode::default(),
        }
    }
}

impl ModelConfig {
    /// System prompt for the next model call.
    #[must_use]
    pub fn effective_system_prompt(&self) -> &str {
        self.system_prompt
            .as_deref()
            .unwrap_or_else(|| self.mode.prompt())
    }
}

/// A project's conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    project_id: String,
    #[serde(default)]
    model: ModelConfig,
    #[serde(default)]
    messages: Vec<Message>,
}

impl Session {
    /// Create an empty session.
    #[must_use]
    pub fn new(project_id: impl Into<String>, model: ModelConfig) -> Self {
        Self {
            project_id: project_id.into(),
            model,
            messages: Vec::new(),
        }
    }

    /// Project this session belongs to.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Model settings.
    #[must_use]
    pub const fn model(&self) -> &ModelConfig {
        &self.model
    }

    /// Replace the model settings.
    pub fn set_model(&mut self, model: ModelConfig) {
        self.model = model;
    }

    /// Messages in conversation order.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Index of the last message.
    #[must_use]
    pub fn last_index(&self) -> Option<usize> {
        self.messages.len().checked_sub(1)
    }

    /// Whether the transcript is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a user message, returning its index.
    pub fn append_user_message(&mut self, text: impl Into<String>) -> usize {
        self.push(Message::user(text))
    }

    /// Append an assistant message, returning its index.
    pub fn append_assistant_message(
        &mut self,
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> usize {
        self.push(Message::assistant(content, tool_calls))
    }

    fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    /// Move a tool call on the tail message to `status`.
    ///
    /// The tail message is replaced by an updated copy; earlier messages are never
    /// touched.
    pub fn update_tool_call_status(
        &mut self,
        message_index: usize,
        tool_call_id: &str,
        status: ToolStatus,
        result: Option<String>,
    ) -> Result<&ToolCall, SessionError> {
        let len = self.messages.len();
        if len == 0 || message_index != len - 1 {
            return Err(SessionError::NotTail {
                index: message_index,
                len,
            });
        }

        let mut updated = self.messages[message_index].clone();
        let position = updated
            .tool_calls
            .iter()
            .position(|c| c.id == tool_call_id)
            .ok_or_else(|| SessionError::ToolCallNotFound(tool_call_id.to_string()))?;
        updated.tool_calls[position].transition(status, result)?;

        self.messages[message_index] = updated;
        Ok(&self.messages[message_index].tool_calls[position])
    }
}

/// Stored shape: either the full session or, from older builds, a bare message list.
#[derive(Deserialize)]
#[serde(untagged)]
enum Stored {
    Session(Session),
    Legacy(Vec<Message>),
}

/// Loads and saves sessions and todo logs through a [`KvStore`].
#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
}

impl SessionStore {
    /// Create a store over `kv`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Underlying KV store.
    #[must_use]
    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }

    /// Write the whole session under `project_<id>`.
    pub async fn persist(&self, session: &Session) -> Result<(), KvError> {
        kv::set_json(self.kv.as_ref(), &kv::session_key(&session.project_id), session).await?;
        tracing::debug!(
            project_id = %session.project_id,
            messages = session.messages.len(),
            "session persisted"
        );
        Ok(())
    }

    /// Load a session. Absent, unreadable or malformed data yields an empty session.
    pub async fn load(&self, project_id: &str) -> Session {
        let key = kv::session_key(project_id);
        let raw = match self.kv.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Session::new(project_id, ModelConfig::default()),
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "session read failed, starting empty");
                return Session::new(project_id, ModelConfig::default());
            }
        };

        match serde_json::from_str::<Stored>(&raw) {
            Ok(Stored::Session(mut session)) => {
                session.project_id = project_id.to_string();
                session
            }
            Ok(Stored::Legacy(messages)) => Session {
                project_id: project_id.to_string(),
                model: ModelConfig::default(),
                messages,
            },
            Err(e) => {
                tracing::warn!(project_id = %project_id, error = %e, "malformed session, starting empty");
                Session::new(project_id, ModelConfig::default())
            }
        }
    }

    /// Remove the session and its todo log.
    pub async fn clear(&self, project_id: &str) -> Result<(), KvError> {
        self.kv.del(&kv::session_key(project_id)).await?;
        self.kv.del(&kv::todos_key(project_id)).await?;
        Ok(())
    }

    /// Write the todo event log under `todos_<id>`.
    pub async fn persist_todos(&self, project_id: &str, log: &TodoLog) -> Result<(), KvError> {
        kv::set_json(self.kv.as_ref(), &kv::todos_key(project_id), log.events()).await
    }

    /// Load the todo event log, rebuilding it from the transcript when missing or unreadable.
    pub async fn load_todos(&self, session: &Session) -> TodoLog {
        let key = kv::todos_key(&session.project_id);
        match kv::get_json::<Vec<TodoEvent>>(self.kv.as_ref(), &key).await {
            Ok(Some(events)) => TodoLog::from_events(events),
            Ok(None) => TodoLog::replay(session.messages()),
            Err(e) => {
                tracing::warn!(project_id = %session.project_id, error = %e, "todo log unreadable, replaying transcript");
                TodoLog::replay(session.messages())
            }
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv::MemoryKv;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryKv::new()))
    }

    fn session_with_call() -> (Session, usize) {
        let mut session = Session::new("p1", ModelConfig::default());
        session.append_user_message("create a button component");
        let idx = session.append_assistant_message(
            "Writing it now.\n[TOOL_CALL:call_1]",
            vec![ToolCall::new(
                "call_1",
                "writeFile",
                serde_json::json!({"path": "src/Button.jsx", "contents": "x"}),
            )],
        );
        (session, idx)
    }

    #[test]
    fn append_returns_indexes() {
        let mut session = Session::new("p1", ModelConfig::default());
        assert_eq!(session.last_index(), None);
        assert_eq!(session.append_user_message("hi"), 0);
        assert_eq!(session.append_assistant_message("hello", Vec::new()), 1);
        assert_eq!(session.last_index(), Some(1));
        assert_eq!(session.messages()[0].role, Role::User);
    }

    #[test]
    fn update_only_touches_tail() {
        let (mut session, idx) = session_with_call();
        session.append_user_message("next");

        assert!(matches!(
            session.update_tool_call_status(idx, "call_1", ToolStatus::Running, None),
            Err(SessionError::NotTail { .. })
        ));
    }

    #[test]
    fn update_replaces_tail_message() {
        let (mut session, idx) = session_with_call();
        let before_id = session.messages()[idx].id.clone();

        session
            .update_tool_call_status(idx, "call_1", ToolStatus::Running, None)
            .unwrap();
        let call = session
            .update_tool_call_status(idx, "call_1", ToolStatus::Success, Some("ok".into()))
            .unwrap();
        assert_eq!(call.status(), ToolStatus::Success);
        assert_eq!(session.messages()[idx].id, before_id);
        assert_eq!(session.messages().len(), 2);
    }

    #[test]
    fn update_unknown_call_fails() {
        let (mut session, idx) = session_with_call();
        assert!(matches!(
            session.update_tool_call_status(idx, "nope", ToolStatus::Running, None),
            Err(SessionError::ToolCallNotFound(_))
        ));
    }

    #[test]
    fn system_prompt_override_wins() {
        let mut model = ModelConfig::default();
        assert_eq!(model.effective_system_prompt(), AgentMode::Execute.prompt());
        model.system_prompt = Some("custom".to_string());
        assert_eq!(model.effective_system_prompt(), "custom");
    }

    #[tokio::test]
    async fn persist_then_load_roundtrips() {
        let store = store();
        let (mut session, idx) = session_with_call();
        session
            .update_tool_call_status(idx, "call_1", ToolStatus::Running, None)
            .unwrap();
        session
            .update_tool_call_status(idx, "call_1", ToolStatus::Error, Some("boom".into()))
            .unwrap();

        store.persist(&session).await.unwrap();
        let loaded = store.load("p1").await;
        assert_eq!(loaded, session);
    }

    #[tokio::test]
    async fn load_absent_is_empty() {
        let loaded = store().load("missing").await;
        assert!(loaded.is_empty());
        assert_eq!(loaded.project_id(), "missing");
    }

    #[tokio::test]
    async fn load_malformed_is_empty() {
        let store = store();
        store.kv().set("project_p1", "{\"messages\": 12").await.unwrap();
        assert!(store.load("p1").await.is_empty());

        store.kv().set("project_p1", "[{\"role\": 5}]").await.unwrap();
        assert!(store.load("p1").await.is_empty());
    }

    #[tokio::test]
    async fn load_accepts_bare_message_array() {
        let store = store();
        let messages = vec![Message::user("hi"), Message::assistant("hello", Vec::new())];
        store
            .kv()
            .set("project_p1", &serde_json::to_string(&messages).unwrap())
            .await
            .unwrap();

        let loaded = store.load("p1").await;
        assert_eq!(loaded.messages(), messages.as_slice());
    }

    #[tokio::test]
    async fn clear_removes_session_and_todos() {
        let store = store();
        let (session, _) = session_with_call();
        store.persist(&session).await.unwrap();
        store.persist_todos("p1", &TodoLog::default()).await.unwrap();

        store.clear("p1").await.unwrap();
        assert!(store.kv().list().await.unwrap().is_empty());
    }
}
