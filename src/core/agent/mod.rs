//! The agent loop: model calls, tool dispatch, and turn bookkeeping.

mod error;
mod events;
mod prompts;
mod provider;
pub mod providers;
mod tools;
mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

pub use error::{AgentError, Result};
pub use events::{EventSink, LoopEvent, LoopState};
pub use prompts::AgentMode;
pub use provider::{CompletionEvent, CompletionRequest, CompletionStream, LlmProvider};
pub use providers::{OpenAiProvider, ScriptedCall, ScriptedProvider, ScriptedResponse};
pub use tools::{
    CANCELLED, KvOp, ToolContext, ToolName, ToolRegistry, ToolRequest, WorkerOp, definitions,
    prepare,
};
pub use types::{Content, ContentBlock, Message, Role, StopReason, Tool, Usage};

use crate::core::session::{
    self, Message as SessionMessage, Role as SessionRole, Session, SessionStore, ToolCall,
    ToolCallState, ToolStatus, new_tool_call_id, tool_call_marker,
};
use crate::core::todo::TodoLog;

/// Default bound on model calls per turn.
pub const DEFAULT_MAX_ROUNDS: usize = 25;

/// Why a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TurnStop {
    /// The model answered without requesting tools.
    Completed,
    /// The caller cancelled the turn.
    Cancelled,
    /// The round limit was reached while the model still wanted tools.
    RoundLimit,
}

/// Summary of a finished turn.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
pub struct TurnOutcome {
    pub stop: TurnStop,
    /// Model calls made.
    pub rounds: usize,
    /// Text of the last assistant message, markers removed.
    pub text: String,
}

/// Model response for one round.
struct Response {
    text: String,
    calls: Vec<(String, String, serde_json::Value)>,
}

/// Drives turns for a session.
///
/// Cheap to clone; clones share the provider, tools and store.
#[derive(Clone)]
pub struct AgentLoop {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    store: SessionStore,
    max_rounds: usize,
    events: EventSink,
}

impl AgentLoop {
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>, tools: Arc<ToolRegistry>, store: SessionStore) -> Self {
        Self {
            provider,
            tools,
            store,
            max_rounds: DEFAULT_MAX_ROUNDS,
            events: EventSink::disabled(),
        }
    }

    #[must_use]
    pub const fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    /// Publish loop events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    #[must_use]
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    #[must_use]
    pub const fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Run one user turn to completion, cancellation, or the round limit.
    ///
    /// The session and todo log are persisted whatever the outcome; a failed persist
    /// is logged and does not fail the turn.
    ///
    /// # Errors
    ///
    /// Returns the model endpoint's error or [`AgentError::BackendUnavailable`]. The
    /// session stays usable for the next turn.
    pub async fn run_turn(
        &self,
        session: &mut Session,
        todos: &mut TodoLog,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let result = self.drive(session, todos, text, cancel).await;

        match &result {
            Ok(outcome) => tracing::info!(
                project_id = %session.project_id(),
                stop = ?outcome.stop,
                rounds = outcome.rounds,
                "turn finished"
            ),
            Err(e) => {
                tracing::warn!(project_id = %session.project_id(), error = %e, "turn failed");
                self.events.log(format!("error: {e}"));
            }
        }

        self.persist(session, todos).await;
        if !matches!(result, Ok(TurnOutcome { stop: TurnStop::Cancelled, .. })) {
            self.events.state(LoopState::Idle);
        }
        result
    }

    async fn drive(
        &self,
        session: &mut Session,
        todos: &mut TodoLog,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let index = session.append_user_message(text);
        self.appended(session, index);

        let mut rounds = 0;
        let mut last_text = String::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(rounds, last_text));
            }
            if rounds >= self.max_rounds {
                self.events
                    .log(format!("stopping after {rounds} model calls"));
                return Ok(TurnOutcome {
                    stop: TurnStop::RoundLimit,
                    rounds,
                    text: last_text,
                });
            }
            rounds += 1;

            self.events.state(LoopState::AwaitingModel);
            let request = self.request(session, todos);
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                response = self.complete(request) => Some(response),
            };
            let Some(response) = response else {
                return Ok(self.cancelled(rounds, last_text));
            };
            let response = response?;

            let calls: Vec<ToolCall> = response
                .calls
                .into_iter()
                .map(|(id, name, input)| {
                    let id = if id.is_empty() { new_tool_call_id() } else { id };
                    ToolCall::new(id, name, input)
                })
                .collect();
            let mut content = response.text.clone();
            for call in &calls {
                content.push_str(&tool_call_marker(&call.id));
            }
            let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();

            let index = session.append_assistant_message(content, calls);
            self.appended(session, index);
            last_text = session::strip_markers(&response.text);

            if ids.is_empty() {
                return Ok(TurnOutcome {
                    stop: TurnStop::Completed,
                    rounds,
                    text: last_text,
                });
            }

            self.events.state(LoopState::ToolCallsPending);
            self.events.state(LoopState::ExecutingTools);
            let mut ctx = ToolContext {
                todos: &mut *todos,
                cancel,
                events: &self.events,
            };
            for (position, id) in ids.iter().enumerate() {
                if let Err(e) = self.tools.dispatch(session, index, id, &mut ctx).await {
                    self.skip_remaining(session, index, &ids[position + 1..], &e);
                    return Err(e);
                }
            }

            if cancel.is_cancelled() {
                return Ok(self.cancelled(rounds, last_text));
            }
        }
    }

    fn cancelled(&self, rounds: usize, text: String) -> TurnOutcome {
        self.events.state(LoopState::Cancelled);
        TurnOutcome {
            stop: TurnStop::Cancelled,
            rounds,
            text,
        }
    }

    fn appended(&self, session: &Session, index: usize) {
        if let Some(message) = session.messages().get(index) {
            self.events.emit(LoopEvent::MessageAppended {
                index,
                message: message.clone(),
            });
        }
    }

    /// Resolve calls that will not run because the turn is aborting.
    fn skip_remaining(&self, session: &mut Session, index: usize, ids: &[String], cause: &AgentError) {
        for id in ids {
            match session.update_tool_call_status(
                index,
                id,
                ToolStatus::Error,
                Some(format!("skipped: {cause}")),
            ) {
                Ok(call) => self.events.emit(LoopEvent::ToolCallUpdated {
                    message_index: index,
                    call: call.clone(),
                }),
                Err(e) => tracing::warn!(call_id = %id, error = %e, "could not resolve skipped call"),
            }
        }
    }

    fn request(&self, session: &Session, todos: &TodoLog) -> CompletionRequest {
        let model = session.model();
        let mut system = model.effective_system_prompt().to_string();
        if !todos.items().is_empty() {
            system.push_str("\n\nCurrent project roadmap:\n");
            system.push_str(&todos.render());
        }

        CompletionRequest {
            model: model.model.clone(),
            max_tokens: model.max_tokens,
            temperature: Some(model.temperature),
            messages: to_provider_messages(session.messages()),
            system: Some(system),
            tools: Some(self.tools.definitions()),
        }
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Response> {
        let mut stream = self.provider.stream(request).await?;

        let mut text = String::new();
        let mut calls: BTreeMap<usize, (String, String, serde_json::Value)> = BTreeMap::new();
        let mut partial: BTreeMap<usize, String> = BTreeMap::new();

        while let Some(event) = stream.next().await {
            match event? {
                CompletionEvent::TextDelta(delta) => {
                    text.push_str(&delta);
                    self.events.emit(LoopEvent::TextDelta { text: delta });
                }
                CompletionEvent::ToolUseStart { index, id, name } => {
                    calls.insert(index, (id, name, serde_json::Value::Null));
                }
                CompletionEvent::ToolInputDelta {
                    index,
                    partial_json,
                } => partial.entry(index).or_default().push_str(&partial_json),
                CompletionEvent::ContentBlockDone {
                    index,
                    block: ContentBlock::ToolUse { id, name, input },
                } => {
                    partial.remove(&index);
                    calls.insert(index, (id, name, input));
                }
                CompletionEvent::ContentBlockDone { .. } => {}
                CompletionEvent::Done { usage, .. } => {
                    if let Some(usage) = usage {
                        tracing::debug!(
                            input_tokens = usage.input_tokens,
                            output_tokens = usage.output_tokens,
                            "model usage"
                        );
                    }
                }
                CompletionEvent::Error(message) => {
                    return Err(AgentError::Api { status: 0, message });
                }
            }
        }

        // Calls that never got a finished block keep whatever input streamed in
        for (index, json) in partial {
            if let Some(call) = calls.get_mut(&index) {
                call.2 = serde_json::from_str(&json).unwrap_or(serde_json::Value::Null);
            }
        }

        Ok(Response {
            text,
            calls: calls.into_values().collect(),
        })
    }

    async fn persist(&self, session: &Session, todos: &TodoLog) {
        if let Err(e) = self.store.persist(session).await {
            tracing::warn!(project_id = %session.project_id(), error = %e, "session persist failed");
            self.events.log(format!("warning: could not save session: {e}"));
        }
        if let Err(e) = self.store.persist_todos(session.project_id(), todos).await {
            tracing::warn!(project_id = %session.project_id(), error = %e, "todo persist failed");
        }
    }
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("provider", &self.provider.name())
            .field("max_rounds", &self.max_rounds)
            .finish_non_exhaustive()
    }
}

/// Convert the transcript into the provider's message shape.
///
/// Every tool call is answered with a result block; calls that never resolved (an
/// interrupted process) are reported to the model as not executed.
#[must_use]
pub fn to_provider_messages(messages: &[SessionMessage]) -> Vec<Message> {
    let mut out = Vec::new();
    for message in messages {
        match message.role {
            SessionRole::System => {}
            SessionRole::User => out.push(Message::user(message.content.clone())),
            SessionRole::Assistant => {
                let text = session::strip_markers(&message.content);
                let mut blocks = Vec::new();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                blocks.extend(message.tool_calls.iter().map(|c| ContentBlock::ToolUse {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    input: c.input.clone(),
                }));
                if blocks.is_empty() {
                    continue;
                }
                out.push(Message {
                    role: Role::Assistant,
                    content: Content::Blocks(blocks),
                });

                if !message.tool_calls.is_empty() {
                    let results = message
                        .tool_calls
                        .iter()
                        .map(|c| {
                            let (content, is_error) = match &c.state {
                                ToolCallState::Success { output, .. } => (output.clone(), false),
                                ToolCallState::Error { error, .. } => (error.clone(), true),
                                ToolCallState::Pending | ToolCallState::Running { .. } => {
                                    ("not executed".to_string(), true)
                                }
                            };
                            ContentBlock::ToolResult {
                                tool_use_id: c.id.clone(),
                                content,
                                is_error: is_error.then_some(true),
                            }
                        })
                        .collect();
                    out.push(Message {
                        role: Role::User,
                        content: Content::Blocks(results),
                    });
                }
            }
        }
    }
    out
}
