//! Provider that replays queued responses instead of calling a model.
//!
//! Used by tests and by `onyx chat --offline`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::agent::error::{AgentError, Result};
use crate::core::agent::provider::{
    CompletionEvent, CompletionRequest, CompletionStream, LlmProvider,
};
use crate::core::agent::types::{ContentBlock, StopReason};
use crate::core::session::new_tool_call_id;

/// A tool call the scripted model will emit.
#[derive(Debug, Clone)]
pub struct ScriptedCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// One scripted model response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedResponse {
    text: String,
    tool_calls: Vec<ScriptedCall>,
    delay: Duration,
    error: Option<String>,
}

impl ScriptedResponse {
    /// A plain text answer.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// A request that fails before streaming anything.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// Add a tool call with a generated id.
    #[must_use]
    pub fn with_tool_call(self, name: impl Into<String>, input: serde_json::Value) -> Self {
        self.with_tool_call_id(new_tool_call_id(), name, input)
    }

    /// Add a tool call with a fixed id.
    #[must_use]
    pub fn with_tool_call_id(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        self.tool_calls.push(ScriptedCall {
            id: id.into(),
            name: name.into(),
            input,
        });
        self
    }

    /// Wait before streaming the response.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Replays [`ScriptedResponse`]s in order and records every request it receives.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    /// Create a provider that will answer with `responses`, in order.
    #[must_use]
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A short build session used by `onyx chat --offline`.
    #[must_use]
    pub fn demo() -> Self {
        Self::new([
            ScriptedResponse::text(
                "<reason>Start with a roadmap, then scaffold the component.</reason>\
                 I'll add a roadmap entry and create the component.",
            )
            .with_tool_call(
                "manage_todo",
                serde_json::json!({"action": "create", "id": "button", "text": "Create Button component"}),
            )
            .with_tool_call(
                "writeFile",
                serde_json::json!({
                    "path": "src/Button.jsx",
                    "contents": "export default function Button({ children }) {\n  return <button className=\"px-4 py-2 rounded bg-black text-white\">{children}</button>;\n}\n"
                }),
            ),
            ScriptedResponse::text("").with_tool_call(
                "manage_todo",
                serde_json::json!({"action": "update", "id": "button", "status": "completed"}),
            ),
            ScriptedResponse::text(
                "Created `src/Button.jsx`. Import it from `src/App.jsx` to use it.",
            ),
        ])
    }

    /// Queue another response.
    pub fn push(&self, response: ScriptedResponse) {
        self.script.lock().push_back(response);
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    /// Number of model calls made so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        self.requests.lock().push(request);
        let response = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedResponse::text("Nothing left to do."));

        if let Some(message) = response.error {
            return Err(AgentError::Api {
                status: 500,
                message,
            });
        }

        let stream = async_stream::stream! {
            if !response.delay.is_zero() {
                tokio::time::sleep(response.delay).await;
            }

            if !response.text.is_empty() {
                yield Ok(CompletionEvent::TextDelta(response.text.clone()));
                yield Ok(CompletionEvent::ContentBlockDone {
                    index: 0,
                    block: ContentBlock::Text { text: response.text.clone() },
                });
            }

            for (i, call) in response.tool_calls.iter().enumerate() {
                yield Ok(CompletionEvent::ToolUseStart {
                    index: i + 1,
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                yield Ok(CompletionEvent::ContentBlockDone {
                    index: i + 1,
                    block: ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    },
                });
            }

            let stop_reason = if response.tool_calls.is_empty() {
                StopReason::EndTurn
            } else {
                StopReason::ToolUse
            };
            yield Ok(CompletionEvent::Done { stop_reason: Some(stop_reason), usage: None });
        };

        Ok(Box::pin(stream))
    }
}
