//! `OpenAI` provider implementation.
//!
//! Provides streaming completions via the `OpenAI` Chat Completions API and any
//! compatible endpoint (Ollama, LM Studio, `OpenRouter`).

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::core::agent::error::{AgentError, Result};
use crate::core::agent::provider::{
    CompletionEvent, CompletionRequest, CompletionStream, LlmProvider,
};
use crate::core::agent::types::{Content, ContentBlock, Message, Role, StopReason, Tool, Usage};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// LLM provider for the `OpenAI` API and compatible endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiProvider {
    /// Create a new provider instance.
    ///
    /// # Errors
    ///
    /// Returns error if API key is empty.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(AgentError::ApiKeyMissing);
        }

        Ok(Self {
            http: reqwest::Client::new(),
            api_key: Some(api_key),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Create a provider with optional API key and base URL.
    ///
    /// Use this for OpenAI-compatible providers that may not require an API key
    /// (e.g., local Ollama) or use a different endpoint.
    #[must_use]
    pub fn with_config(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.filter(|k| !k.is_empty()),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

// Request types

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCallRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OpenAiMessage {
    const fn text(role: &'static str, content: String) -> Self {
        Self {
            role,
            content: Some(content),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallRequest {
    id: String,
    #[serde(rename = "type")]
    call_type: &'static str,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types for SSE parsing

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

const fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Convert our messages to the format expected by the chat completions API.
fn convert_messages(messages: &[Message], system: Option<&str>) -> Vec<OpenAiMessage> {
    let mut result = Vec::new();

    if let Some(sys) = system {
        result.push(OpenAiMessage::text("system", sys.to_string()));
    }

    for msg in messages {
        match &msg.content {
            Content::Text(text) => {
                result.push(OpenAiMessage::text(role_name(msg.role), text.clone()));
            }
            Content::Blocks(blocks) => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                let mut tool_results = Vec::new();

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            text_parts.push(text.clone());
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(OpenAiToolCallRequest {
                                id: id.clone(),
                                call_type: "function",
                                function: OpenAiFunctionCall {
                                    name: name.clone(),
                                    arguments: serde_json::to_string(input).unwrap_or_default(),
                                },
                            });
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            tool_results.push((tool_use_id.clone(), content.clone()));
                        }
                    }
                }

                if !tool_calls.is_empty() {
                    let content = if text_parts.is_empty() {
                        None
                    } else {
                        Some(text_parts.join(""))
                    };
                    result.push(OpenAiMessage {
                        role: "assistant",
                        content,
                        tool_calls: Some(tool_calls),
                        tool_call_id: None,
                    });
                } else if !text_parts.is_empty() {
                    result.push(OpenAiMessage::text(role_name(msg.role), text_parts.join("")));
                }

                for (tool_use_id, content) in tool_results {
                    result.push(OpenAiMessage {
                        role: "tool",
                        content: Some(content),
                        tool_calls: None,
                        tool_call_id: Some(tool_use_id),
                    });
                }
            }
        }
    }

    result
}

/// Convert our tools to the function calling format.
fn convert_tools(tools: &[Tool]) -> Vec<OpenAiTool> {
    tools
        .iter()
        .map(|t| OpenAiTool {
            tool_type: "function",
            function: OpenAiFunction {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

/// Parse a single SSE event from the buffer.
///
/// Returns the parsed chunk (if any) and the remaining buffer content.
fn parse_sse_event(buffer: &str) -> Option<(Option<OpenAiChunk>, String)> {
    let end = buffer.find("\n\n")?;
    let event_str = &buffer[..end];
    let remainder = buffer[end + 2..].to_string();

    let mut data = None;
    for line in event_str.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data = Some(rest.trim_start().to_string());
        }
    }

    let Some(data) = data else {
        return Some((None, remainder));
    };

    if data.trim() == "[DONE]" {
        return Some((None, remainder));
    }

    match serde_json::from_str::<OpenAiChunk>(&data) {
        Ok(chunk) => Some((Some(chunk), remainder)),
        Err(e) => {
            tracing::debug!(data = %data, error = %e, "failed to parse OpenAI event");
            Some((None, remainder))
        }
    }
}

/// Convert finish reason to our stop reason.
fn convert_stop_reason(reason: &str) -> Option<StopReason> {
    match reason {
        "stop" => Some(StopReason::EndTurn),
        "tool_calls" | "function_call" => Some(StopReason::ToolUse),
        "length" => Some(StopReason::MaxTokens),
        _ => None,
    }
}

/// Completed blocks for the text and every accumulated tool call, in call index order.
fn finished_blocks(
    text: &str,
    tool_calls: &BTreeMap<usize, (String, String, String)>,
) -> Vec<CompletionEvent> {
    let mut events = Vec::new();
    if !text.is_empty() {
        events.push(CompletionEvent::ContentBlockDone {
            index: 0,
            block: ContentBlock::Text {
                text: text.to_string(),
            },
        });
    }
    for (idx, (id, name, args)) in tool_calls {
        let input = if args.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(args).unwrap_or(serde_json::Value::Null)
        };
        events.push(CompletionEvent::ContentBlockDone {
            index: 1 + idx,
            block: ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input,
            },
        });
    }
    events
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(api_key) = &self.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}"))
                    .map_err(|_| AgentError::ApiKeyMissing)?,
            );
        }

        let openai_request = OpenAiRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: convert_messages(&request.messages, request.system.as_deref()),
            tools: request.tools.as_deref().map(convert_tools),
            stream: true,
            stream_options: Some(StreamOptions {
                include_usage: true,
            }),
        };

        let url = format!("{}/chat/completions", self.base_url);
        tracing::debug!(url = %url, model = %openai_request.model, "starting completion");
        let response = self
            .http
            .post(&url)
            .headers(headers)
            .json(&openai_request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AgentError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            // Tool calls being built: index -> (id, name, arguments)
            let mut pending_tool_calls: BTreeMap<usize, (String, String, String)> = BTreeMap::new();
            let mut current_text = String::new();
            let mut stop_reason = None;
            let mut usage = None;
            let mut finished = false;

            futures::pin_mut!(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(AgentError::Http(e));
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some((chunk_opt, remainder)) = parse_sse_event(&buffer) {
                    buffer = remainder;

                    let Some(chunk) = chunk_opt else {
                        continue;
                    };

                    if let Some(u) = chunk.usage {
                        usage = Some(Usage {
                            input_tokens: u.prompt_tokens,
                            output_tokens: u.completion_tokens,
                        });
                    }

                    for choice in chunk.choices {
                        if let Some(text) = choice.delta.content {
                            if !text.is_empty() {
                                current_text.push_str(&text);
                                yield Ok(CompletionEvent::TextDelta(text));
                            }
                        }

                        if let Some(tool_calls) = choice.delta.tool_calls {
                            for tc in tool_calls {
                                let entry = pending_tool_calls.entry(tc.index).or_default();

                                if let Some(id) = tc.id {
                                    entry.0 = id;
                                }

                                if let Some(func) = tc.function {
                                    if let Some(name) = func.name {
                                        entry.1.clone_from(&name);
                                        yield Ok(CompletionEvent::ToolUseStart {
                                            index: 1 + tc.index,
                                            id: entry.0.clone(),
                                            name,
                                        });
                                    }
                                    if let Some(args) = func.arguments {
                                        entry.2.push_str(&args);
                                        yield Ok(CompletionEvent::ToolInputDelta {
                                            index: 1 + tc.index,
                                            partial_json: args,
                                        });
                                    }
                                }
                            }
                        }

                        if let Some(reason) = choice.finish_reason {
                            if !finished {
                                finished = true;
                                for event in finished_blocks(&current_text, &pending_tool_calls) {
                                    yield Ok(event);
                                }
                                stop_reason = convert_stop_reason(&reason);
                            }
                        }
                    }
                }
            }

            if !finished {
                for event in finished_blocks(&current_text, &pending_tool_calls) {
                    yield Ok(event);
                }
                if !pending_tool_calls.is_empty() {
                    stop_reason = Some(StopReason::ToolUse);
                }
            }
            yield Ok(CompletionEvent::Done { stop_reason, usage });
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_requires_api_key() {
        assert!(OpenAiProvider::new("").is_err());
    }

    #[test]
    fn provider_name_is_openai() {
        let provider = OpenAiProvider::new("test-key").unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn with_config_uses_default_base_url() {
        let provider = OpenAiProvider::with_config(Some("key".to_string()), None);
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn with_config_custom_base_url() {
        let provider = OpenAiProvider::with_config(None, Some("http://localhost:11434/v1/".to_string()));
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
        assert!(provider.api_key.is_none());
    }

    #[test]
    fn convert_messages_adds_system() {
        let messages = vec![Message::user("Hello")];
        let openai_messages = convert_messages(&messages, Some("You are Onyx"));
        assert_eq!(openai_messages.len(), 2);
        assert_eq!(openai_messages[0].role, "system");
        assert_eq!(openai_messages[1].role, "user");
    }

    #[test]
    fn convert_messages_splits_tool_results() {
        let messages = vec![
            Message {
                role: Role::Assistant,
                content: Content::Blocks(vec![
                    ContentBlock::Text {
                        text: "On it".to_string(),
                    },
                    ContentBlock::ToolUse {
                        id: "call_1".to_string(),
                        name: "writeFile".to_string(),
                        input: serde_json::json!({"path": "a.js", "contents": ""}),
                    },
                ]),
            },
            Message {
                role: Role::User,
                content: Content::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: "call_1".to_string(),
                    content: "Wrote 0 bytes".to_string(),
                    is_error: None,
                }]),
            },
        ];

        let converted = convert_messages(&messages, None);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "assistant");
        assert_eq!(converted[0].tool_calls.as_ref().map(Vec::len), Some(1));
        assert_eq!(converted[1].role, "tool");
        assert_eq!(converted[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn convert_stop_reason_maps_correctly() {
        assert_eq!(convert_stop_reason("stop"), Some(StopReason::EndTurn));
        assert_eq!(convert_stop_reason("tool_calls"), Some(StopReason::ToolUse));
        assert_eq!(convert_stop_reason("length"), Some(StopReason::MaxTokens));
        assert_eq!(convert_stop_reason("unknown"), None);
    }

    #[test]
    fn parse_sse_event_handles_done() {
        let (chunk, remainder) = parse_sse_event("data: [DONE]\n\n").unwrap();
        assert!(chunk.is_none());
        assert!(remainder.is_empty());
    }

    #[test]
    fn parse_sse_event_waits_for_full_event() {
        assert!(parse_sse_event("data: {\"choices\":[]}").is_none());
    }

    #[test]
    fn finished_blocks_keep_call_order() {
        let mut calls = BTreeMap::new();
        calls.insert(1, ("b".to_string(), "runCommand".to_string(), "{}".to_string()));
        calls.insert(0, ("a".to_string(), "writeFile".to_string(), String::new()));

        let events = finished_blocks("", &calls);
        let ids: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CompletionEvent::ContentBlockDone {
                    block: ContentBlock::ToolUse { id, input, .. },
                    ..
                } => Some((id.clone(), input.is_object())),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![("a".to_string(), true), ("b".to_string(), true)]);
    }
}
