//! Activity feed: reasoning notes and tool calls, newest first.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::{Message, ToolStatus};

static REASON_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)<reason>(.*?)</reason>").ok());

static TOOL_CALL_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[TOOL_CALL:[^\]]+\]").ok());

/// What an activity entry describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityKind {
    /// A `<reason>` note from the model.
    Reasoning { text: String },
    /// A tool call and where it stands.
    ToolCall {
        id: String,
        name: String,
        status: ToolStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// One row of the activity feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub struct ActivityEntry {
    /// Message the entry came from.
    pub message_id: String,
    /// Ms since epoch.
    pub timestamp: i64,
    #[serde(flatten)]
    pub kind: ActivityKind,
}

/// Text of every `<reason>…</reason>` span in `content`.
#[must_use]
pub fn reasoning_spans(content: &str) -> Vec<String> {
    let Some(re) = REASON_RE.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(content)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Content with reasoning and tool call markers removed, for plain display.
#[must_use]
pub fn strip_markers(content: &str) -> String {
    let mut text = content.to_string();
    if let Some(re) = REASON_RE.as_ref() {
        text = re.replace_all(&text, "").into_owned();
    }
    if let Some(re) = TOOL_CALL_RE.as_ref() {
        text = re.replace_all(&text, "").into_owned();
    }
    text.trim().to_string()
}

/// Flatten a transcript into activity entries, newest first.
#[must_use]
pub fn activity(messages: &[Message]) -> Vec<ActivityEntry> {
    let mut entries = Vec::new();

    for message in messages {
        for text in reasoning_spans(&message.content) {
            entries.push(ActivityEntry {
                message_id: message.id.clone(),
                timestamp: message.created_at,
                kind: ActivityKind::Reasoning { text },
            });
        }

        for call in &message.tool_calls {
            entries.push(ActivityEntry {
                message_id: message.id.clone(),
                timestamp: call.created_at,
                kind: ActivityKind::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    status: call.status(),
                    detail: call.result().map(str::to_string),
                },
            });
        }
    }

    // Reverse first so the stable sort leaves ties newest-in-transcript first
    entries.reverse();
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::ToolCall;

    #[test]
    fn extracts_reasoning() {
        let spans = reasoning_spans("<reason>first</reason> text <reason>\nsecond\n</reason>");
        assert_eq!(spans, vec!["first", "second"]);
    }

    #[test]
    fn strips_markers() {
        let text = strip_markers("<reason>why</reason>Done.\n[TOOL_CALL:call_1]");
        assert_eq!(text, "Done.");
    }

    #[test]
    fn newest_first() {
        let mut old = Message::assistant("<reason>plan</reason>", Vec::new());
        old.created_at = 100;
        let mut call = ToolCall::new("c1", "runCommand", serde_json::json!({}));
        call.created_at = 200;
        let mut new = Message::assistant("[TOOL_CALL:c1]", vec![call]);
        new.created_at = 200;

        let feed = activity(&[old, new]);
        assert_eq!(feed.len(), 2);
        assert_eq!(feed[0].timestamp, 200);
        assert!(matches!(feed[0].kind, ActivityKind::ToolCall { .. }));
        assert!(matches!(feed[1].kind, ActivityKind::Reasoning { .. }));
    }
}
