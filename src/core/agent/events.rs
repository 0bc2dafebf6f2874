//! Events streamed out of the agent loop while a turn runs.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::session::{Message, ToolCall};
use crate::core::todo::TodoItem;

/// Agent loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    AwaitingModel,
    ToolCallsPending,
    ExecutingTools,
    Cancelled,
}

/// Something observable happened during a turn.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// The loop moved to a new state.
    State { state: LoopState },
    /// Model text as it streams in.
    TextDelta { text: String },
    /// A message was added to the transcript.
    MessageAppended { index: usize, message: Message },
    /// A tool call changed status.
    ToolCallUpdated { message_index: usize, call: ToolCall },
    /// A chunk of command output, forwarded as it arrives.
    ToolOutput { call_id: String, chunk: String },
    /// The roadmap changed.
    TodosChanged { items: Vec<TodoItem> },
    /// A terminal log line.
    Log { line: String },
}

/// Sending half of the loop's event channel.
///
/// A sink without a receiver drops events. Every event is mirrored to `tracing`.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<LoopEvent>>,
}

impl EventSink {
    /// Create a connected sink and its receiver.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LoopEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only logs.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Publish an event. A closed receiver is not an error.
    pub fn emit(&self, event: LoopEvent) {
        match &event {
            LoopEvent::State { state } => tracing::debug!(state = ?state, "loop state"),
            LoopEvent::ToolCallUpdated { call, .. } => {
                tracing::info!(tool = %call.name, call_id = %call.id, status = %call.status(), "tool call updated");
            }
            LoopEvent::ToolOutput { call_id, chunk } => {
                tracing::trace!(call_id = %call_id, bytes = chunk.len(), "tool output");
            }
            LoopEvent::Log { line } => tracing::info!("{line}"),
            LoopEvent::MessageAppended { index, message } => {
                tracing::debug!(index, role = ?message.role, "message appended");
            }
            LoopEvent::TextDelta { .. } | LoopEvent::TodosChanged { .. } => {}
        }

        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub fn state(&self, state: LoopState) {
        self.emit(LoopEvent::State { state });
    }

    pub fn log(&self, line: impl Into<String>) {
        self.emit(LoopEvent::Log { line: line.into() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(LoopEvent::State {
            state: LoopState::AwaitingModel,
        })
        .unwrap();
        assert_eq!(json["type"], "state");
        assert_eq!(json["state"], "awaiting_model");
    }

    #[tokio::test]
    async fn dropped_receiver_is_ignored() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.log("still fine");
    }

    #[tokio::test]
    async fn receiver_sees_events_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.state(LoopState::AwaitingModel);
        sink.log("hello");
        assert!(matches!(rx.recv().await, Some(LoopEvent::State { .. })));
        assert!(matches!(rx.recv().await, Some(LoopEvent::Log { line }) if line == "hello"));
    }
}
