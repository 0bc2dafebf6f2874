//! Terminal rendering for `onyx chat`.

use std::io::Write;
use std::sync::Arc;

use crate::core::Workspace;
use crate::core::agent::{EventSink, LoopEvent, LoopState, TurnOutcome, TurnStop};
use crate::core::session::{Role, ToolCall, ToolStatus};

const PREVIEW_CHARS: usize = 60;

/// Run one turn, streaming events to stdout. Ctrl-C cancels the turn.
pub async fn run_chat(
    workspace: Arc<Workspace>,
    project_id: &str,
    message: &str,
) -> anyhow::Result<TurnOutcome> {
    let (events, mut rx) = EventSink::channel();

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            if print_event(&event, &mut stdout).is_err() {
                break;
            }
        }
    });

    let interrupt = {
        let workspace = workspace.clone();
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                workspace.cancel(&project_id);
            }
        })
    };

    let result = workspace.chat(project_id, message, events).await;
    interrupt.abort();
    let _ = printer.await;
    println!();

    let outcome = result?;
    match outcome.stop {
        TurnStop::Completed => {}
        TurnStop::Cancelled => eprintln!("turn cancelled"),
        TurnStop::RoundLimit => {
            eprintln!("stopped after {} model calls; send another message to continue", outcome.rounds);
        }
    }
    Ok(outcome)
}

/// Write a human-readable rendering of `event`.
pub fn print_event(event: &LoopEvent, out: &mut impl Write) -> std::io::Result<()> {
    match event {
        LoopEvent::TextDelta { text } => write!(out, "{text}")?,
        LoopEvent::MessageAppended { message, .. } => {
            if message.role == Role::Assistant {
                writeln!(out)?;
            }
        }
        LoopEvent::ToolCallUpdated { call, .. } => writeln!(out, "{}", describe_call(call))?,
        LoopEvent::ToolOutput { chunk, .. } => write!(out, "{chunk}")?,
        LoopEvent::TodosChanged { items } => {
            let done = items
                .iter()
                .filter(|i| i.status == crate::core::todo::TodoStatus::Completed)
                .count();
            writeln!(out, "roadmap: {done}/{} done", items.len())?;
        }
        LoopEvent::Log { line } => writeln!(out, "{line}")?,
        LoopEvent::State { state } => {
            if *state == LoopState::Cancelled {
                writeln!(out, "[cancelled]")?;
            }
        }
    }
    out.flush()
}

fn describe_call(call: &ToolCall) -> String {
    match call.status() {
        ToolStatus::Pending => format!("  . {}", call.name),
        ToolStatus::Running => format!("  > {} {}", call.name, preview(&call.input.to_string())),
        ToolStatus::Success => format!("  + {}", call.name),
        ToolStatus::Error => format!(
            "  x {}: {}",
            call.name,
            preview(call.result().unwrap_or_default())
        ),
    }
}

fn preview(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > PREVIEW_CHARS {
        let cut: String = line.chars().take(PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}
