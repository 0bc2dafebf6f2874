//! LLM provider implementations.

mod openai;
mod scripted;

pub use openai::OpenAiProvider;
pub use scripted::{ScriptedCall, ScriptedProvider, ScriptedResponse};
