//! Core business logic shared by the CLI and the HTTP API.

pub mod agent;
pub mod backend;
pub mod cloud;
mod error;
pub mod github;
pub mod keychain;
pub mod kv;
pub mod navigator;
pub mod project;
pub mod session;
pub mod todo;
mod workspace;

pub use agent::AgentLoop;
pub use error::{Error, Result};
pub use workspace::Workspace;
