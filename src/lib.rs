//! Onyx - an AI engineer that builds Node.js apps inside a sandbox.
//!
//! The library holds everything the `onyx` binary and the HTTP API share:
//! - the agent loop and its tool dispatcher
//! - execution backends (local directory or hosted sandbox)
//! - sessions, roadmaps and the project index over a KV store
//! - GitHub deployment
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐        ┌─────────────┐
//! │     CLI     │        │   HTTP API  │
//! └──────┬──────┘        └──────┬──────┘
//!        └──────────┬───────────┘
//!            ┌──────┴──────┐
//!            │  Workspace  │
//!            └──────┬──────┘
//!      ┌────────────┼────────────┐
//! ┌────┴────┐  ┌────┴────┐  ┌────┴────┐
//! │  Agent  │  │ Backend │  │   KV    │
//! └─────────┘  └─────────┘  └─────────┘
//! ```

pub mod api;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod core;

pub use config::Config;
pub use core::{AgentLoop, Workspace};
