//! CLI command parsing and execution.

mod auth;
mod chat;

pub use auth::{LoginArgs, auth_login, auth_logout, read_secret, store_sandbox_token};
pub use chat::{print_event, run_chat};

use clap::{Parser, Subcommand, ValueEnum};

use crate::core::agent::AgentMode;

/// Onyx - an AI engineer that builds Node.js apps inside a sandbox.
#[derive(Parser)]
#[command(name = "onyx")]
#[command(about = "AI engineer that builds Node.js apps inside a sandbox")]
#[command(version = crate::build_info::VERSION)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Prompt mode selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Plan,
    Execute,
    Fix,
}

impl From<ModeArg> for AgentMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Plan => Self::Plan,
            ModeArg::Execute => Self::Execute,
            ModeArg::Fix => Self::Fix,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a message to the agent and stream the turn.
    #[command(visible_alias = "c")]
    Chat {
        /// What to ask for.
        message: String,

        /// Project to work on. A new project is created when omitted.
        #[arg(short, long)]
        project: Option<String>,

        /// Prompt mode for this turn.
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,

        /// Use the built-in scripted model instead of a real provider.
        #[arg(long)]
        offline: bool,
    },

    /// Manage projects.
    Projects {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Inspect a project's conversation.
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Deploy projects to GitHub.
    Github {
        #[command(subcommand)]
        command: GithubCommands,
    },

    /// Manage credentials.
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },

    /// Control the execution backend.
    Backend {
        #[command(subcommand)]
        command: BackendCommands,
    },

    /// Start the HTTP API server.
    Serve {
        /// Host to bind to (defaults to `api.host`).
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (defaults to `api.port`).
        #[arg(short, long)]
        port: Option<u16>,

        /// Use the built-in scripted model instead of a real provider.
        #[arg(long)]
        offline: bool,
    },

    /// Manage configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// List projects, most recently updated first.
    List {
        /// Output format (table or json).
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Create a project.
    Create {
        /// Display name (random when omitted).
        #[arg(short, long)]
        name: Option<String>,

        /// Starter template.
        #[arg(short, long)]
        template: Option<String>,
    },

    /// Delete a project and its session.
    Delete { project: String },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Print the transcript.
    Show {
        project: String,

        /// Output format (text or json).
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Drop the transcript and roadmap.
    Clear { project: String },

    /// Print the roadmap.
    Todos { project: String },

    /// Print reasoning and tool calls, newest first.
    Activity {
        project: String,

        /// Limit number of entries shown.
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand)]
pub enum GithubCommands {
    /// Store a personal access token.
    Login {
        /// Token (read from stdin when omitted).
        #[arg(long)]
        token: Option<String>,
    },

    /// Forget the stored token.
    Logout,

    /// Show the account the stored token belongs to.
    Whoami,

    /// Create a repository and push the project's files to it.
    Push {
        project: String,

        /// Repository name.
        #[arg(short, long)]
        repo: String,

        /// Create a private repository.
        #[arg(long)]
        private: bool,
    },
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Store a provider API key in the system keychain.
    Login(LoginArgs),

    /// Remove a provider API key from the system keychain.
    Logout {
        /// Provider name.
        provider: String,
    },

    /// Store the hosted sandbox token in the system keychain.
    SandboxToken {
        /// Token (read from stdin when omitted).
        token: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum BackendCommands {
    /// Tear down the backend connection and boot it again.
    Restart { project: String },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the current configuration.
    Show,

    /// Show the configuration file path.
    Path,

    /// Generate a new API token for remote access.
    GenerateToken,
}
