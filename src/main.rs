use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use onyx::{
    Config, Workspace,
    cli::{
        AuthCommands, BackendCommands, Cli, Commands, ConfigCommands, GithubCommands,
        ProjectCommands, SessionCommands,
    },
    core::{
        agent::{LlmProvider, ScriptedProvider},
        github,
        session::{Role, strip_markers},
    },
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(version = %onyx::build_info::version_string(), "onyx starting");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Assemble the workspace. `offline` swaps the configured model for the scripted demo.
fn workspace(config: &Config, offline: bool) -> anyhow::Result<Arc<Workspace>> {
    let provider: Arc<dyn LlmProvider> = if offline {
        Arc::new(ScriptedProvider::demo())
    } else {
        config.agent.create_provider()?
    };
    let kv = config.kv_store()?;
    let agent = config.agent_loop(kv, provider)?;
    Ok(Arc::new(Workspace::new(agent, config.agent.model_config())))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Chat {
            message,
            project,
            mode,
            offline,
        } => {
            let mut config = Config::load()?;
            if let Some(mode) = mode {
                config.agent.mode = mode.into();
            }
            let workspace = workspace(&config, offline)?;

            let project_id = match project {
                Some(id) => workspace.project(&id).await?.id,
                None => {
                    let project = workspace.create_project(None, None).await?;
                    eprintln!("Created project {} ({})", project.name, project.id);
                    project.id
                }
            };

            onyx::cli::run_chat(workspace, &project_id, &message).await?;
        }

        Commands::Projects { command } => {
            // Project and session commands never call the model
            let workspace = workspace(&Config::load()?, true)?;
            handle_project_command(&workspace, command).await?;
        }

        Commands::Session { command } => {
            let workspace = workspace(&Config::load()?, true)?;
            handle_session_command(&workspace, command).await?;
        }

        Commands::Github { command } => {
            let config = Config::load()?;
            handle_github_command(&config, command).await?;
        }

        Commands::Auth { command } => match command {
            AuthCommands::Login(args) => onyx::cli::auth_login(args)?,
            AuthCommands::Logout { provider } => onyx::cli::auth_logout(&provider)?,
            AuthCommands::SandboxToken { token } => onyx::cli::store_sandbox_token(token)?,
        },

        Commands::Backend { command } => match command {
            BackendCommands::Restart { project } => {
                let workspace = workspace(&Config::load()?, true)?;
                workspace.project(&project).await?;
                let status = workspace.restart_backend(&project).await?;
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
        },

        Commands::Serve {
            host,
            port,
            offline,
        } => {
            let config = Config::load()?;
            let workspace = workspace(&config, offline)?;
            let host = host.unwrap_or_else(|| config.api.host.clone());
            let port = port.unwrap_or(config.api.port);
            onyx::api::serve(workspace, config.api.token(), &host, port).await?;
        }

        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                let config = Config::load()?;
                println!("{}", toml::to_string_pretty(&config)?);
            }
            ConfigCommands::Path => {
                let path = Config::config_path()?;
                println!("{}", path.display());
            }
            ConfigCommands::GenerateToken => {
                let token = onyx::config::ApiConfig::generate_token();
                println!("Generated API token:\n");
                println!("  {token}\n");
                println!("Add to your config.toml:");
                println!("  [api]");
                println!("  token = \"{token}\"\n");
                println!("Or set environment variable:");
                println!("  export {}=\"{token}\"", onyx::config::API_TOKEN_ENV);
            }
        },
    }

    Ok(())
}

async fn handle_project_command(workspace: &Workspace, command: ProjectCommands) -> anyhow::Result<()> {
    match command {
        ProjectCommands::List { format } => {
            let projects = workspace.projects().list().await?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&projects)?);
            } else {
                println!("{:<10} {:<30} Updated", "ID", "Name");
                println!("{}", "-".repeat(60));
                for project in projects {
                    let updated = chrono::DateTime::from_timestamp_millis(project.updated_at)
                        .map_or_else(
                            || "Unknown".to_string(),
                            |dt| dt.format("%Y-%m-%d %H:%M").to_string(),
                        );
                    let name: String = project.name.chars().take(28).collect();
                    println!("{:<10} {:<30} {}", project.id, name, updated);
                }
            }
        }

        ProjectCommands::Create { name, template } => {
            let project = workspace.create_project(name, template).await?;
            println!("{} {}", project.id, project.name);
        }

        ProjectCommands::Delete { project } => {
            workspace.delete_project(&project).await?;
            println!("Deleted project {project}");
        }
    }

    Ok(())
}

async fn handle_session_command(workspace: &Workspace, command: SessionCommands) -> anyhow::Result<()> {
    match command {
        SessionCommands::Show { project, format } => {
            let messages = workspace.messages(&project).await?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&messages)?);
            } else {
                for message in messages {
                    let role = match message.role {
                        Role::User => "you",
                        Role::Assistant => "onyx",
                        Role::System => "system",
                    };
                    println!("[{role}] {}", strip_markers(&message.content).trim());
                    for call in &message.tool_calls {
                        println!("  - {} ({})", call.name, call.status());
                    }
                }
            }
        }

        SessionCommands::Clear { project } => {
            workspace.clear_session(&project).await?;
            println!("Cleared session for {project}");
        }

        SessionCommands::Todos { project } => {
            let (_, todos) = workspace.open(&project).await?;
            if todos.items().is_empty() {
                println!("No roadmap yet.");
            } else {
                println!("{}", todos.render());
            }
        }

        SessionCommands::Activity { project, limit } => {
            for entry in workspace.activity(&project).await?.into_iter().take(limit) {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
    }

    Ok(())
}

async fn handle_github_command(config: &Config, command: GithubCommands) -> anyhow::Result<()> {
    let kv = config.kv_store()?;

    match command {
        GithubCommands::Login { token } => {
            let token = match token {
                Some(token) => token,
                None => onyx::cli::read_secret("GitHub token")?,
            };
            github::save_token(kv.as_ref(), &token).await?;
            println!("Stored GitHub token");
        }

        GithubCommands::Logout => {
            github::delete_token(kv.as_ref()).await?;
            println!("Removed GitHub token");
        }

        GithubCommands::Whoami => {
            let client = config.github.client(kv.as_ref()).await?;
            let user = client.user().await?;
            println!("{}", user.login);
        }

        GithubCommands::Push {
            project,
            repo,
            private,
        } => {
            let client = config.github.client(kv.as_ref()).await?;
            let workspace = workspace(config, true)?;
            let (repository, pushed) = workspace
                .push_to_github(&project, &client, &repo, private)
                .await?;
            println!(
                "Pushed {} files to {} ({} @ {})",
                pushed.files,
                repository
                    .html_url
                    .as_deref()
                    .unwrap_or(&repository.full_name),
                pushed.branch,
                pushed.commit_sha
            );
        }
    }

    Ok(())
}
