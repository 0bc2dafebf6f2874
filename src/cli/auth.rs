use std::io::{BufRead, Write};

use clap::Args;

use crate::config::{AgentConfig, Config};
use crate::core::keychain;

/// Arguments for `onyx auth login`.
#[derive(Debug, Clone, Args)]
pub struct LoginArgs {
    /// Provider name (defaults to `agent.provider`).
    #[arg(short, long)]
    pub provider: Option<String>,

    /// API key (read from stdin when omitted).
    #[arg(long)]
    pub api_key: Option<String>,
}

pub fn auth_login(args: LoginArgs) -> anyhow::Result<()> {
    let default_config = AgentConfig::default();
    let default_providers = &default_config.providers;

    let provider = args.provider.unwrap_or_else(|| default_config.provider.clone());
    let Some(provider_config) = default_providers.get(&provider) else {
        let mut names: Vec<&str> = default_providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        anyhow::bail!(
            "Unknown provider '{}'. Available providers: {}",
            provider,
            names.join(", ")
        );
    };

    let api_key = match args.api_key {
        Some(key) => key,
        None => read_secret(&format!("API key for {provider}"))?,
    };

    keychain::store_api_key(&provider, &api_key)?;
    Config::save_provider(&provider, provider_config)?;

    println!("Stored API key in system keychain");
    println!("Successfully configured provider '{provider}'");

    Ok(())
}

pub fn auth_logout(provider: &str) -> anyhow::Result<()> {
    keychain::delete_api_key(provider)?;
    println!("Removed API key for '{provider}'");
    Ok(())
}

pub fn store_sandbox_token(token: Option<String>) -> anyhow::Result<()> {
    let token = match token {
        Some(token) => token,
        None => read_secret("Sandbox API token")?,
    };
    keychain::store_sandbox_token(&token)?;
    println!("Stored sandbox token in system keychain");
    Ok(())
}

/// Read one non-empty line from stdin after printing `prompt` to stderr.
pub fn read_secret(prompt: &str) -> anyhow::Result<String> {
    eprint!("{prompt}: ");
    std::io::stderr().flush()?;
    read_line(std::io::stdin().lock(), prompt)
}

fn read_line(mut input: impl BufRead, what: &str) -> anyhow::Result<String> {
    let mut line = String::new();
    input.read_line(&mut line)?;
    let value = line.trim();
    if value.is_empty() {
        anyhow::bail!("{what} cannot be empty");
    }
    Ok(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_rejected() {
        let args = LoginArgs {
            provider: Some("nonexistent_provider".to_string()),
            api_key: Some("sk-test".to_string()),
        };

        let err = auth_login(args).unwrap_err();
        assert!(err.to_string().contains("Unknown provider"));
        assert!(err.to_string().contains("Available providers"));
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn read_line_trims_input() {
        let value = read_line("  ghp_abc \n".as_bytes(), "token").unwrap();
        assert_eq!(value, "ghp_abc");
    }

    #[test]
    fn read_line_rejects_empty_input() {
        let err = read_line("\n".as_bytes(), "API key").unwrap_err();
        assert_eq!(err.to_string(), "API key cannot be empty");
    }

    #[test]
    fn ollama_no_key_required() {
        let default_config = AgentConfig::default();
        let ollama = default_config
            .providers
            .get("ollama")
            .expect("Ollama provider should exist");

        assert!(ollama.api_key_env.is_none());
        assert_eq!(ollama.base_url.as_deref(), Some("http://localhost:11434/v1"));
    }
}
