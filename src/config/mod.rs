//! Configuration management for the Onyx CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::agent::{AgentLoop, AgentMode, LlmProvider, OpenAiProvider, ToolRegistry};
use crate::core::backend::{BackendConnector, BackendKind, ConnectionManager, LocalConnector, RemoteConnector};
use crate::core::github::{self, GitHubClient, RetryPolicy};
use crate::core::keychain;
use crate::core::kv::{FileKv, KvStore};
use crate::core::session::{ModelConfig, SessionStore};

/// Environment variable holding the API bearer token.
pub const API_TOKEN_ENV: &str = "ONYX_API_TOKEN";

/// Default environment variable for the hosted sandbox token.
pub const SANDBOX_TOKEN_ENV: &str = "CSB_API_TOKEN";

/// An OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API configuration.
    pub api: ApiConfig,

    /// Agent configuration.
    pub agent: AgentConfig,

    /// Execution backend selection.
    pub backend: BackendConfig,

    /// Where the KV store lives.
    pub storage: StorageConfig,

    /// GitHub deployment settings.
    pub github: GitHubConfig,
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// Loads global config first, then merges project-local config if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let global_path = Self::config_path()?;
        let project_path = Self::project_config_path().ok();
        Self::load_from(&global_path, project_path.as_deref())
    }

    /// Load from explicit paths. Missing files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file cannot be read or parsed.
    pub fn load_from(global: &Path, project: Option<&Path>) -> anyhow::Result<Self> {
        let mut table = read_table(global)?.unwrap_or_default();

        if let Some(project) = project {
            if let Some(overlay) = read_table(project)? {
                tracing::debug!(path = %project.display(), "merging project config");
                merge_tables(&mut table, overlay);
            }
        }

        Ok(toml::Value::Table(table).try_into()?)
    }

    /// Get the project-local configuration file path.
    ///
    /// Looks for `.onyx/config.toml` in the current directory.
    pub fn project_config_path() -> anyhow::Result<PathBuf> {
        let cwd = std::env::current_dir()?;
        Ok(cwd.join(".onyx").join("config.toml"))
    }

    /// Get the configuration file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get the config directory path (`~/.config/onyx/cli/`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
            return Ok(PathBuf::from(xdg_config_home).join("onyx").join("cli"));
        }

        if cfg!(target_os = "macos") {
            if let Ok(home) = std::env::var("HOME") {
                return Ok(PathBuf::from(home).join(".config").join("onyx").join("cli"));
            }
        }

        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("could not determine config directory"))?;

        Ok(base.config_dir().join("onyx").join("cli"))
    }

    /// Get the data directory path (`~/.local/share/onyx/cli/`).
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn data_dir() -> anyhow::Result<PathBuf> {
        let base = directories::BaseDirs::new()
            .ok_or_else(|| anyhow::anyhow!("could not determine data directory"))?;

        Ok(base.data_dir().join("onyx").join("cli"))
    }

    /// Open the configured KV store.
    ///
    /// # Errors
    ///
    /// Returns an error if the default data directory cannot be determined.
    pub fn kv_store(&self) -> anyhow::Result<Arc<dyn KvStore>> {
        let store = match &self.storage.kv_dir {
            Some(dir) => FileKv::with_root(dir.clone()),
            None => FileKv::new()?,
        };
        tracing::debug!(root = %store.root().display(), "using file kv store");
        Ok(Arc::new(store))
    }

    /// Assemble the agent loop: tool registry over the configured backend, the
    /// session store over `kv`, and `provider` for completions.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be configured.
    pub fn agent_loop(
        &self,
        kv: Arc<dyn KvStore>,
        provider: Arc<dyn LlmProvider>,
    ) -> anyhow::Result<AgentLoop> {
        let connector = self.backend.connector(kv.clone())?;
        let backends = Arc::new(ConnectionManager::new(connector));
        let tools = ToolRegistry::new(backends, kv.clone())
            .with_timeout(self.agent.tool_timeout());

        Ok(AgentLoop::new(provider, Arc::new(tools), SessionStore::new(kv))
            .with_max_rounds(self.agent.max_rounds))
    }

    /// Write the configuration as TOML to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to_path(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Save a provider configuration to the config file
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_provider(name: &str, config: &ProviderConfig) -> anyhow::Result<()> {
        Self::save_provider_to_path(name, config, &Self::config_path()?)
    }

    /// Insert `[agent.providers.<name>]` into the file at `path`, keeping everything else.
    pub fn save_provider_to_path(
        name: &str,
        config: &ProviderConfig,
        path: &Path,
    ) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut config_table = read_table(path)?.unwrap_or_default();

        let agent_table = config_table
            .entry("agent")
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()))
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("agent section must be a table"))?;

        let providers_table = agent_table
            .entry("providers")
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()))
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("providers section must be a table"))?;

        let provider_value = toml::Value::try_from(config)?;
        providers_table.insert(name.to_string(), provider_value);

        let toml_string = toml::to_string_pretty(&toml::Value::Table(config_table))?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }
}

fn read_table(path: &Path) -> anyhow::Result<Option<toml::Table>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)?;
    let table = toml::from_str::<toml::Table>(&contents)
        .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
    Ok(Some(table))
}

/// Recursively overlay `overlay` on `base`; tables merge, everything else replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Host to bind to.
    pub host: String,

    /// Port to bind to.
    pub port: u16,

    /// API token for authentication (optional, but required for remote access).
    /// Can also be set via `ONYX_API_TOKEN` environment variable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7890,
            token: None,
        }
    }
}

impl ApiConfig {
    /// Get the API token, preferring env var over config file.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        std::env::var(API_TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.token.clone())
    }

    /// Generate a new random API token.
    #[must_use]
    pub fn generate_token() -> String {
        use rand::Rng;
        let mut rng = rand::rng();
        let bytes: [u8; 32] = rng.random();
        format!("onyx_{}", hex::encode(bytes))
    }
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Active provider name (key in providers table).
    pub provider: String,

    /// Model to use.
    pub model: String,

    /// Sampling temperature.
    pub temperature: f32,

    /// Maximum tokens in response.
    pub max_tokens: u32,

    /// Model calls allowed per user turn.
    pub max_rounds: usize,

    /// Built-in prompt to use.
    pub mode: AgentMode,

    /// Replaces the mode prompt when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Upper bound for a single tool handler. Unset means no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_timeout_secs: Option<u64>,

    /// Provider definitions.
    #[serde(default = "AgentConfig::default_providers")]
    pub providers: HashMap<String, ProviderConfig>,
}

impl AgentConfig {
    /// Get the default provider configurations.
    fn default_providers() -> HashMap<String, ProviderConfig> {
        let mut providers = HashMap::new();

        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                base_url: None,
                api_key_env: Some("OPENAI_API_KEY".to_string()),
            },
        );

        providers.insert(
            "ollama".to_string(),
            ProviderConfig {
                base_url: Some("http://localhost:11434/v1".to_string()),
                api_key_env: None,
            },
        );

        providers.insert(
            "lmstudio".to_string(),
            ProviderConfig {
                base_url: Some("http://localhost:1234/v1".to_string()),
                api_key_env: None,
            },
        );

        providers.insert(
            "groq".to_string(),
            ProviderConfig {
                base_url: Some("https://api.groq.com/openai/v1".to_string()),
                api_key_env: Some("GROQ_API_KEY".to_string()),
            },
        );

        providers.insert(
            "openrouter".to_string(),
            ProviderConfig {
                base_url: Some("https://openrouter.ai/api/v1".to_string()),
                api_key_env: Some("OPENROUTER_API_KEY".to_string()),
            },
        );

        providers.insert(
            "together".to_string(),
            ProviderConfig {
                base_url: Some("https://api.together.xyz/v1".to_string()),
                api_key_env: Some("TOGETHER_API_KEY".to_string()),
            },
        );

        providers
    }

    pub(crate) fn resolve_api_key(provider_name: &str, config: &ProviderConfig) -> Option<String> {
        // Env first, so development builds don't trigger keychain prompts
        if let Some(env_name) = &config.api_key_env {
            if let Ok(key) = std::env::var(env_name) {
                if !key.is_empty() {
                    return Some(key);
                }
            }
        }

        keychain::get_api_key(provider_name)
    }

    /// Create the configured LLM provider.
    ///
    /// # Errors
    ///
    /// Returns error if the provider is unknown, or if it expects an API key and none
    /// is configured.
    pub fn create_provider(&self) -> anyhow::Result<Arc<dyn LlmProvider>> {
        let config = self.providers.get(&self.provider).ok_or_else(|| {
            anyhow::anyhow!(
                "unknown provider '{}', check [agent.providers] config",
                self.provider
            )
        })?;

        let api_key = Self::resolve_api_key(&self.provider, config);
        if api_key.is_none() && config.api_key_env.is_some() {
            anyhow::bail!(
                "No API key configured for provider '{}'.\n\n\
                 Set {} or store one in the keychain.",
                self.provider,
                config.api_key_env.as_deref().unwrap_or_default()
            );
        }

        Ok(Arc::new(OpenAiProvider::with_config(
            api_key,
            config.base_url.clone(),
        )))
    }

    /// Model settings for new and loaded sessions.
    #[must_use]
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt.clone(),
            mode: self.mode,
        }
    }

    #[must_use]
    pub fn tool_timeout(&self) -> Option<Duration> {
        self.tool_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        let model = ModelConfig::default();
        Self {
            provider: "openai".to_string(),
            model: model.model,
            temperature: model.temperature,
            max_tokens: model.max_tokens,
            max_rounds: crate::core::agent::DEFAULT_MAX_ROUNDS,
            mode: model.mode,
            system_prompt: None,
            tool_timeout_secs: None,
            providers: Self::default_providers(),
        }
    }
}

/// Execution backend selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Which variant to boot.
    pub kind: BackendKind,

    /// Local sandbox settings.
    pub local: LocalBackendConfig,

    /// Hosted sandbox settings.
    pub remote: RemoteBackendConfig,
}

/// Per-project directories on this machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackendConfig {
    /// Parent of the project directories. Defaults to `<data dir>/projects`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Refuse to boot unless `node` is on `PATH`.
    pub require_node: bool,
}

/// Hosted sandbox reached over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBackendConfig {
    pub base_url: String,

    /// Environment variable holding the API token.
    pub token_env: String,
}

impl Default for RemoteBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://sandbox.onyxgpt.dev/api".to_string(),
            token_env: SANDBOX_TOKEN_ENV.to_string(),
        }
    }
}

impl RemoteBackendConfig {
    /// Token from the environment, then the keychain.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(keychain::get_sandbox_token)
    }
}

impl BackendConfig {
    /// Connector for the configured variant.
    ///
    /// # Errors
    ///
    /// Returns an error if the default local root cannot be determined.
    pub fn connector(&self, kv: Arc<dyn KvStore>) -> anyhow::Result<Arc<dyn BackendConnector>> {
        match self.kind {
            BackendKind::Local => {
                let root = match &self.local.root {
                    Some(root) => root.clone(),
                    None => Config::data_dir()?.join("projects"),
                };
                tracing::debug!(root = %root.display(), "using local backend");
                Ok(Arc::new(LocalConnector::new(root, self.local.require_node)))
            }
            BackendKind::Remote => {
                let token = self.remote.token();
                if token.is_none() {
                    tracing::warn!(
                        env = %self.remote.token_env,
                        "no sandbox token configured, the remote backend will be unavailable"
                    );
                }
                Ok(Arc::new(RemoteConnector::new(
                    self.remote.base_url.clone(),
                    token,
                    kv,
                )))
            }
        }
    }
}

/// KV store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the file store. Defaults to `<data dir>/kv`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kv_dir: Option<PathBuf>,
}

/// GitHub deployment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitHubConfig {
    pub api_base: String,

    /// Branch lookups attempted after creating a repository.
    pub branch_retry_attempts: u32,

    /// Pause between branch lookups.
    pub branch_retry_interval_ms: u64,

    pub commit_message: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            api_base: github::DEFAULT_API_BASE.to_string(),
            branch_retry_attempts: retry.attempts,
            branch_retry_interval_ms: u64::try_from(retry.interval.as_millis()).unwrap_or(1000),
            commit_message: github::DEFAULT_COMMIT_MESSAGE.to_string(),
        }
    }
}

impl GitHubConfig {
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.branch_retry_attempts,
            interval: Duration::from_millis(self.branch_retry_interval_ms),
        }
    }

    /// Client authenticated with the token stored in `kv`.
    ///
    /// # Errors
    ///
    /// Returns [`github::GitHubError::MissingToken`] when no token is stored.
    pub async fn client(&self, kv: &dyn KvStore) -> github::Result<GitHubClient> {
        Ok(GitHubClient::from_kv(kv, self.api_base.clone())
            .await?
            .with_retry(self.retry_policy())
            .with_commit_message(self.commit_message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kv::MemoryKv;
    use tempfile::TempDir;

    #[test]
    fn default_providers_exist() {
        let config = AgentConfig::default();
        assert!(config.providers.contains_key("openai"));
        assert!(config.providers.contains_key("ollama"));
    }

    #[test]
    fn defaults_match_the_hosted_app() {
        let config = Config::default();
        assert_eq!(config.agent.provider, "openai");
        assert_eq!(config.agent.model, "gpt-4o");
        assert_eq!(config.agent.max_rounds, 25);
        assert_eq!(config.agent.mode, AgentMode::Execute);
        assert_eq!(config.agent.tool_timeout(), None);
        assert_eq!(config.backend.kind, BackendKind::Local);
        assert_eq!(config.github.branch_retry_attempts, 5);
        assert_eq!(config.github.branch_retry_interval_ms, 1000);
    }

    #[test]
    fn unknown_provider_returns_error() {
        let config = AgentConfig {
            provider: "nonexistent".to_string(),
            ..Default::default()
        };
        let err = config.create_provider().err().unwrap();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn keyless_provider_needs_no_key() {
        let config = AgentConfig {
            provider: "ollama".to_string(),
            ..Default::default()
        };
        assert!(config.create_provider().is_ok());
    }

    #[test]
    fn env_var_takes_precedence_in_resolve_api_key() {
        // HOME is always set in test environments
        let config = ProviderConfig {
            base_url: None,
            api_key_env: Some("HOME".to_string()),
        };

        let result = AgentConfig::resolve_api_key("test-provider", &config);
        assert_eq!(result, std::env::var("HOME").ok());
    }

    #[test]
    fn zero_timeout_means_unbounded() {
        let config = AgentConfig {
            tool_timeout_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(config.tool_timeout(), None);

        let config = AgentConfig {
            tool_timeout_secs: Some(30),
            ..Default::default()
        };
        assert_eq!(config.tool_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn missing_files_yield_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_from(
            &temp_dir.path().join("nope.toml"),
            Some(&temp_dir.path().join("also-nope.toml")),
        )
        .unwrap();
        assert_eq!(config.agent.model, "gpt-4o");
        assert_eq!(config.api.port, 7890);
    }

    #[test]
    fn project_config_overrides_global() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("global.toml");
        let project = temp_dir.path().join("project.toml");

        std::fs::write(
            &global,
            r#"
[agent]
model = "gpt-4o-mini"
max_rounds = 10

[backend]
kind = "remote"

[backend.remote]
base_url = "https://sandbox.example.com"
"#,
        )
        .unwrap();
        std::fs::write(
            &project,
            r#"
[agent]
mode = "plan"

[backend.remote]
token_env = "MY_TOKEN"
"#,
        )
        .unwrap();

        let config = Config::load_from(&global, Some(&project)).unwrap();
        assert_eq!(config.agent.model, "gpt-4o-mini");
        assert_eq!(config.agent.max_rounds, 10);
        assert_eq!(config.agent.mode, AgentMode::Plan);
        assert_eq!(config.backend.kind, BackendKind::Remote);
        assert_eq!(config.backend.remote.base_url, "https://sandbox.example.com");
        assert_eq!(config.backend.remote.token_env, "MY_TOKEN");
        assert!(config.agent.providers.contains_key("openai"));
    }

    #[test]
    fn invalid_config_names_the_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[agent\nmodel = 1").unwrap();

        let err = Config::load_from(&path, None).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn model_config_carries_agent_settings() {
        let config = AgentConfig {
            model: "llama3".to_string(),
            mode: AgentMode::Fix,
            system_prompt: Some("custom".to_string()),
            ..Default::default()
        };
        let model = config.model_config();
        assert_eq!(model.model, "llama3");
        assert_eq!(model.mode, AgentMode::Fix);
        assert_eq!(model.effective_system_prompt(), "custom");
    }

    #[test]
    fn generated_tokens_are_prefixed_and_unique() {
        let a = ApiConfig::generate_token();
        let b = ApiConfig::generate_token();
        assert!(a.starts_with("onyx_"));
        assert_eq!(a.len(), "onyx_".len() + 64);
        assert_ne!(a, b);
    }

    #[test]
    fn save_provider_creates_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let provider_config = ProviderConfig {
            base_url: Some("https://api.example.com/v1".to_string()),
            api_key_env: Some("TEST_API_KEY".to_string()),
        };

        Config::save_provider_to_path("test_provider", &provider_config, &config_path).unwrap();

        let config = Config::load_from(&config_path, None).unwrap();
        assert_eq!(
            config.agent.providers.get("test_provider"),
            Some(&provider_config)
        );
    }

    #[test]
    fn save_provider_preserves_existing() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        std::fs::write(
            &config_path,
            r#"
[agent]
model = "gpt-4o"
provider = "openai"

[github]
commit_message = "ship it"
"#,
        )
        .unwrap();

        let example = ProviderConfig {
            base_url: Some("https://api.example.com".to_string()),
            api_key_env: None,
        };
        Config::save_provider_to_path("example", &example, &config_path).unwrap();

        let config = Config::load_from(&config_path, None).unwrap();
        assert_eq!(config.github.commit_message, "ship it");
        assert!(config.agent.providers.contains_key("example"));
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.storage.kv_dir = Some(temp_dir.path().join("kv"));
        config.agent.tool_timeout_secs = Some(90);
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from(&path, None).unwrap();
        assert_eq!(loaded.storage.kv_dir, config.storage.kv_dir);
        assert_eq!(loaded.agent.tool_timeout_secs, Some(90));
    }

    #[tokio::test]
    async fn agent_loop_uses_configured_local_root() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.backend.local.root = Some(temp_dir.path().to_path_buf());
        config.agent.max_rounds = 3;

        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let provider = Arc::new(crate::core::agent::ScriptedProvider::new(Vec::new()));
        let agent = config.agent_loop(kv, provider).unwrap();

        assert_eq!(agent.tools().backends().kind(), BackendKind::Local);
        agent.tools().backends().backend("demo").await.unwrap();
        assert!(temp_dir.path().join("demo").is_dir());
    }

    #[tokio::test]
    async fn github_client_requires_stored_token() {
        let kv = MemoryKv::new();
        let err = GitHubConfig::default().client(&kv).await.unwrap_err();
        assert!(matches!(err, github::GitHubError::MissingToken));

        github::save_token(&kv, "ghp_test").await.unwrap();
        assert!(GitHubConfig::default().client(&kv).await.is_ok());
    }
}
