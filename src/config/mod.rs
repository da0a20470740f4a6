use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::retry::{CircuitBreakerConfig, RetryConfig};

fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_timeout_secs() -> f64 {
    120.0
}
fn default_json_mode_instruction() -> String {
    "You must respond with a valid JSON object. Do not include any text outside the JSON."
        .to_string()
}
fn default_max_image_size_kb() -> u64 {
    500
}
fn default_max_recursion_depth() -> usize {
    3
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

/// Model-facing defaults applied when a request leaves them unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default, rename = "defaultModel")]
    pub default_model: Option<String>,
    #[serde(default = "default_temperature", rename = "defaultTemperature")]
    pub default_temperature: f64,
    #[serde(default = "default_max_tokens", rename = "defaultMaxTokens")]
    pub default_max_tokens: u32,
    #[serde(default = "default_timeout_secs", rename = "defaultTimeoutSecs")]
    pub default_timeout_secs: f64,
    #[serde(default = "default_json_mode_instruction", rename = "jsonModeInstruction")]
    pub json_mode_instruction: String,
    #[serde(default = "default_max_image_size_kb", rename = "maxImageSizeKb")]
    pub max_image_size_kb: u64,
    #[serde(default = "default_max_recursion_depth", rename = "maxRecursionDepth")]
    pub max_recursion_depth: usize,
    /// Fallback chat-completions base URL for models with no known prefix.
    #[serde(default = "default_base_url", rename = "defaultBaseUrl")]
    pub default_base_url: String,
    /// When true, requests without explicit validators get the defaults
    /// (`response_not_empty`, plus `json_string` in JSON mode).
    #[serde(default = "default_validation_enabled", rename = "validationEnabled")]
    pub validation_enabled: bool,
}

fn default_validation_enabled() -> bool {
    true
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: None,
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            default_timeout_secs: default_timeout_secs(),
            json_mode_instruction: default_json_mode_instruction(),
            max_image_size_kb: default_max_image_size_kb(),
            max_recursion_depth: default_max_recursion_depth(),
            default_base_url: default_base_url(),
            validation_enabled: true,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3010
}
fn default_cli_path() -> PathBuf {
    PathBuf::from("claude")
}
fn default_workspace_dir() -> PathBuf {
    PathBuf::from("workspace")
}
fn default_subprocess_timeout_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}

/// CLI proxy server + subprocess executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to the external LLM binary.
    #[serde(default = "default_cli_path", rename = "cliPath")]
    pub cli_path: PathBuf,
    /// CWD for subprocesses; holds the per-request `.mcp.json`.
    #[serde(default = "default_workspace_dir", rename = "workspaceDir")]
    pub workspace_dir: PathBuf,
    #[serde(
        default = "default_subprocess_timeout_secs",
        rename = "subprocessTimeoutSecs"
    )]
    pub subprocess_timeout_secs: u64,
    /// Pass `--verbose` to the CLI binary.
    #[serde(default = "default_true", rename = "verboseCli")]
    pub verbose_cli: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cli_path: default_cli_path(),
            workspace_dir: default_workspace_dir(),
            subprocess_timeout_secs: default_subprocess_timeout_secs(),
            verbose_cli: true,
        }
    }
}

impl ProxyConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/v1", self.host, self.port)
    }
}

fn default_polling_db() -> PathBuf {
    PathBuf::from("data/polling_tasks.db")
}
fn default_max_concurrent() -> usize {
    5
}
fn default_cleanup_after_hours() -> u64 {
    24
}
fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_polling_db", rename = "dbPath")]
    pub db_path: PathBuf,
    #[serde(default = "default_max_concurrent", rename = "maxConcurrentTasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_cleanup_after_hours", rename = "cleanupAfterHours")]
    pub cleanup_after_hours: u64,
    #[serde(default = "default_poll_interval_ms", rename = "pollIntervalMs")]
    pub poll_interval_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            db_path: default_polling_db(),
            max_concurrent_tasks: default_max_concurrent(),
            cleanup_after_hours: default_cleanup_after_hours(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_conversations_db() -> PathBuf {
    PathBuf::from("data/conversations.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationsConfig {
    #[serde(default = "default_conversations_db", rename = "dbPath")]
    pub db_path: PathBuf,
    /// Tail window applied when replaying a conversation into a request.
    /// `None` replays everything.
    #[serde(default, rename = "replayLimit")]
    pub replay_limit: Option<usize>,
}

impl Default for ConversationsConfig {
    fn default() -> Self {
        Self {
            db_path: default_conversations_db(),
            replay_limit: None,
        }
    }
}

/// Provider credentials and cloud-project coordinates. Values come from the
/// config file or environment; Debug output never prints key material.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderKeys {
    #[serde(default, rename = "openaiApiKey")]
    pub openai_api_key: Option<String>,
    #[serde(default, rename = "anthropicApiKey")]
    pub anthropic_api_key: Option<String>,
    #[serde(default, rename = "vertexProject")]
    pub vertex_project: Option<String>,
    #[serde(default, rename = "vertexLocation")]
    pub vertex_location: Option<String>,
}

impl std::fmt::Debug for ProviderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn redact(v: &Option<String>) -> &'static str {
            match v {
                Some(_) => "[REDACTED]",
                None => "[unset]",
            }
        }
        f.debug_struct("ProviderKeys")
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("anthropic_api_key", &redact(&self.anthropic_api_key))
            .field("vertex_project", &self.vertex_project)
            .field("vertex_location", &self.vertex_location)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub conversations: ConversationsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default, rename = "circuitBreaker")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub providers: ProviderKeys,
}

impl GatewayConfig {
    /// Load configuration: defaults, then an optional TOML file, then
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read config file: {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file: {}", p.display()))?
            }
            Some(p) => {
                debug!("config file {} not found, using defaults", p.display());
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("OPENAI_API_KEY") {
            if !v.is_empty() {
                self.providers.openai_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ANTHROPIC_API_KEY") {
            if !v.is_empty() {
                self.providers.anthropic_api_key = Some(v);
            }
        }
        if self.providers.vertex_project.is_none() {
            if let Ok(v) = std::env::var("GOOGLE_CLOUD_PROJECT") {
                self.providers.vertex_project = Some(v);
            }
        }
        if self.providers.vertex_location.is_none() {
            if let Ok(v) = std::env::var("GOOGLE_CLOUD_REGION") {
                self.providers.vertex_location = Some(v);
            }
        }
        if let Ok(v) = std::env::var("CLI_BIN_PATH") {
            if !v.is_empty() {
                self.proxy.cli_path = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("PROXY_HOST") {
            if !v.is_empty() {
                self.proxy.host = v;
            }
        }
        if let Ok(v) = std::env::var("PROXY_PORT") {
            if let Ok(port) = v.parse() {
                self.proxy.port = port;
            }
        }
    }
}

#[cfg(test)]
mod tests;
