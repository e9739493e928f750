//! Configuration loading, validation, and management for Tilt.
//!
//! Loads configuration from `~/.tilt/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tilt_core::{ApiProvider, ToolVersion};

/// The root configuration structure.
///
/// Maps directly to `~/.tilt/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Anthropic API key. The gateway prefers the key stored in settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model and hosting platform
    #[serde(default)]
    pub model: ModelConfig,

    /// HTTP gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Task, interjection and settings database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Sampling loop bounds
    #[serde(default)]
    pub agent: AgentConfig,

    /// Remote-debuggable browser
    #[serde(default)]
    pub browser: BrowserConfig,

    /// X display driven by the computer tool
    #[serde(default)]
    pub computer: ComputerConfig,

    /// Background task runner
    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("gateway", &self.gateway)
            .field("database", &self.database)
            .field("agent", &self.agent)
            .field("browser", &self.browser)
            .field("computer", &self.computer)
            .field("runner", &self.runner)
            .field("logging", &self.logging)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: ApiProvider,

    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of the direct Anthropic API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Retries on transient failures before a call is reported as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// AWS region for Bedrock
    #[serde(default = "default_aws_region")]
    pub aws_region: String,

    /// Google Cloud region for Vertex
    #[serde(default = "default_vertex_region")]
    pub vertex_region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vertex_project_id: Option<String>,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_max_retries() -> u32 {
    4
}
fn default_request_timeout() -> u64 {
    600
}
fn default_aws_region() -> String {
    "us-east-1".into()
}
fn default_vertex_region() -> String {
    "us-east5".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: ApiProvider::default(),
            model: default_model(),
            base_url: default_base_url(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
            aws_region: default_aws_region(),
            vertex_region: default_vertex_region(),
            vertex_project_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Idle time before the relay sends a keepalive event.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,

    /// Finished per-request timing reports kept for `/timing`.
    #[serde(default = "default_timing_history")]
    pub timing_history: usize,
}

fn default_port() -> u16 {
    8000
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_keepalive_ms() -> u64 {
    1000
}
fn default_timing_history() -> usize {
    50
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            keepalive_interval_ms: default_keepalive_ms(),
            timing_history: default_timing_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    AppConfig::config_dir().join("tilt.db").display().to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model calls allowed in one loop invocation.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Optional wall-clock ceiling for one loop invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_clock_budget_secs: Option<u64>,
}

fn default_max_iterations() -> usize {
    200
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            wall_clock_budget_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// DevTools HTTP endpoint.
    #[serde(default = "default_cdp_url")]
    pub cdp_url: String,

    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Default timeout for `inspect_js`.
    #[serde(default = "default_js_timeout")]
    pub js_timeout_secs: u64,
}

fn default_cdp_url() -> String {
    "http://localhost:9222".into()
}
fn default_readiness_attempts() -> u32 {
    10
}
fn default_readiness_interval() -> u64 {
    1000
}
fn default_js_timeout() -> u64 {
    10
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            cdp_url: default_cdp_url(),
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval(),
            js_timeout_secs: default_js_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputerConfig {
    #[serde(default = "default_display")]
    pub display: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Where screenshots are written before being encoded.
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: PathBuf,
}

fn default_display() -> String {
    ":1".into()
}
fn default_width() -> u32 {
    1024
}
fn default_height() -> u32 {
    768
}
fn default_screenshot_dir() -> PathBuf {
    std::env::temp_dir().join("tilt-screenshots")
}

impl Default for ComputerConfig {
    fn default() -> Self {
        Self {
            display: default_display(),
            width: default_width(),
            height: default_height(),
            screenshot_dir: default_screenshot_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_runner_tool_version")]
    pub tool_version: ToolVersion,

    #[serde(default = "default_runner_images")]
    pub only_n_most_recent_images: usize,

    #[serde(default = "default_runner_max_tokens")]
    pub max_tokens: u32,

    /// Stop after one task so its result can be inspected.
    #[serde(default = "default_true")]
    pub pause_after_completion: bool,

    #[serde(default = "default_idle_poll")]
    pub idle_poll_secs: u64,

    #[serde(default = "default_error_backoff")]
    pub error_backoff_secs: u64,

    #[serde(default = "default_runner_suffix")]
    pub system_prompt_suffix: String,
}

fn default_runner_tool_version() -> ToolVersion {
    ToolVersion::ComputerUse20250124
}
fn default_runner_images() -> usize {
    10
}
fn default_runner_max_tokens() -> u32 {
    8192
}
fn default_idle_poll() -> u64 {
    5
}
fn default_error_backoff() -> u64 {
    10
}
fn default_runner_suffix() -> String {
    "You are an autonomous task execution agent. When displaying captured data from tools \
     (especially network requests and JSON structures), show the complete raw data in code \
     blocks exactly as captured, without interpretation or summarization. Use the \
     task_reporter tool to report progress and results."
        .into()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tool_version: default_runner_tool_version(),
            only_n_most_recent_images: default_runner_images(),
            max_tokens: default_runner_max_tokens(),
            pause_after_completion: true,
            idle_poll_secs: default_idle_poll(),
            error_backoff_secs: default_error_backoff(),
            system_prompt_suffix: default_runner_suffix(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from the default path (~/.tilt/config.toml),
    /// then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in
    /// production and a map in tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("ANTHROPIC_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(model) = non_empty("ANTHROPIC_MODEL") {
            self.model.model = model;
        }
        if let Some(provider) = non_empty("API_PROVIDER") {
            match provider.parse() {
                Ok(provider) => self.model.provider = provider,
                Err(e) => tracing::warn!("Ignoring API_PROVIDER: {e}"),
            }
        }
        if let Some(url) = non_empty("ANTHROPIC_BASE_URL") {
            self.model.base_url = url;
        }
        if let Some(region) = non_empty("AWS_REGION") {
            self.model.aws_region = region;
        }
        if let Some(region) = non_empty("CLOUD_ML_REGION") {
            self.model.vertex_region = region;
        }
        if let Some(project) = non_empty("ANTHROPIC_VERTEX_PROJECT_ID") {
            self.model.vertex_project_id = Some(project);
        }
        if let Some(path) = non_empty("TILT_DB_PATH") {
            self.database.path = path;
        }
        if let Some(host) = non_empty("TILT_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = non_empty("TILT_PORT").and_then(|p| p.parse().ok()) {
            self.gateway.port = port;
        }
        if let Some(display) = non_empty("DISPLAY") {
            self.computer.display = display;
        }
        if let Some(width) = non_empty("WIDTH").and_then(|w| w.parse().ok()) {
            self.computer.width = width;
        }
        if let Some(height) = non_empty("HEIGHT").and_then(|h| h.parse().ok()) {
            self.computer.height = height;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tilt")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.port == 0 {
            return Err(ConfigError::ValidationError("gateway.port must be non-zero".into()));
        }
        if self.model.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("model.model must not be empty".into()));
        }
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError("agent.max_iterations must be > 0".into()));
        }
        if self.runner.only_n_most_recent_images == 0 {
            return Err(ConfigError::ValidationError(
                "runner.only_n_most_recent_images must be > 0".into(),
            ));
        }
        if self.computer.width == 0 || self.computer.height == 0 {
            return Err(ConfigError::ValidationError(
                "computer.width and computer.height must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: ModelConfig::default(),
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            agent: AgentConfig::default(),
            browser: BrowserConfig::default(),
            computer: ComputerConfig::default(),
            runner: RunnerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.provider, ApiProvider::Anthropic);
        assert_eq!(config.model.model, "claude-sonnet-4-20250514");
        assert_eq!(config.model.max_retries, 4);
        assert_eq!(config.browser.readiness_attempts, 10);
        assert_eq!(config.runner.tool_version, ToolVersion::ComputerUse20250124);
        assert!(config.runner.pause_after_completion);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.gateway.port, config.gateway.port);
        assert_eq!(parsed.runner.tool_version, config.runner.tool_version);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [model]
            provider = "bedrock"

            [agent]
            max_iterations = 12
            wall_clock_budget_secs = 900
            "#,
        )
        .unwrap();
        assert_eq!(parsed.model.provider, ApiProvider::Bedrock);
        assert_eq!(parsed.model.model, "claude-sonnet-4-20250514");
        assert_eq!(parsed.agent.max_iterations, 12);
        assert_eq!(parsed.agent.wall_clock_budget_secs, Some(900));
        assert_eq!(parsed.gateway.keepalive_interval_ms, 1000);
    }

    #[test]
    fn zero_iterations_rejected() {
        let mut config = AppConfig::default();
        config.agent.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.gateway.port, 8000);
    }

    #[test]
    fn invalid_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[gateway\nport = ").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ANTHROPIC_API_KEY", "sk-ant-test-key-0000000"),
            ("ANTHROPIC_MODEL", "claude-3-7-sonnet-20250219"),
            ("API_PROVIDER", "vertex"),
            ("TILT_PORT", "9100"),
            ("DISPLAY", ":99"),
            ("WIDTH", "1280"),
        ]);
        let mut config = AppConfig::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.api_key.as_deref(), Some("sk-ant-test-key-0000000"));
        assert_eq!(config.model.model, "claude-3-7-sonnet-20250219");
        assert_eq!(config.model.provider, ApiProvider::Vertex);
        assert_eq!(config.gateway.port, 9100);
        assert_eq!(config.computer.display, ":99");
        assert_eq!(config.computer.width, 1280);
    }

    #[test]
    fn bad_provider_env_is_ignored() {
        let mut config = AppConfig::default();
        config.apply_env(|k| (k == "API_PROVIDER").then(|| "openai".to_string()));
        assert_eq!(config.model.provider, ApiProvider::Anthropic);
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-ant-secret-value-123".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret-value"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("claude-sonnet-4-20250514"));
        assert!(toml_str.contains("8000"));
    }
}
