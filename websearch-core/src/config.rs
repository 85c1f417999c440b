//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/websearch/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/websearch/` (~/.config/websearch/)
//! - Data: `$XDG_DATA_HOME/websearch/` (~/.local/share/websearch/)
//! - State/Logs: `$XDG_STATE_HOME/websearch/` (~/.local/state/websearch/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable holding the platform secret when not set in config.
pub const SECRET_ENV_VAR: &str = "TRIGGER_SECRET_KEY";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Remote task platform connection
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Defaults applied to every triggered search
    #[serde(default)]
    pub search: SearchDefaults,

    /// Local history limits
    #[serde(default)]
    pub history: HistoryConfig,

    /// Reconciliation retry policy
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Live run monitoring
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote task platform configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    /// Platform API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Server-held secret; falls back to `TRIGGER_SECRET_KEY`
    pub secret_key: Option<String>,

    /// Identifier of the task to trigger
    #[serde(default = "default_task_id")]
    pub task_id: String,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Lifetime of scoped access tokens in hours
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            secret_key: None,
            task_id: default_task_id(),
            timeout_secs: default_timeout(),
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}

impl PlatformConfig {
    /// The secret from config, or from the environment when unset.
    pub fn secret(&self) -> Option<String> {
        self.secret_key
            .clone()
            .or_else(|| std::env::var(SECRET_ENV_VAR).ok())
            .filter(|s| !s.trim().is_empty())
    }

    /// Returns the secret or a configuration error naming what is missing.
    pub fn require_secret(&self) -> Result<String> {
        self.secret().ok_or_else(|| {
            Error::Config(format!(
                "{} not set (platform.secret_key or environment)",
                SECRET_ENV_VAR
            ))
        })
    }

    /// Check if the platform is configured well enough to make remote calls
    pub fn is_ready(&self) -> bool {
        !self.api_url.trim().is_empty() && self.secret().is_some()
    }
}

fn default_api_url() -> String {
    "https://api.trigger.dev".to_string()
}

fn default_task_id() -> String {
    "websearch-agent".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_token_ttl_hours() -> u64 {
    24
}

/// Search parameters used when the caller does not override them
#[derive(Debug, Deserialize, Clone)]
pub struct SearchDefaults {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_model")]
    pub write_model: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_depth")]
    pub search_depth: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default = "default_depth")]
    pub extract_depth: String,
    #[serde(default)]
    pub include_images: bool,
}

impl Default for SearchDefaults {
    fn default() -> Self {
        Self {
            model: default_model(),
            write_model: default_model(),
            max_iterations: default_max_iterations(),
            search_depth: default_depth(),
            topic: default_topic(),
            max_results: default_max_results(),
            extract_depth: default_depth(),
            include_images: false,
        }
    }
}

impl SearchDefaults {
    /// Model to use, honoring `WEBSEARCH_DEFAULT_MODEL`
    pub fn effective_model(&self) -> String {
        std::env::var("WEBSEARCH_DEFAULT_MODEL").unwrap_or_else(|_| self.model.clone())
    }

    /// Write model to use, honoring `WEBSEARCH_DEFAULT_WRITE_MODEL`
    pub fn effective_write_model(&self) -> String {
        std::env::var("WEBSEARCH_DEFAULT_WRITE_MODEL")
            .unwrap_or_else(|_| self.write_model.clone())
    }
}

fn default_model() -> String {
    "openai/gpt-4.1-mini".to_string()
}

fn default_max_iterations() -> u32 {
    10
}

fn default_depth() -> String {
    "advanced".to_string()
}

fn default_topic() -> String {
    "general".to_string()
}

fn default_max_results() -> u32 {
    7
}

/// Local history configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    /// Maximum number of entries kept
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Total bytes the key/value store may hold
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            quota_bytes: default_quota_bytes(),
        }
    }
}

fn default_max_entries() -> usize {
    50
}

fn default_quota_bytes() -> usize {
    5 * 1024 * 1024
}

/// Token issuance retry policy used during reconciliation
#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    /// Delay after the first failed token issuance
    #[serde(default = "default_token_retry_base")]
    pub token_retry_base_secs: u64,

    /// Upper bound on the backoff delay
    #[serde(default = "default_token_retry_max")]
    pub token_retry_max_secs: u64,

    /// Consecutive failures before automatic attempts stop
    #[serde(default = "default_max_token_attempts")]
    pub max_token_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            token_retry_base_secs: default_token_retry_base(),
            token_retry_max_secs: default_token_retry_max(),
            max_token_attempts: default_max_token_attempts(),
        }
    }
}

fn default_token_retry_base() -> u64 {
    30
}

fn default_token_retry_max() -> u64 {
    900
}

fn default_max_token_attempts() -> u32 {
    5
}

/// Live monitor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Poll interval for the run subscription in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_poll_interval() -> u64 {
    1000
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/websearch/config.toml` (~/.config/websearch/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("websearch").join("config.toml")
    }

    /// Returns the data directory path
    ///
    /// `$XDG_DATA_HOME/websearch/` (~/.local/share/websearch/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("websearch")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/websearch/` (~/.local/state/websearch/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("websearch")
    }

    /// Returns the key/value storage file path
    ///
    /// `$XDG_DATA_HOME/websearch/storage.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("storage.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/websearch/websearch.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("websearch.log")
    }

    /// Ensure XDG base directory environment variables are set.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
