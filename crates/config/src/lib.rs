//! Configuration loading, validation, and management for Quill.
//!
//! Loads configuration from `~/.quill/config.toml` (or an explicit path)
//! with environment variable overrides. Validates all settings at startup.
//!
//! Every threshold the agent loop uses (token limit, compression threshold,
//! retention count, backup cadence) lives here rather than in code.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.quill/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the model endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used for turns, summaries and token estimation
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature for main turns
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max output tokens per main turn
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Directory under which project folders are created
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Iteration loop settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Token budget and compression settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Checkpoint settings
    #[serde(default)]
    pub backup: BackupConfig,
}

fn default_base_url() -> String {
    "https://api.moonshot.ai/v1".into()
}
fn default_model() -> String {
    "kimi-k2-thinking".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    65536
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
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
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("output_dir", &self.output_dir)
            .field("agent", &self.agent)
            .field("context", &self.context)
            .field("backup", &self.backup)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Hard cap on loop iterations per run
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Replace the built-in writing system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

fn default_max_iterations() -> u32 {
    300
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            system_prompt_override: None,
        }
    }
}

/// How the budget monitor counts tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMode {
    /// Ask the provider's token estimation endpoint
    #[default]
    Remote,
    /// Local character heuristic
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Absolute context size of the model
    #[serde(default = "default_token_limit")]
    pub token_limit: u64,

    /// Estimated size at which compression runs (must be below `token_limit`)
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: u64,

    /// Recent turns kept verbatim when compressing
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,

    #[serde(default)]
    pub estimation: EstimationMode,

    /// Timeout for one token estimation call
    #[serde(default = "default_estimate_timeout_secs")]
    pub estimate_timeout_secs: u64,

    /// Timeout for one summarization call
    #[serde(default = "default_summary_timeout_secs")]
    pub summary_timeout_secs: u64,

    /// Max output tokens for summaries
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

fn default_token_limit() -> u64 {
    200_000
}
fn default_compression_threshold() -> u64 {
    180_000
}
fn default_keep_recent() -> usize {
    10
}
fn default_estimate_timeout_secs() -> u64 {
    30
}
fn default_summary_timeout_secs() -> u64 {
    300
}
fn default_summary_max_tokens() -> u32 {
    4096
}

impl ContextConfig {
    pub fn estimate_timeout(&self) -> Duration {
        Duration::from_secs(self.estimate_timeout_secs)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs)
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_limit: default_token_limit(),
            compression_threshold: default_compression_threshold(),
            keep_recent: default_keep_recent(),
            estimation: EstimationMode::default(),
            estimate_timeout_secs: default_estimate_timeout_secs(),
            summary_timeout_secs: default_summary_timeout_secs(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding backup records and the emergency dump
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,

    /// Checkpoint every N iterations
    #[serde(default = "default_backup_interval")]
    pub interval: u32,

    /// Backup records retained, newest first
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}
fn default_backup_interval() -> u32 {
    50
}
fn default_keep_last() -> usize {
    5
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: default_backup_dir(),
            interval: default_backup_interval(),
            keep_last: default_keep_last(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.quill/config.toml).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(None)
    }

    /// Load configuration from `path` (or the default path), then apply
    /// environment variable overrides:
    /// - `QUILL_API_KEY`, `MOONSHOT_API_KEY`, `OPENAI_API_KEY` (first set wins,
    ///   only when the file has no key)
    /// - `QUILL_BASE_URL` / `MOONSHOT_BASE_URL`
    /// - `QUILL_MODEL`
    pub fn load_with(path: Option<&Path>) -> Result<Self, ConfigError> {
        let default_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(path.unwrap_or(&default_path))?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("QUILL_API_KEY")
                .ok()
                .or_else(|| std::env::var("MOONSHOT_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .filter(|k| !k.trim().is_empty());
        }

        if let Ok(url) =
            std::env::var("QUILL_BASE_URL").or_else(|_| std::env::var("MOONSHOT_BASE_URL"))
        {
            config.base_url = url;
        }

        if let Ok(model) = std::env::var("QUILL_MODEL") {
            config.model = model;
        }

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

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".quill")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.context.compression_threshold >= self.context.token_limit {
            return Err(ConfigError::ValidationError(format!(
                "context.compression_threshold ({}) must be below context.token_limit ({})",
                self.context.compression_threshold, self.context.token_limit
            )));
        }

        if self.context.keep_recent == 0 {
            return Err(ConfigError::ValidationError(
                "context.keep_recent must be at least 1".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.backup.interval == 0 || self.backup.keep_last == 0 {
            return Err(ConfigError::ValidationError(
                "backup.interval and backup.keep_last must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
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
            base_url: default_base_url(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            output_dir: default_output_dir(),
            agent: AgentSettings::default(),
            context: ContextConfig::default(),
            backup: BackupConfig::default(),
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
