//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::session::{Mask, ModelConfig};

/// Root configuration for parley
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Global default generation and memory settings
    #[serde(default)]
    pub model: ModelConfig,
    /// Application behavior
    #[serde(default)]
    pub app: AppConfig,
    /// Model backend connection
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Where session state is persisted
    #[serde(default)]
    pub storage: StorageConfig,
    /// Named configuration overlays for new sessions
    #[serde(default)]
    pub masks: Vec<Mask>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Look up a mask by name (case-insensitive)
    pub fn find_mask(&self, name: &str) -> Option<&Mask> {
        self.masks
            .iter()
            .find(|mask| mask.name.eq_ignore_ascii_case(name))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            overrides: HashMap::new(),
        }
    }
}

/// Application-level switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Derive a session topic from the conversation once it is long enough
    #[serde(default = "default_true")]
    pub enable_auto_generate_title: bool,
    /// Cheaper model used for titles and digests when the backend offers it
    #[serde(default = "default_summarize_model")]
    pub summarize_model: String,
    /// Locale passed to prompt templates
    #[serde(default = "default_lang")]
    pub lang: String,
}

fn default_true() -> bool {
    true
}

fn default_summarize_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_lang() -> String {
    "en".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            enable_auto_generate_title: true,
            summarize_model: default_summarize_model(),
            lang: default_lang(),
        }
    }
}

/// Model backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Bearer token, if the backend needs one
    #[serde(default)]
    pub api_key: String,
    /// Human-readable provider name used in prompt templates
    #[serde(default = "default_provider_name")]
    pub provider_name: String,
    /// Token quota reported by `usage` (0 = unknown)
    #[serde(default)]
    pub quota_tokens: u64,
}

fn default_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_provider_name() -> String {
    "OpenAI".to_string()
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            api_key: String::new(),
            provider_name: default_provider_name(),
            quota_tokens: 0,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the persisted chat state
    #[serde(default = "default_storage_dir")]
    pub dir: String,
}

fn default_storage_dir() -> String {
    "~/.parley/data".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

impl StorageConfig {
    /// Storage directory with a leading `~` expanded
    pub fn resolved_dir(&self) -> std::path::PathBuf {
        match self.dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| std::path::PathBuf::from(rest)),
            None => std::path::PathBuf::from(&self.dir),
        }
    }
}
