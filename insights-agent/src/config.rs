// ABOUTME: Configuration file support for insights.
// ABOUTME: Loads backend config from TOML with [backend], [session] and [logging] sections.

use crate::options::{PermissionMode, ReasoningEffort, SessionOptions};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_LOG_FILTER: &str = "info,insights_agent=debug";

/// Top-level configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionDefaults,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend configuration with type discriminator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type: "cli", "app-server", "acp", "mock"
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Remaining fields passed to backend factory
    #[serde(flatten)]
    pub config: toml::Table,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: "cli".to_string(),
            config: toml::Table::new(),
        }
    }
}

/// Defaults applied to every session the front-end starts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDefaults {
    pub cwd: Option<PathBuf>,
    pub model: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default)]
    pub include_partial_messages: bool,
    #[serde(default)]
    pub include_raw_events: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// tracing EnvFilter directive, overridden by RUST_LOG
    #[serde(default = "default_filter")]
    pub filter: String,
}

fn default_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config TOML")
    }
}

impl BackendConfig {
    /// Get backend type name
    pub fn backend_type(&self) -> &str {
        &self.backend_type
    }

    /// Convert config table to serde_json::Value for registry
    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_else(|_| serde_json::json!({}))
    }
}

impl SessionDefaults {
    pub fn to_options(&self) -> SessionOptions {
        SessionOptions {
            model: self.model.clone(),
            permission_mode: self.permission_mode,
            reasoning_effort: self.reasoning_effort,
            include_partial_messages: self.include_partial_messages,
            include_raw_events: self.include_raw_events,
            ..SessionOptions::default()
        }
    }
}
