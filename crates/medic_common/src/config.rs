//! Medic Configuration
//!
//! Configuration lives in `<config_dir>/medic/config.toml`.
//! Every field is optional; a missing file means defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "medic";
const CONFIG_FILE: &str = "config.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Reasoning service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_endpoint() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_model() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

fn default_api_key_env() -> String {
    "MEDIC_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_request_timeout() -> u64 {
    90
}

impl Default for ReasoningSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ReasoningSettings {
    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// Conversation loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Hard ceiling on service round-trips per chat (valid: 3-50)
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Wall-clock budget per chat
    #[serde(default = "default_budget")]
    pub budget_secs: u64,
}

fn default_max_iterations() -> usize {
    10
}

fn default_budget() -> u64 {
    600 // 10 minutes
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            budget_secs: default_budget(),
        }
    }
}

impl SessionSettings {
    pub fn effective_max_iterations(&self) -> usize {
        self.max_iterations.clamp(3, 50)
    }

    pub fn budget(&self) -> Duration {
        Duration::from_secs(self.budget_secs.max(1))
    }
}

/// Tool dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Timeout for ad-hoc diagnostic commands and command collectors
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Findings kept per tool summary
    #[serde(default = "default_max_findings")]
    pub max_findings: usize,
}

fn default_command_timeout() -> u64 {
    60
}

fn default_max_findings() -> usize {
    5
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
            max_findings: default_max_findings(),
        }
    }
}

impl ToolSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}

/// Fix execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSettings {
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

fn default_step_timeout() -> u64 {
    300 // 5 minutes per command
}

impl Default for FixSettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
        }
    }
}

impl FixSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }
}

/// Command collector overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// `"<collector>.<action>" = "<read-only command>"`
    #[serde(default)]
    pub commands: BTreeMap<String, String>,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedicConfig {
    #[serde(default)]
    pub reasoning: ReasoningSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub tools: ToolSettings,

    #[serde(default)]
    pub fix: FixSettings,

    #[serde(default)]
    pub collectors: CollectorSettings,
}

impl MedicConfig {
    /// Default config path (`~/.config/medic/config.toml` on Linux)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load from `path`, or the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&content).map_err(|message| ConfigError::Parse { path, message })
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }
}
