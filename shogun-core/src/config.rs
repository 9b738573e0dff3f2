//! Coordinator configuration.
//!
//! Loaded from `{workspace}/.shogun/config/config.json`. Missing file
//! or missing sections fall back to defaults; `baseDir` and
//! `historyDir` are resolved against the workspace root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Default ashigaru fleet width.
pub const DEFAULT_ASHIGARU_COUNT: u8 = 5;

/// Default transport port for the UI surface.
pub const DEFAULT_SERVER_PORT: u16 = 3789;

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-role model selection. `default` applies when a role override is
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsConfig {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub shogun: Option<String>,
    #[serde(default)]
    pub karou: Option<String>,
    #[serde(default)]
    pub ashigaru: Option<String>,
}

impl ModelsConfig {
    /// The model for a role, falling back to the default.
    pub fn for_role(&self, role: crate::types::Role) -> Option<&str> {
        let specific = match role {
            crate::types::Role::Shogun => self.shogun.as_deref(),
            crate::types::Role::Karou => self.karou.as_deref(),
            crate::types::Role::Ashigaru => self.ashigaru.as_deref(),
            crate::types::Role::King => None,
        };
        specific.or(self.default.as_deref())
    }
}

/// Opaque provider-specific settings passed through to the provider
/// adapter unmodified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpecificConfig {
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub additional_directories: Vec<PathBuf>,
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    DEFAULT_SERVER_PORT
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: DEFAULT_SERVER_PORT }
    }
}

/// Full configuration surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    #[serde(default = "default_ashigaru_count")]
    pub ashigaru_count: u8,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub provider_specific: ProviderSpecificConfig,
    /// Free-form per-ashigaru persona text keyed by agent id
    /// (`ashigaru1`, ...). Injected into the composed system prompt.
    #[serde(default)]
    pub ashigaru_profiles: BTreeMap<String, String>,
    #[serde(default)]
    pub server: ServerConfig,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from(".shogun")
}

fn default_history_dir() -> PathBuf {
    PathBuf::from(".shogun/history")
}

fn default_ashigaru_count() -> u8 {
    DEFAULT_ASHIGARU_COUNT
}

fn default_provider() -> String {
    "scripted".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            history_dir: default_history_dir(),
            ashigaru_count: default_ashigaru_count(),
            provider: default_provider(),
            models: ModelsConfig::default(),
            provider_specific: ProviderSpecificConfig::default(),
            ashigaru_profiles: BTreeMap::new(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Conventional location of the config file under a workspace.
    pub fn conventional_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(".shogun").join("config").join("config.json")
    }

    /// Load configuration from the conventional location, falling back
    /// to defaults when the file is absent.
    pub fn load(workspace_root: &Path) -> Result<Self, ConfigError> {
        let path = Self::conventional_path(workspace_root);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?
        } else {
            Self::default()
        };
        config.resolve_paths(workspace_root);
        Ok(config)
    }

    /// Resolve relative directories against the workspace root.
    pub fn resolve_paths(&mut self, workspace_root: &Path) {
        if self.base_dir.is_relative() {
            self.base_dir = workspace_root.join(&self.base_dir);
        }
        if self.history_dir.is_relative() {
            self.history_dir = workspace_root.join(&self.history_dir);
        }
    }
}
