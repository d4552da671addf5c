//! Configuration loading for agent-relay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::protocol::{AgentInfo, BudgetDefaults};

/// Get the agent-relay home directory (~/.agent-relay).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agent-relay"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("relay.json"))
}

/// Load settings from ~/.agent-relay/relay.json
pub fn load_settings() -> Result<Settings> {
    load_settings_from(&get_settings_path()?)
}

/// Load and validate settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.budget.max_hops == 0 {
        return Err(Error::Config("budget.maxHops must be greater than 0".to_string()));
    }
    if settings.budget.ttl_secs <= 0 {
        return Err(Error::Config("budget.ttlSecs must be greater than 0".to_string()));
    }
    if settings.runtime.max_concurrent == 0 {
        return Err(Error::Config(
            "runtime.maxConcurrent must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Read the adapter list. A missing file means no adapters.
pub fn load_adapter_configs(path: &Path) -> Result<Vec<AdapterConfig>> {
    if !path.exists() {
        tracing::info!("No adapter file at {}, starting without adapters", path.display());
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    let configs: Vec<AdapterConfig> = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Invalid adapter file {}: {}", path.display(), e))
    })?;
    tracing::debug!("Loaded {} adapter entries from {}", configs.len(), path.display());
    Ok(configs)
}

/// Where an external plugin executable comes from.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginSource {
    /// Executable name looked up on `PATH`.
    pub package: Option<String>,
    /// Executable path, relative to the adapter file's directory.
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One entry of `adapters.json`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub adapter_type: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub builtin: bool,
    #[serde(default, alias = "pluginSource")]
    pub plugin: Option<PluginSource>,
    #[serde(default)]
    pub config: Value,
}

fn default_enabled() -> bool {
    true
}

/// Agent runtime configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub default_cwd: Option<PathBuf>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
}

fn default_provider() -> String {
    "claude".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_timeout_secs() -> u64 {
    300
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            default_cwd: None,
            max_concurrent: default_max_concurrent(),
            default_timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

/// agent-relay settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Store root; defaults to `~/.agent-relay/data`.
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub budget: BudgetDefaults,

    /// Adapter list; defaults to `~/.agent-relay/adapters.json`.
    pub adapters_file: Option<PathBuf>,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Subject -> agent table for adapter context enrichment.
    #[serde(default)]
    pub agents: HashMap<String, AgentInfo>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: None,
            budget: BudgetDefaults::default(),
            adapters_file: None,
            runtime: RuntimeSettings::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            agents: HashMap::new(),
        }
    }
}

impl Settings {
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_home_dir()?.join("data")),
        }
    }

    pub fn adapters_file(&self) -> Result<PathBuf> {
        match &self.adapters_file {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("adapters.json")),
        }
    }
}
