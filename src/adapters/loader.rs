//! Turns `adapters.json` entries into live adapters.
//!
//! Builtin entries are built by a factory keyed on `type`. Plugin entries
//! spawn an external executable. One bad entry never stops the others from
//! loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;

use super::plugin::ProcessAdapter;
use super::runtime_agent::{RuntimeAgentAdapter, RuntimeAgentConfig};
use super::telegram::{TelegramAdapter, TelegramConfig};
use super::webhook::{WebhookAdapter, WebhookConfig};
use super::RelayAdapter;
use crate::config::{AdapterConfig, PluginSource};
use crate::error::{Error, Result};
use crate::runtime::{AgentRuntime, RunTracker};
use crate::store::TraceStore;

pub type AdapterFactory =
    Box<dyn Fn(&AdapterConfig) -> Result<Arc<dyn RelayAdapter>> + Send + Sync>;

/// Factories for in-process adapters, keyed by adapter `type`.
#[derive(Default)]
pub struct BuiltinAdapters {
    factories: HashMap<String, AdapterFactory>,
}

impl std::fmt::Debug for BuiltinAdapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.factories.keys().collect();
        types.sort();
        f.debug_struct("BuiltinAdapters").field("types", &types).finish()
    }
}

impl BuiltinAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock set: `runtime-agent` (when a runtime is available),
    /// `webhook` and `telegram`.
    pub fn standard(
        runtime: Option<Arc<dyn AgentRuntime>>,
        tracker: Option<Arc<dyn RunTracker>>,
        traces: Option<Arc<TraceStore>>,
    ) -> Self {
        let mut builtins = Self::new();

        builtins.register("runtime-agent", move |entry| {
            let runtime = runtime
                .clone()
                .ok_or_else(|| Error::Config("no agent runtime configured".to_string()))?;
            let config: RuntimeAgentConfig = parse_config(entry)?;
            let adapter = RuntimeAgentAdapter::new(entry.id.clone(), runtime, config)
                .with_tracker(tracker.clone())
                .with_traces(traces.clone());
            Ok(Arc::new(adapter) as Arc<dyn RelayAdapter>)
        });

        builtins.register("webhook", |entry| {
            let config: WebhookConfig = parse_config(entry)?;
            Ok(Arc::new(WebhookAdapter::new(entry.id.clone(), config)?) as Arc<dyn RelayAdapter>)
        });

        builtins.register("telegram", |entry| {
            let config: TelegramConfig = parse_config(entry)?;
            Ok(Arc::new(TelegramAdapter::new(entry.id.clone(), &config)?) as Arc<dyn RelayAdapter>)
        });

        builtins
    }

    pub fn register<F>(&mut self, adapter_type: impl Into<String>, factory: F)
    where
        F: Fn(&AdapterConfig) -> Result<Arc<dyn RelayAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(adapter_type.into(), Box::new(factory));
    }

    pub fn contains(&self, adapter_type: &str) -> bool {
        self.factories.contains_key(adapter_type)
    }

    fn build(&self, entry: &AdapterConfig) -> Result<Arc<dyn RelayAdapter>> {
        let factory = self.factories.get(&entry.adapter_type).ok_or_else(|| {
            Error::Config(format!("unknown builtin adapter type '{}'", entry.adapter_type))
        })?;
        factory(entry)
    }
}

/// Deserialize an entry's `config` block; an absent block means all defaults.
fn parse_config<T: serde::de::DeserializeOwned>(entry: &AdapterConfig) -> Result<T> {
    let value = if entry.config.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        entry.config.clone()
    };
    serde_json::from_value(value)
        .map_err(|e| Error::Config(format!("adapter '{}' config: {}", entry.id, e)))
}

/// An entry that could not be loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadFailure {
    pub id: String,
    pub reason: String,
}

/// Result of loading an adapter list.
#[derive(Default)]
pub struct LoadedAdapters {
    pub adapters: Vec<Arc<dyn RelayAdapter>>,
    pub failures: Vec<LoadFailure>,
}

impl std::fmt::Debug for LoadedAdapters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.adapters.iter().map(|a| a.id()).collect();
        f.debug_struct("LoadedAdapters")
            .field("adapters", &ids)
            .field("failures", &self.failures)
            .finish()
    }
}

/// Load every enabled entry. Failures are logged and collected, never raised.
pub async fn load_adapters(
    configs: &[AdapterConfig],
    builtins: &BuiltinAdapters,
    config_dir: &Path,
) -> LoadedAdapters {
    let mut loaded = LoadedAdapters::default();

    for entry in configs {
        if !entry.enabled {
            tracing::debug!("Skipping disabled adapter '{}'", entry.id);
            continue;
        }

        match load_one(entry, builtins, config_dir).await {
            Ok(adapter) => {
                tracing::info!(
                    "Loaded adapter '{}' ({}) for {:?}",
                    adapter.id(),
                    entry.adapter_type,
                    adapter.subject_prefixes()
                );
                loaded.adapters.push(adapter);
            }
            Err(e) => {
                let reason = match e {
                    Error::PluginLoad { reason, .. } => reason,
                    other => other.to_string(),
                };
                tracing::error!("Failed to load adapter '{}': {}", entry.id, reason);
                loaded.failures.push(LoadFailure {
                    id: entry.id.clone(),
                    reason,
                });
            }
        }
    }

    loaded
}

async fn load_one(
    entry: &AdapterConfig,
    builtins: &BuiltinAdapters,
    config_dir: &Path,
) -> Result<Arc<dyn RelayAdapter>> {
    if !valid_id(&entry.id) {
        return Err(Error::plugin_load(
            &entry.id,
            "id must be alphanumeric with '-' or '_'",
        ));
    }

    if entry.builtin {
        return builtins.build(entry);
    }

    let Some(source) = &entry.plugin else {
        if builtins.contains(&entry.adapter_type) {
            return builtins.build(entry);
        }
        return Err(Error::plugin_load(
            &entry.id,
            "entry is neither builtin nor has a plugin source",
        ));
    };

    let program = resolve_program(&entry.id, source, config_dir)?;
    let adapter = ProcessAdapter::spawn(&entry.id, &program, &source.args, &entry.config).await?;
    Ok(Arc::new(adapter))
}

static ID_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn valid_id(id: &str) -> bool {
    ID_PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(id))
}

fn resolve_program(id: &str, source: &PluginSource, config_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = &source.path {
        let resolved = if path.is_absolute() {
            path.clone()
        } else {
            config_dir.join(path)
        };
        if !resolved.is_file() {
            return Err(Error::plugin_load(
                id,
                format!("plugin not found at {}", resolved.display()),
            ));
        }
        return Ok(resolved);
    }

    if let Some(package) = &source.package {
        return find_on_path(package)
            .ok_or_else(|| Error::plugin_load(id, format!("'{}' not found on PATH", package)));
    }

    Err(Error::plugin_load(id, "plugin source needs a package or path"))
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entries(value: serde_json::Value) -> Vec<AdapterConfig> {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_bad_entry_does_not_stop_others() {
        let temp_dir = tempfile::tempdir().unwrap();
        let configs = entries(json!([
            {"id": "ci", "type": "webhook", "builtin": true,
             "config": {"url": "http://127.0.0.1:9/ci", "subjectPrefix": "relay.webhook.ci."}},
            {"id": "bogus", "type": "carrier-pigeon", "builtin": true},
            {"id": "ops", "type": "webhook", "builtin": true,
             "config": {"url": "http://127.0.0.1:9/ops", "subjectPrefix": "relay.webhook.ops."}}
        ]));

        let loaded = load_adapters(&configs, &BuiltinAdapters::standard(None, None, None), temp_dir.path()).await;

        let ids: Vec<&str> = loaded.adapters.iter().map(|a| a.id()).collect();
        assert_eq!(ids, vec!["ci", "ops"]);
        assert_eq!(loaded.failures.len(), 1);
        assert_eq!(loaded.failures[0].id, "bogus");
        assert!(loaded.failures[0].reason.contains("carrier-pigeon"));
    }

    #[tokio::test]
    async fn test_disabled_entries_skipped() {
        let temp_dir = tempfile::tempdir().unwrap();
        let configs = entries(json!([
            {"id": "off", "type": "carrier-pigeon", "builtin": true, "enabled": false}
        ]));

        let loaded = load_adapters(&configs, &BuiltinAdapters::new(), temp_dir.path()).await;
        assert!(loaded.adapters.is_empty());
        assert!(loaded.failures.is_empty());
    }

    #[tokio::test]
    async fn test_runtime_agent_needs_runtime() {
        let temp_dir = tempfile::tempdir().unwrap();
        let configs = entries(json!([
            {"id": "agents", "type": "runtime-agent", "builtin": true}
        ]));

        let loaded = load_adapters(&configs, &BuiltinAdapters::standard(None, None, None), temp_dir.path()).await;
        assert!(loaded.adapters.is_empty());
        assert!(loaded.failures[0].reason.contains("no agent runtime"));
    }

    #[tokio::test]
    async fn test_missing_plugin_path_is_failure() {
        let temp_dir = tempfile::tempdir().unwrap();
        let configs = entries(json!([
            {"id": "ext", "type": "plugin", "plugin": {"path": "bin/missing-plugin"}},
            {"id": "pkg", "type": "plugin", "plugin": {"package": "agent-relay-no-such-plugin"}}
        ]));

        let loaded = load_adapters(&configs, &BuiltinAdapters::new(), temp_dir.path()).await;
        assert!(loaded.adapters.is_empty());
        assert_eq!(loaded.failures.len(), 2);
        assert!(loaded.failures[0].reason.contains("plugin not found"));
        assert!(loaded.failures[1].reason.contains("not found on PATH"));
    }

    #[test]
    fn test_id_validation() {
        assert!(valid_id("telegram-main"));
        assert!(valid_id("ci_2"));
        assert!(!valid_id(""));
        assert!(!valid_id("-lead"));
        assert!(!valid_id("has space"));
        assert!(!valid_id("../escape"));
        assert!(!valid_id("dotted.id"));
        assert!(ID_PATTERN.get().is_some_and(|re| re.is_some()));
        assert!(valid_id("telegram-main"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plugin_with_bad_manifest_fails() {
        let temp_dir = tempfile::tempdir().unwrap();
        let script = temp_dir.path().join("half.sh");
        std::fs::write(
            &script,
            r#"read -r line
printf '{"jsonrpc":"2.0","id":1,"result":{"id":"half","subjectPrefix":"relay.half.","methods":["start","deliver"]}}\n'
"#,
        )
        .unwrap();

        let configs = entries(json!([
            {"id": "half", "type": "plugin",
             "plugin": {"package": "sh", "args": [script.display().to_string()]}}
        ]));

        let loaded = load_adapters(&configs, &BuiltinAdapters::new(), temp_dir.path()).await;
        assert!(loaded.adapters.is_empty());
        assert!(loaded.failures[0].reason.contains("methods: missing stop, getStatus"));
    }
}
