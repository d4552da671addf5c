//! External adapter plugins.
//!
//! A plugin is an executable that speaks newline-delimited JSON-RPC 2.0 on
//! stdin/stdout. The relay calls:
//! - `describe(config)` once after spawn; must return the manifest
//! - `start`, `stop`, `getStatus`
//! - `deliver({subject, envelope, context})`; must return a `DeliveryResult`
//!
//! The manifest is checked member by member before the plugin is registered.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{
    elapsed_ms, AdapterState, AdapterStatus, RelayAdapter, RelayPublisher, StatusCell,
};
use crate::error::{Error, Result};
use crate::protocol::{AdapterContext, DeliveryResult, Envelope};

/// Methods every plugin must implement.
pub const REQUIRED_METHODS: [&str; 4] = ["start", "stop", "deliver", "getStatus"];

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Validated plugin self-description.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub subject_prefixes: Vec<String>,
    pub methods: Vec<String>,
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Check a `describe` result structurally. Every problem is reported, one
/// per manifest member.
pub fn validate_manifest(plugin_id: &str, manifest: &Value) -> Result<PluginManifest> {
    let Some(obj) = manifest.as_object() else {
        return Err(Error::plugin_load(plugin_id, "manifest must be a JSON object"));
    };
    let mut problems = Vec::new();

    let id = match obj.get("id") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(_) => {
            problems.push("id: must be a non-empty string".to_string());
            None
        }
        None => {
            problems.push("id: missing".to_string());
            None
        }
    };

    let subject_prefixes = match obj.get("subjectPrefix") {
        Some(Value::String(s)) if !s.is_empty() => Some(vec![s.clone()]),
        Some(Value::Array(items)) => {
            let prefixes: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if prefixes.is_empty() || prefixes.len() != items.len() {
                problems.push("subjectPrefix: list must contain only non-empty strings".to_string());
                None
            } else {
                Some(prefixes)
            }
        }
        Some(_) => {
            problems.push("subjectPrefix: must be a string or list of strings".to_string());
            None
        }
        None => {
            problems.push("subjectPrefix: missing".to_string());
            None
        }
    };

    let methods = match obj.get("methods") {
        Some(Value::Array(items)) => {
            let methods: Vec<String> = items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            let missing: Vec<&str> = REQUIRED_METHODS
                .iter()
                .copied()
                .filter(|m| !methods.iter().any(|have| have == m))
                .collect();
            if missing.is_empty() {
                Some(methods)
            } else {
                problems.push(format!("methods: missing {}", missing.join(", ")));
                None
            }
        }
        Some(_) => {
            problems.push("methods: must be a list of method names".to_string());
            None
        }
        None => {
            problems.push("methods: missing".to_string());
            None
        }
    };

    match (id, subject_prefixes, methods) {
        (Some(id), Some(subject_prefixes), Some(methods)) if problems.is_empty() => {
            Ok(PluginManifest {
                id,
                subject_prefixes,
                methods,
                name: obj.get("name").and_then(Value::as_str).map(str::to_string),
                version: obj.get("version").and_then(Value::as_str).map(str::to_string),
            })
        }
        _ => Err(Error::plugin_load(plugin_id, problems.join("; "))),
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

/// Request/response channel to one plugin process.
struct RpcChannel {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl RpcChannel {
    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let mut line = serde_json::to_string(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Err(Error::Delivery("plugin closed its stdout".to_string()));
            };
            if line.trim().is_empty() {
                continue;
            }
            let response: RpcResponse = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!("Ignoring non-RPC plugin output ({}): {}", e, line);
                    continue;
                }
            };
            if response.id != Some(id) {
                continue;
            }
            if let Some(error) = response.error {
                return Err(Error::Delivery(format!(
                    "{} failed ({}): {}",
                    method, error.code, error.message
                )));
            }
            return Ok(response.result.unwrap_or(Value::Null));
        }
    }
}

/// Adapter backed by an external plugin process.
pub struct ProcessAdapter {
    manifest: PluginManifest,
    channel: Mutex<RpcChannel>,
    child: Mutex<Child>,
    status: StatusCell,
}

impl ProcessAdapter {
    /// Spawn `program`, describe it and validate the manifest.
    pub async fn spawn(
        config_id: &str,
        program: &Path,
        args: &[String],
        config: &Value,
    ) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::plugin_load(config_id, format!("cannot spawn {}: {}", program.display(), e))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(Error::plugin_load(config_id, "plugin stdio unavailable"));
        };
        let mut channel = RpcChannel {
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 0,
        };

        let described = tokio::time::timeout(RPC_TIMEOUT, channel.call("describe", config.clone()))
            .await
            .map_err(|_| Error::plugin_load(config_id, "describe timed out"))?
            .map_err(|e| Error::plugin_load(config_id, format!("describe failed: {}", e)))?;
        let manifest = validate_manifest(config_id, &described)?;

        tracing::info!(
            "Loaded plugin '{}' ({}) from {}",
            manifest.id,
            manifest.version.as_deref().unwrap_or("unversioned"),
            program.display()
        );

        Ok(Self {
            manifest,
            channel: Mutex::new(channel),
            child: Mutex::new(child),
            status: StatusCell::new(),
        })
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let mut channel = self.channel.lock().await;
        tokio::time::timeout(RPC_TIMEOUT, channel.call(method, params))
            .await
            .map_err(|_| Error::Delivery(format!("{} timed out", method)))?
    }

    /// Ask the plugin for its own status report.
    pub async fn remote_status(&self) -> Result<Value> {
        self.call("getStatus", json!({})).await
    }
}

#[async_trait]
impl RelayAdapter for ProcessAdapter {
    fn id(&self) -> &str {
        &self.manifest.id
    }

    fn subject_prefixes(&self) -> Vec<String> {
        self.manifest.subject_prefixes.clone()
    }

    async fn start(&self, _relay: Arc<dyn RelayPublisher>) -> Result<()> {
        self.status.set_state(AdapterState::Starting);
        if let Err(e) = self.call("start", json!({})).await {
            self.status.set_state(AdapterState::Error);
            self.status.record_error(e.to_string());
            return Err(e);
        }
        self.status.set_state(AdapterState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.status.set_state(AdapterState::Stopping);
        if let Err(e) = self.call("stop", json!({})).await {
            tracing::warn!("Plugin '{}' stop failed: {}", self.manifest.id, e);
        }
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::debug!("Plugin '{}' already exited: {}", self.manifest.id, e);
        }
        self.status.set_state(AdapterState::Stopped);
        Ok(())
    }

    async fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        context: Option<&AdapterContext>,
    ) -> DeliveryResult {
        let started = Instant::now();
        self.status.record_in();

        let params = json!({
            "subject": subject,
            "envelope": envelope,
            "context": context,
        });
        let result = match self.call("deliver", params).await {
            Ok(value) => serde_json::from_value::<DeliveryResult>(value).unwrap_or_else(|e| {
                DeliveryResult::failed(format!("invalid deliver result: {}", e), elapsed_ms(started))
            }),
            Err(e) => DeliveryResult::failed(e.to_string(), elapsed_ms(started)),
        };

        if result.success {
            self.status.record_out();
        } else {
            self.status
                .record_error(result.error.clone().unwrap_or_else(|| "delivery failed".to_string()));
        }
        result
    }

    fn status(&self) -> AdapterStatus {
        self.status.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Value {
        json!({
            "id": "echo",
            "subjectPrefix": "relay.echo.",
            "methods": ["start", "stop", "deliver", "getStatus"],
            "version": "1.2.0"
        })
    }

    #[test]
    fn test_valid_manifest() {
        let m = validate_manifest("cfg", &manifest()).unwrap();
        assert_eq!(m.id, "echo");
        assert_eq!(m.subject_prefixes, vec!["relay.echo.".to_string()]);
        assert_eq!(m.version.as_deref(), Some("1.2.0"));
    }

    #[test]
    fn test_prefix_list_accepted() {
        let mut value = manifest();
        value["subjectPrefix"] = json!(["relay.a.", "relay.b."]);
        assert_eq!(validate_manifest("cfg", &value).unwrap().subject_prefixes.len(), 2);
    }

    #[test]
    fn test_each_bad_member_reported() {
        let value = json!({"id": 7, "methods": ["start", "deliver"]});
        let err = validate_manifest("broken", &value).unwrap_err();
        let Error::PluginLoad { id, reason } = err else {
            panic!("unexpected error kind");
        };
        assert_eq!(id, "broken");
        assert!(reason.contains("id: must be a non-empty string"));
        assert!(reason.contains("subjectPrefix: missing"));
        assert!(reason.contains("methods: missing stop, getStatus"));
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(validate_manifest("x", &json!("nope")).is_err());
    }

    /// Minimal plugin in POSIX sh. Requests are serialized with `jsonrpc`
    /// first, so the id is the first number in the line.
    #[cfg(unix)]
    const ECHO_PLUGIN: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"describe"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"id":"echo","subjectPrefix":"relay.echo.","methods":["start","stop","deliver","getStatus"]}}\n' "$id" ;;
    *'"method":"deliver"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"success":true,"durationMs":1}}\n' "$id" ;;
    *'"method":"getStatus"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"healthy":true}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id" ;;
  esac
done
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_plugin_roundtrip() {
        use crate::protocol::EnvelopeBuilder;

        let temp_dir = tempfile::tempdir().unwrap();
        let script = temp_dir.path().join("echo.sh");
        std::fs::write(&script, ECHO_PLUGIN).unwrap();

        let adapter = ProcessAdapter::spawn(
            "echo-cfg",
            Path::new("sh"),
            &[script.display().to_string()],
            &json!({}),
        )
        .await
        .unwrap();
        assert_eq!(adapter.id(), "echo");
        assert_eq!(adapter.subject_prefixes(), vec!["relay.echo.".to_string()]);

        let env = EnvelopeBuilder::new("relay.echo.test", json!("ping"))
            .build()
            .unwrap();
        let result = adapter.deliver(env.subject(), &env, None).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(adapter.remote_status().await.unwrap()["healthy"], true);

        adapter.stop().await.unwrap();
        assert_eq!(adapter.status().state, AdapterState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_program_is_load_error() {
        let result = ProcessAdapter::spawn(
            "ghost",
            Path::new("/nonexistent/relay-plugin"),
            &[],
            &json!({}),
        )
        .await;
        assert!(matches!(result, Err(Error::PluginLoad { .. })));
    }
}
