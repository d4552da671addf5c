//! CLI commands for agent-relay using clap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};

use crate::adapters::{load_adapters, BuiltinAdapters};
use crate::config::{self, AdapterConfig, Settings};
use crate::core::{PublishOptions, RelayCore, RelayOptions};
use crate::protocol::MessageStatus;
use crate::runtime::{
    create_provider, AgentRuntime, ProviderRuntime, RunPatch, RunTracker, StaticAgentResolver,
};
use crate::store::{DeadLetterFilter, MessageFilter};

/// agent-relay - message bus for agents, humans and external channels.
#[derive(Parser)]
#[command(name = "agent-relay")]
#[command(version)]
#[command(about = "Subject-addressed message relay for autonomous agents", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.agent-relay/relay.json)
    #[arg(long, global = true, env = "AGENT_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay with its adapters until interrupted
    Serve,

    /// Publish a message or signal
    Publish {
        /// Concrete subject, e.g. relay.agent.reviewer
        subject: String,

        /// JSON payload; anything that is not valid JSON is sent as a string
        payload: String,

        /// Sender subject
        #[arg(long)]
        from: Option<String>,

        /// Subject replies should go to
        #[arg(long = "reply-to")]
        reply_to: Option<String>,

        /// Publish as an ephemeral signal
        #[arg(long)]
        signal: bool,
    },

    /// Manage endpoints
    #[command(subcommand)]
    Endpoint(EndpointCommand),

    /// List indexed messages
    Messages {
        #[arg(long)]
        subject: Option<String>,

        /// pending, delivered or failed
        #[arg(long)]
        status: Option<String>,

        /// Endpoint hash
        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show one message: per-endpoint records and its trace span
    Message {
        /// Message id
        id: String,
    },

    /// List dead letters
    DeadLetters {
        /// Endpoint hash
        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Show store, trace and adapter metrics
    Metrics,

    /// Rebuild the message index from the mailboxes
    Reindex,

    /// List configured adapters
    Adapters,
}

#[derive(Subcommand)]
pub enum EndpointCommand {
    /// Register an endpoint for a subject pattern
    Register {
        /// Subject or pattern, e.g. relay.agent.> or relay.human.*.inbox
        subject: String,
    },

    /// List endpoints
    List,

    /// Remove an endpoint by hash
    Remove {
        hash: String,
    },
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let settings = match &self.config {
            Some(path) => config::load_settings_from(path)?,
            None => config::load_settings_or_default(),
        };

        match &self.command {
            Command::Serve => cmd_serve(&settings).await,
            Command::Publish {
                subject,
                payload,
                from,
                reply_to,
                signal,
            } => cmd_publish(&settings, subject, payload, from, reply_to, *signal).await,
            Command::Endpoint(cmd) => cmd_endpoint(&settings, cmd),
            Command::Messages {
                subject,
                status,
                endpoint,
                limit,
            } => cmd_messages(&settings, subject, status, endpoint, *limit),
            Command::Message { id } => cmd_message(&settings, id),
            Command::DeadLetters { endpoint, limit } => cmd_dead_letters(&settings, endpoint, *limit),
            Command::Metrics => cmd_metrics(&settings),
            Command::Reindex => cmd_reindex(&settings),
            Command::Adapters => cmd_adapters(&settings),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn relay_options(settings: &Settings) -> RelayOptions {
    RelayOptions {
        budget: settings.budget.clone(),
        shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
    }
}

fn open_relay(settings: &Settings) -> Result<RelayCore> {
    let data_dir = settings.data_dir()?;
    let resolver = StaticAgentResolver::new();
    for (subject, agent) in &settings.agents {
        resolver.insert(subject.clone(), agent.clone());
    }
    let relay = RelayCore::open(&data_dir, relay_options(settings))?
        .with_agent_resolver(Arc::new(resolver));
    tracing::debug!("Opened relay at {}", data_dir.display());
    Ok(relay)
}

// Command implementations

/// Logs scheduled-run outcomes; the scheduler owning the run table lives
/// outside this process.
struct LoggingRunTracker;

#[async_trait]
impl RunTracker for LoggingRunTracker {
    async fn update_run(&self, run_id: &str, patch: RunPatch) {
        match &patch.error {
            Some(error) => tracing::warn!("Run {} {:?}: {}", run_id, patch.status, error),
            None => tracing::info!("Run {} {:?}", run_id, patch.status),
        }
    }
}

fn agent_runtime(settings: &Settings) -> Option<Arc<dyn AgentRuntime>> {
    let runtime = &settings.runtime;
    match create_provider(&runtime.provider, runtime.base_url.as_deref()) {
        Ok(provider) => Some(Arc::new(
            ProviderRuntime::new(provider)
                .with_model(runtime.model.clone())
                .with_default_cwd(runtime.default_cwd.clone()),
        )),
        Err(e) => {
            tracing::warn!("Agent runtime disabled: {}", e);
            None
        }
    }
}

/// Fill unset runtime-agent options from the relay settings.
fn apply_runtime_defaults(configs: &mut [AdapterConfig], settings: &Settings) {
    let defaults = [
        ("maxConcurrent", json!(settings.runtime.max_concurrent)),
        ("defaultTimeoutSecs", json!(settings.runtime.default_timeout_secs)),
        ("defaultCwd", json!(settings.runtime.default_cwd)),
        ("defaultRuntime", json!(settings.runtime.provider)),
        ("shutdownTimeoutSecs", json!(settings.shutdown_timeout_secs)),
    ];

    for entry in configs.iter_mut().filter(|c| c.adapter_type == "runtime-agent") {
        if entry.config.is_null() {
            entry.config = Value::Object(Default::default());
        }
        let Some(obj) = entry.config.as_object_mut() else {
            continue;
        };
        for (key, value) in &defaults {
            if !value.is_null() && !obj.contains_key(*key) {
                obj.insert(key.to_string(), value.clone());
            }
        }
    }
}

async fn cmd_serve(settings: &Settings) -> Result<()> {
    let relay = Arc::new(open_relay(settings)?);

    let adapters_file = settings.adapters_file()?;
    let mut configs = config::load_adapter_configs(&adapters_file)?;
    apply_runtime_defaults(&mut configs, settings);

    let builtins = BuiltinAdapters::standard(
        agent_runtime(settings),
        Some(Arc::new(LoggingRunTracker)),
        Some(relay.traces()),
    );
    let config_dir = adapters_file.parent().unwrap_or_else(|| Path::new("."));
    let loaded = load_adapters(&configs, &builtins, config_dir).await;

    for adapter in loaded.adapters {
        let id = adapter.id().to_string();
        if let Err(e) = relay.register_adapter(adapter) {
            tracing::error!("Failed to register adapter '{}': {}", id, e);
        }
    }

    let failed = relay.start_adapters().await;
    tracing::info!(
        "Relay serving with {} adapter(s), {} failed to load, {} failed to start",
        relay.adapters().len(),
        loaded.failures.len(),
        failed.len()
    );
    println!("agent-relay running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    relay.shutdown().await;
    println!("agent-relay stopped.");
    Ok(())
}

async fn cmd_publish(
    settings: &Settings,
    subject: &str,
    payload: &str,
    from: &Option<String>,
    reply_to: &Option<String>,
    signal: bool,
) -> Result<()> {
    let relay = open_relay(settings)?;
    let payload: Value =
        serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()));

    let mut options = if signal {
        PublishOptions::signal()
    } else {
        PublishOptions::message()
    };
    if let Some(from) = from {
        options = options.from(from.clone());
    }
    if let Some(reply_to) = reply_to {
        options = options.reply_to(reply_to.clone());
    }

    let result = relay.publish(subject, payload, options).await?;
    print_json(&result)
}

fn cmd_endpoint(settings: &Settings, cmd: &EndpointCommand) -> Result<()> {
    let relay = open_relay(settings)?;
    match cmd {
        EndpointCommand::Register { subject } => print_json(&relay.register_endpoint(subject)?),
        EndpointCommand::List => print_json(&relay.list_endpoints()?),
        EndpointCommand::Remove { hash } => {
            if relay.unregister_endpoint(hash)? {
                println!("Removed endpoint {}", hash);
                Ok(())
            } else {
                anyhow::bail!("No endpoint with hash {}", hash)
            }
        }
    }
}

fn cmd_messages(
    settings: &Settings,
    subject: &Option<String>,
    status: &Option<String>,
    endpoint: &Option<String>,
    limit: usize,
) -> Result<()> {
    let status = match status.as_deref() {
        Some(s) => Some(
            MessageStatus::parse(s)
                .ok_or_else(|| anyhow::anyhow!("Unknown status '{}'", s))?,
        ),
        None => None,
    };
    let filter = MessageFilter {
        subject: subject.clone(),
        status,
        endpoint_hash: endpoint.clone(),
        limit: Some(limit),
        ..Default::default()
    };
    print_json(&open_relay(settings)?.list_messages(&filter)?)
}

fn cmd_message(settings: &Settings, id: &str) -> Result<()> {
    let relay = open_relay(settings)?;
    let records = relay.get_message(id)?;
    let span = relay.get_span(id)?;
    if records.is_empty() && span.is_none() {
        anyhow::bail!("Message {} not found", id);
    }
    print_json(&json!({ "records": records, "span": span }))
}

fn cmd_dead_letters(settings: &Settings, endpoint: &Option<String>, limit: usize) -> Result<()> {
    let filter = DeadLetterFilter {
        endpoint_hash: endpoint.clone(),
        limit: Some(limit),
        ..Default::default()
    };
    print_json(&open_relay(settings)?.dead_letters(&filter)?)
}

fn cmd_metrics(settings: &Settings) -> Result<()> {
    print_json(&open_relay(settings)?.metrics()?)
}

fn cmd_reindex(settings: &Settings) -> Result<()> {
    let stats = open_relay(settings)?.rebuild_index()?;
    print_json(&stats)
}

fn cmd_adapters(settings: &Settings) -> Result<()> {
    let configs = config::load_adapter_configs(&settings.adapters_file()?)?;
    let rows: Vec<Value> = configs
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "type": c.adapter_type,
                "enabled": c.enabled,
                "builtin": c.builtin,
                "plugin": c.plugin,
            })
        })
        .collect();
    print_json(&rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Commands::command().debug_assert();
    }

    #[test]
    fn test_parse_publish() {
        let args = Commands::try_parse_from([
            "agent-relay",
            "publish",
            "relay.agent.reviewer",
            "{\"text\":\"hi\"}",
            "--reply-to",
            "relay.human.cli.me",
            "--signal",
        ])
        .unwrap();
        match args.command {
            Command::Publish {
                subject,
                reply_to,
                signal,
                ..
            } => {
                assert_eq!(subject, "relay.agent.reviewer");
                assert_eq!(reply_to.as_deref(), Some("relay.human.cli.me"));
                assert!(signal);
            }
            _ => panic!("expected publish"),
        }
    }

    #[test]
    fn test_runtime_defaults_fill_missing_keys() {
        let mut settings = Settings::default();
        settings.runtime.max_concurrent = 7;
        let mut configs: Vec<AdapterConfig> = serde_json::from_value(json!([
            {"id": "agents", "type": "runtime-agent", "builtin": true,
             "config": {"defaultTimeoutSecs": 30}},
            {"id": "ci", "type": "webhook", "builtin": true, "config": {}}
        ]))
        .unwrap();

        apply_runtime_defaults(&mut configs, &settings);

        assert_eq!(configs[0].config["maxConcurrent"], 7);
        assert_eq!(configs[0].config["defaultTimeoutSecs"], 30);
        assert!(configs[0].config.get("defaultCwd").is_none());
        assert_eq!(configs[1].config, json!({}));
    }
}
