//! Agent runtime collaborators.
//!
//! The relay does not run agents itself. It talks to an `AgentRuntime` that
//! streams `RuntimeEvent`s back, reports scheduled runs to a `RunTracker` and
//! asks an `AgentResolver` which directory and runtime belong to a subject.
//!
//! `ProviderRuntime` is the bundled runtime, driving a `Provider` (Claude CLI
//! or Ollama HTTP).

pub mod claude;
pub mod ollama;
pub mod provider;
pub mod provider_runtime;

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::protocol::AgentInfo;

pub use provider::{create_provider, Provider, ProviderError};
pub use provider_runtime::ProviderRuntime;

/// Stream of events produced by one `send_message` call.
pub type EventStream = Pin<Box<dyn Stream<Item = RuntimeEvent> + Send>>;

/// One event from a running agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    SessionStarted {
        session_id: String,
    },
    TextDelta {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        name: String,
        #[serde(default)]
        output: String,
    },
    /// Terminal: the turn finished.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Terminal: the turn failed.
    Error {
        message: String,
    },
}

impl RuntimeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RuntimeEvent::Done { .. } | RuntimeEvent::Error { .. })
    }

    /// Text carried by this event, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            RuntimeEvent::TextDelta { text } => Some(text),
            RuntimeEvent::Done { text } => text.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub cwd: Option<PathBuf>,
    pub runtime: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub cwd: Option<PathBuf>,
    pub runtime: Option<String>,
    /// Out-of-band context for the agent, kept apart from the user text.
    pub system_context: Option<String>,
    /// Cancelling tears down the turn and ends the event stream.
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn ensure_session(&self, session_id: &str, options: &SessionOptions) -> Result<()>;

    async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        options: SendOptions,
    ) -> Result<EventStream>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Update for a scheduled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPatch {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Receives the outcome of scheduler-originated (pulse) runs.
#[async_trait]
pub trait RunTracker: Send + Sync {
    async fn update_run(&self, run_id: &str, patch: RunPatch);
}

/// Maps a subject to the agent that owns it.
pub trait AgentResolver: Send + Sync {
    fn lookup(&self, subject: &str) -> Option<AgentInfo>;
}

/// Resolver backed by a fixed subject -> agent table.
#[derive(Debug, Default)]
pub struct StaticAgentResolver {
    agents: RwLock<HashMap<String, AgentInfo>>,
}

impl StaticAgentResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subject: impl Into<String>, agent: AgentInfo) {
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subject.into(), agent);
    }
}

impl AgentResolver for StaticAgentResolver {
    fn lookup(&self, subject: &str) -> Option<AgentInfo> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(subject)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tagging() {
        let event: RuntimeEvent =
            serde_json::from_value(json!({"type": "text_delta", "text": "hi"})).unwrap();
        assert_eq!(event.text(), Some("hi"));
        assert!(!event.is_terminal());

        let done = serde_json::to_value(RuntimeEvent::Done { text: None }).unwrap();
        assert_eq!(done, json!({"type": "done"}));
    }

    #[test]
    fn test_static_resolver() {
        let resolver = StaticAgentResolver::new();
        resolver.insert(
            "relay.agent.proj1.bot",
            AgentInfo {
                directory: PathBuf::from("/srv/proj1"),
                runtime: "claude".to_string(),
                manifest: json!({}),
            },
        );
        assert_eq!(
            resolver.lookup("relay.agent.proj1.bot").unwrap().runtime,
            "claude"
        );
        assert!(resolver.lookup("relay.agent.proj2.bot").is_none());
    }
}
