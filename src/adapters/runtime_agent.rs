//! Adapter that hands messages to an agent runtime under bounded concurrency.
//!
//! Subjects:
//! - `relay.agent.{project}.{agent}`: direct message, the payload is the prompt
//! - `relay.system.pulse.{scheduleId}`: scheduled run with `{prompt, cwd, runId}`
//!
//! Each admitted delivery holds a semaphore permit for its whole lifetime.
//! Runtime events stream back to the envelope's `reply_to`: intermediate
//! events as signals, the terminal event as a durable message.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::{
    elapsed_ms, AdapterState, AdapterStatus, PublisherSlot, RelayAdapter, RelayPublisher,
    StatusCell, STOPPED_ERROR,
};
use crate::core::{PublishOptions, REASON_EXPIRED};
use crate::error::{Error, Result};
use crate::protocol::{AdapterContext, DeliveryResult, Envelope};
use crate::runtime::{
    AgentRuntime, EventStream, RunPatch, RunStatus, RunTracker, RuntimeEvent, SendOptions,
    SessionOptions,
};
use crate::store::{SpanUpdate, TraceStore};

pub const AGENT_PREFIX: &str = "relay.agent.";
pub const PULSE_PREFIX: &str = "relay.system.pulse.";
pub const CAPACITY_ERROR: &str = "Adapter at capacity";

const EXCERPT_LIMIT: usize = 1000;

fn default_max_concurrent() -> usize {
    3
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_runtime() -> String {
    "claude".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeAgentConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default)]
    pub default_cwd: Option<PathBuf>,
    #[serde(default = "default_runtime")]
    pub default_runtime: String,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for RuntimeAgentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            default_timeout_secs: default_timeout_secs(),
            default_cwd: None,
            default_runtime: default_runtime(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

/// What kind of work a delivery is.
#[derive(Debug, Clone, PartialEq)]
enum Dispatch {
    Direct {
        prompt: String,
    },
    Pulse {
        schedule_id: String,
        run_id: Option<String>,
        prompt: String,
    },
}

impl Dispatch {
    fn classify(subject: &str, payload: &Value) -> Result<Self> {
        if let Some(schedule_id) = subject.strip_prefix(PULSE_PREFIX) {
            let prompt = payload
                .get("prompt")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Validation("pulse payload has no prompt".to_string()))?;
            return Ok(Dispatch::Pulse {
                schedule_id: schedule_id.to_string(),
                run_id: payload.get("runId").and_then(Value::as_str).map(str::to_string),
                prompt: prompt.to_string(),
            });
        }
        Ok(Dispatch::Direct {
            prompt: prompt_text(payload),
        })
    }

    fn prompt(&self) -> &str {
        match self {
            Dispatch::Direct { prompt } | Dispatch::Pulse { prompt, .. } => prompt,
        }
    }

    fn run_id(&self) -> Option<&str> {
        match self {
            Dispatch::Pulse { run_id, .. } => run_id.as_deref(),
            Dispatch::Direct { .. } => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Dispatch::Direct { .. } => "direct",
            Dispatch::Pulse { .. } => "pulse",
        }
    }
}

/// The raw user text of a payload: a string, or the first text-like field.
fn prompt_text(payload: &Value) -> String {
    if let Some(text) = payload.as_str() {
        return text.to_string();
    }
    ["content", "text", "prompt", "message"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}

/// Relay metadata for the agent, passed beside the prompt rather than in it.
fn relay_context(subject: &str, envelope: &Envelope, dispatch: &Dispatch) -> String {
    let budget = envelope.budget();
    let mut lines = vec![
        "<relay_context>".to_string(),
        format!("from: {}", envelope.from()),
        format!("subject: {}", subject),
        format!("message_id: {}", envelope.id()),
        format!(
            "budget: hops {}/{}, calls remaining {}, expires {}",
            budget.hops_used,
            budget.max_hops,
            budget.call_budget_remaining,
            budget.ttl.to_rfc3339()
        ),
    ];
    if let Some(reply_to) = envelope.reply_to() {
        lines.push(format!("reply_to: {}", reply_to));
    }
    if let Dispatch::Pulse {
        schedule_id,
        run_id,
        ..
    } = dispatch
    {
        lines.push(format!("schedule_id: {}", schedule_id));
        if let Some(run_id) = run_id {
            lines.push(format!("run_id: {}", run_id));
        }
    }
    lines.push("</relay_context>".to_string());
    lines.join("\n")
}

fn push_excerpt(excerpt: &mut String, text: &str) {
    let room = EXCERPT_LIMIT.saturating_sub(excerpt.chars().count());
    excerpt.extend(text.chars().take(room));
}

/// How a runtime turn ended.
enum Outcome {
    Completed { response_id: Option<String> },
    RuntimeError(String),
    TimedOut { ttl_bound: bool },
    Cancelled,
}

pub struct RuntimeAgentAdapter {
    id: String,
    config: RuntimeAgentConfig,
    runtime: Arc<dyn AgentRuntime>,
    tracker: Option<Arc<dyn RunTracker>>,
    traces: Option<Arc<TraceStore>>,
    permits: Arc<Semaphore>,
    shutdown: Mutex<CancellationToken>,
    publisher: PublisherSlot,
    status: StatusCell,
}

impl RuntimeAgentAdapter {
    pub fn new(id: impl Into<String>, runtime: Arc<dyn AgentRuntime>, config: RuntimeAgentConfig) -> Self {
        let max = config.max_concurrent.max(1);
        Self {
            id: id.into(),
            config,
            runtime,
            tracker: None,
            traces: None,
            permits: Arc::new(Semaphore::new(max)),
            shutdown: Mutex::new(CancellationToken::new()),
            publisher: PublisherSlot::default(),
            status: StatusCell::new(),
        }
    }

    pub fn with_tracker(mut self, tracker: Option<Arc<dyn RunTracker>>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_traces(mut self, traces: Option<Arc<TraceStore>>) -> Self {
        self.traces = traces;
        self
    }

    fn max_concurrent(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    /// Deliveries currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrent() - self.permits.available_permits()
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn annotate_span(&self, message_id: &str, metadata: Value) {
        if let Some(traces) = &self.traces {
            traces.update_span(message_id, SpanUpdate::default().with_metadata(metadata));
        }
    }

    async fn publish_event(
        &self,
        publisher: &dyn RelayPublisher,
        subject: &str,
        envelope: &Envelope,
        event: &RuntimeEvent,
    ) -> Option<String> {
        let reply_to = envelope.reply_to()?;
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Could not encode runtime event: {}", e);
                return None;
            }
        };
        let kind = if event.is_terminal() {
            PublishOptions::message()
        } else {
            PublishOptions::signal()
        };
        let options = kind.from(subject).caused_by(envelope);

        match publisher.publish(reply_to, payload, options).await {
            Ok(result) => Some(result.message_id),
            Err(e) => {
                tracing::warn!("Reply to {} for {} failed: {}", reply_to, envelope.id(), e);
                None
            }
        }
    }

    /// Drain the runtime stream, forwarding events to the reply subject.
    async fn consume(
        &self,
        publisher: &dyn RelayPublisher,
        subject: &str,
        envelope: &Envelope,
        mut stream: EventStream,
        cancel: &CancellationToken,
        excerpt: &mut String,
    ) -> Outcome {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Outcome::Cancelled,
                event = stream.next() => event,
            };

            let Some(event) = event else {
                return Outcome::RuntimeError("runtime stream ended without a result".to_string());
            };

            match &event {
                RuntimeEvent::TextDelta { text } => push_excerpt(excerpt, text),
                RuntimeEvent::Done { text: Some(text) } if excerpt.is_empty() => {
                    push_excerpt(excerpt, text)
                }
                _ => {}
            }

            if !event.is_terminal() {
                self.publish_event(publisher, subject, envelope, &event).await;
                continue;
            }

            let response_id = self.publish_event(publisher, subject, envelope, &event).await;
            return match event {
                RuntimeEvent::Error { message } => Outcome::RuntimeError(message),
                _ => Outcome::Completed { response_id },
            };
        }
    }

    async fn run(
        &self,
        publisher: &dyn RelayPublisher,
        subject: &str,
        envelope: &Envelope,
        dispatch: &Dispatch,
        session: SessionOptions,
        excerpt: &mut String,
    ) -> Outcome {
        let default_timeout = Duration::from_secs(self.config.default_timeout_secs);
        let remaining = envelope.budget().remaining();
        let ttl_bound = remaining < default_timeout;
        let timeout = remaining.min(default_timeout);

        let cancel = self.shutdown_token().child_token();
        let session_id = match dispatch {
            Dispatch::Pulse { schedule_id, .. } => format!("pulse-{}", schedule_id),
            Dispatch::Direct { .. } => subject.to_string(),
        };

        let turn = async {
            if let Err(e) = self.runtime.ensure_session(&session_id, &session).await {
                return Outcome::RuntimeError(e.to_string());
            }
            let options = SendOptions {
                cwd: session.cwd.clone(),
                runtime: session.runtime.clone(),
                system_context: Some(relay_context(subject, envelope, dispatch)),
                cancel: cancel.clone(),
            };
            match self
                .runtime
                .send_message(&session_id, dispatch.prompt(), options)
                .await
            {
                Ok(stream) => {
                    self.consume(publisher, subject, envelope, stream, &cancel, excerpt)
                        .await
                }
                Err(e) => Outcome::RuntimeError(e.to_string()),
            }
        };

        match tokio::time::timeout(timeout, turn).await {
            Ok(outcome) => outcome,
            Err(_) => {
                cancel.cancel();
                Outcome::TimedOut { ttl_bound }
            }
        }
    }

    async fn settle_run(&self, dispatch: &Dispatch, patch: RunPatch) {
        let (Some(tracker), Some(run_id)) = (&self.tracker, dispatch.run_id()) else {
            return;
        };
        tracker.update_run(run_id, patch).await;
    }

    /// Dead-letter through the relay; returns whether it was recorded.
    async fn give_up(&self, publisher: &dyn RelayPublisher, envelope: &Envelope, reason: &str) -> bool {
        match publisher.dead_letter(envelope, reason).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to dead-letter {}: {}", envelope.id(), e);
                false
            }
        }
    }

    async fn fail(
        &self,
        publisher: &dyn RelayPublisher,
        envelope: &Envelope,
        reason: String,
        started: Instant,
    ) -> DeliveryResult {
        self.status.record_error(reason.clone());
        let dead_lettered = self.give_up(publisher, envelope, &reason).await;
        let mut result = DeliveryResult::failed(reason, elapsed_ms(started));
        result.dead_lettered = dead_lettered;
        result
    }
}

#[async_trait]
impl RelayAdapter for RuntimeAgentAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject_prefixes(&self) -> Vec<String> {
        vec![AGENT_PREFIX.to_string(), PULSE_PREFIX.to_string()]
    }

    async fn start(&self, relay: Arc<dyn RelayPublisher>) -> Result<()> {
        self.status.set_state(AdapterState::Starting);
        {
            let mut token = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        self.publisher.set(relay);
        self.status.set_state(AdapterState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.status.set_state(AdapterState::Stopping);
        self.shutdown_token().cancel();

        let window = Duration::from_secs(self.config.shutdown_timeout_secs);
        let all = self.max_concurrent() as u32;
        match tokio::time::timeout(window, self.permits.acquire_many(all)).await {
            Ok(Ok(_drained)) => {}
            Ok(Err(e)) => tracing::warn!("Adapter '{}' semaphore closed: {}", self.id, e),
            Err(_) => tracing::warn!(
                "Adapter '{}' stopped with {} deliveries still running",
                self.id,
                self.in_flight()
            ),
        }

        self.publisher.clear();
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

        if self.shutdown_token().is_cancelled() {
            return DeliveryResult::failed(STOPPED_ERROR, elapsed_ms(started));
        }

        let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
            let rejection = Error::CapacityExceeded {
                adapter: self.id.clone(),
            };
            tracing::debug!("{} ('{}'), rejecting {}", rejection, self.id, envelope.id());
            return DeliveryResult::failed(rejection.to_string(), elapsed_ms(started));
        };
        self.status.record_in();

        let Some(publisher) = self.publisher.get() else {
            return DeliveryResult::failed(
                format!("adapter '{}' is not started", self.id),
                elapsed_ms(started),
            );
        };
        let publisher = publisher.as_ref();

        if let Err(expired) = envelope.ensure_live() {
            tracing::debug!("Adapter '{}': {}", self.id, expired);
            return self
                .fail(publisher, envelope, REASON_EXPIRED.to_string(), started)
                .await;
        }

        let dispatch = match Dispatch::classify(subject, envelope.payload()) {
            Ok(d) => d,
            Err(e) => return self.fail(publisher, envelope, e.to_string(), started).await,
        };

        let agent = context.and_then(|c| c.agent.as_ref());
        let cwd = agent
            .map(|a| a.directory.clone())
            .or_else(|| {
                envelope
                    .payload()
                    .get("cwd")
                    .and_then(Value::as_str)
                    .map(PathBuf::from)
            })
            .or_else(|| self.config.default_cwd.clone());
        let runtime = agent
            .map(|a| a.runtime.clone())
            .or_else(|| {
                envelope
                    .payload()
                    .get("runtime")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.config.default_runtime.clone());

        self.annotate_span(
            envelope.id(),
            json!({
                "adapter": self.id,
                "dispatch": dispatch.kind(),
                "runtime": runtime,
                "cwd": cwd.as_ref().map(|p| p.display().to_string()),
            }),
        );
        if let Some(run_id) = dispatch.run_id() {
            if let Some(tracker) = &self.tracker {
                tracker
                    .update_run(
                        run_id,
                        RunPatch {
                            status: RunStatus::Running,
                            session_id: None,
                            output_excerpt: None,
                            error: None,
                            finished_at: None,
                        },
                    )
                    .await;
            }
        }

        let session = SessionOptions {
            cwd,
            runtime: Some(runtime),
        };
        let mut excerpt = String::new();
        let outcome = self
            .run(publisher, subject, envelope, &dispatch, session, &mut excerpt)
            .await;

        let (status, error) = match &outcome {
            Outcome::Completed { .. } => (RunStatus::Completed, None),
            Outcome::RuntimeError(e) => (RunStatus::Failed, Some(e.clone())),
            Outcome::TimedOut { ttl_bound: true } => {
                (RunStatus::Failed, Some(REASON_EXPIRED.to_string()))
            }
            Outcome::TimedOut { ttl_bound: false } => (
                RunStatus::Failed,
                Some(format!(
                    "runtime timed out after {}s",
                    self.config.default_timeout_secs
                )),
            ),
            Outcome::Cancelled => (RunStatus::Cancelled, Some(STOPPED_ERROR.to_string())),
        };

        self.settle_run(
            &dispatch,
            RunPatch {
                status,
                session_id: None,
                output_excerpt: (!excerpt.is_empty()).then(|| excerpt.clone()),
                error: error.clone(),
                finished_at: Some(Utc::now()),
            },
        )
        .await;
        self.annotate_span(envelope.id(), json!({ "excerpt": excerpt }));

        match outcome {
            Outcome::Completed { response_id } => {
                self.status.record_out();
                DeliveryResult::delivered(elapsed_ms(started)).with_response(response_id)
            }
            _ => {
                let reason = error.unwrap_or_else(|| "delivery failed".to_string());
                self.fail(publisher, envelope, reason, started).await
            }
        }
    }

    fn status(&self) -> AdapterStatus {
        self.status.snapshot()
    }
}
