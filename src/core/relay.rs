//! The relay: publish pipeline, subscriptions and observability queries.

use std::path::Path;
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use super::subscriptions::{FanOut, Subscription, Subscriptions};
use crate::adapters::{elapsed_ms, AdapterInfo, AdapterRegistry, RelayAdapter, RelayPublisher};
use crate::error::{Error, Result};
use crate::protocol::{
    validate_subject, AdapterContext, BudgetDefaults, BudgetOverrides, DeadLetter,
    DeliveryResult, Envelope, EnvelopeBuilder, Parent, PlatformInfo, PublishKind,
    SubjectMatcher, TraceContext,
};
use crate::runtime::AgentResolver;
use crate::store::{
    DeadLetterFilter, Endpoint, MessageFilter, MessageRecord, MessageStore, RebuildStats,
    SpanStatus, SpanUpdate, StoreCounts, TraceMetrics, TraceSpan, TraceStore,
};

/// Dead-letter reason for envelopes past their TTL.
pub const REASON_EXPIRED: &str = "message expired (TTL)";
/// Dead-letter reason when nothing matched a published subject.
pub const REASON_UNROUTABLE: &str = "no matching endpoints or adapters";

const TRACE_DB: &str = "traces.db";
const DEFAULT_SENDER: &str = "anonymous";
const HUMAN_PREFIX: &str = "relay.human.";

/// Options for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub from: Option<String>,
    pub reply_to: Option<String>,
    pub kind: PublishKind,
    pub budget: Option<BudgetOverrides>,
    pub parent: Option<Parent>,
}

impl PublishOptions {
    pub fn message() -> Self {
        Self::default()
    }

    pub fn signal() -> Self {
        Self {
            kind: PublishKind::Signal,
            ..Default::default()
        }
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Publish as a causal child of `parent`, inheriting its budget.
    pub fn caused_by(mut self, parent: &Envelope) -> Self {
        self.parent = Some(Parent::from(parent));
        self
    }

    pub fn budget(mut self, overrides: BudgetOverrides) -> Self {
        self.budget = Some(overrides);
        self
    }
}

/// Outcome of a publish.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishResult {
    pub message_id: String,
    pub kind: PublishKind,
    /// Number of targets (endpoints, subscribers, adapter) that accepted it.
    pub delivered_to: usize,
    pub endpoint_hashes: Vec<String>,
    pub adapter_result: Option<DeliveryResult>,
    pub result: DeliveryResult,
}

/// Relay-wide tunables.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub budget: BudgetDefaults,
    pub shutdown_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            budget: BudgetDefaults::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Snapshot of relay health for the metrics query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMetrics {
    pub store: StoreCounts,
    pub traces: TraceMetrics,
    pub subscribers: usize,
    pub adapters: Vec<AdapterInfo>,
}

pub struct RelayCore {
    store: MessageStore,
    traces: Arc<TraceStore>,
    subscriptions: Subscriptions,
    adapters: AdapterRegistry,
    endpoints: RwLock<SubjectMatcher<String>>,
    resolver: Option<Arc<dyn AgentResolver>>,
    options: RelayOptions,
}

impl std::fmt::Debug for RelayCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCore")
            .field("root", &self.store.root())
            .field("adapters", &self.adapters)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

impl RelayCore {
    /// Assemble a relay from an opened store and trace store.
    pub fn new(store: MessageStore, traces: Arc<TraceStore>, options: RelayOptions) -> Result<Self> {
        let mut matcher = SubjectMatcher::new();
        for endpoint in store.list_endpoints()? {
            matcher.insert(&endpoint.subject, endpoint.hash)?;
        }

        Ok(Self {
            store,
            traces,
            subscriptions: Subscriptions::new(),
            adapters: AdapterRegistry::new(),
            endpoints: RwLock::new(matcher),
            resolver: None,
            options,
        })
    }

    /// Open the message store and trace store under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>, options: RelayOptions) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        let store = MessageStore::open(data_dir)?;
        let traces = Arc::new(TraceStore::open(data_dir.join(TRACE_DB))?);
        Self::new(store, traces, options)
    }

    pub fn with_agent_resolver(mut self, resolver: Arc<dyn AgentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn traces(&self) -> Arc<TraceStore> {
        self.traces.clone()
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    pub fn register_adapter(&self, adapter: Arc<dyn RelayAdapter>) -> Result<()> {
        self.adapters.register(adapter)
    }

    // ---- publish pipeline ----

    /// Publish a message or signal.
    ///
    /// Invalid subjects and hop, call-budget or cycle violations return `Err`
    /// before anything is written. An envelope already past its TTL is
    /// dead-lettered and reported through the returned result.
    pub async fn publish(
        &self,
        subject: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<PublishResult> {
        validate_subject(subject)?;

        let PublishOptions {
            from,
            reply_to,
            kind,
            budget,
            parent,
        } = options;
        let parent_id = parent.as_ref().map(|p| p.id.clone());

        let envelope = EnvelopeBuilder::new(subject, payload)
            .from(from.unwrap_or_else(|| DEFAULT_SENDER.to_string()))
            .reply_to(reply_to)
            .parent(parent)
            .overrides(budget.unwrap_or_default())
            .defaults(self.options.budget.clone())
            .build()
            .map_err(|e| {
                tracing::warn!("Rejected publish to {}: {}", subject, e);
                e
            })?;

        match kind {
            PublishKind::Signal => Ok(self.publish_signal(envelope)),
            PublishKind::Message => self.publish_message(envelope, parent_id).await,
        }
    }

    fn publish_signal(&self, envelope: Envelope) -> PublishResult {
        let started = Instant::now();
        let mut delivered_to = 0;
        let result = if envelope.is_expired() {
            DeliveryResult::failed(REASON_EXPIRED, 0)
        } else {
            let fan_out = self.subscriptions.dispatch(&envelope);
            delivered_to = fan_out.delivered;
            if fan_out.delivered > 0 {
                DeliveryResult::delivered(elapsed_ms(started))
            } else if fan_out.matched == 0 {
                DeliveryResult::failed("no subscribers", elapsed_ms(started))
            } else {
                DeliveryResult::failed(fan_out.errors.join("; "), elapsed_ms(started))
            }
        };

        PublishResult {
            message_id: envelope.id().to_string(),
            kind: PublishKind::Signal,
            delivered_to,
            endpoint_hashes: Vec::new(),
            adapter_result: None,
            result,
        }
    }

    async fn publish_message(
        &self,
        envelope: Envelope,
        parent_id: Option<String>,
    ) -> Result<PublishResult> {
        let started = Instant::now();
        let trace = self.trace_context(&envelope, parent_id);
        let mut span = TraceSpan::pending(envelope.id(), &trace.trace_id, envelope.subject());

        if let Err(expired) = envelope.ensure_live() {
            tracing::warn!("{}, dead-lettering", expired);
            self.store.dead_letter(&DeadLetter::new(&envelope, None, REASON_EXPIRED))?;
            span.status = SpanStatus::Failed;
            span.error = Some(REASON_EXPIRED.to_string());
            self.traces.insert_span(&span);
            return Ok(PublishResult {
                message_id: envelope.id().to_string(),
                kind: PublishKind::Message,
                delivered_to: 0,
                endpoint_hashes: Vec::new(),
                adapter_result: None,
                result: DeliveryResult::failed(REASON_EXPIRED, elapsed_ms(started))
                    .with_dead_lettered(),
            });
        }

        // Resolve targets.
        let endpoint_hashes = self.matching_endpoints(envelope.subject());
        let subscriber_count = self.subscriptions.count_matching(envelope.subject());
        let adapter = self.adapters.route(envelope.subject());

        self.traces.insert_span(&span);

        // Persist to every mailbox before any fan-out.
        let mut enqueued = Vec::new();
        let mut errors = Vec::new();
        let mut dead_lettered = false;
        for hash in &endpoint_hashes {
            match self.store.enqueue(hash, &envelope) {
                Ok(()) => enqueued.push(hash.clone()),
                Err(e) => {
                    tracing::error!("Failed to enqueue {} to {}: {}", envelope.id(), hash, e);
                    let reason = e.to_string();
                    if let Err(e) = self.store.dead_letter(&DeadLetter::new(&envelope, Some(hash), &reason)) {
                        tracing::error!("Failed to dead-letter {}: {}", envelope.id(), e);
                    } else {
                        dead_lettered = true;
                    }
                    errors.push(format!("endpoint {}: {}", hash, reason));
                }
            }
        }

        let fan_out: FanOut = if subscriber_count > 0 {
            self.subscriptions.dispatch(&envelope)
        } else {
            FanOut::default()
        };
        errors.extend(fan_out.errors.iter().cloned());

        let adapter_result = match adapter {
            Some(_) => {
                let context = self.adapter_context(&envelope, trace.clone());
                self.adapters
                    .deliver(envelope.subject(), &envelope, Some(&context))
                    .await
            }
            None => None,
        };
        if let Some(result) = &adapter_result {
            if !result.success {
                errors.push(format!(
                    "adapter: {}",
                    result.error.as_deref().unwrap_or("delivery failed")
                ));
            }
            dead_lettered |= result.dead_lettered;
        }

        for hash in &enqueued {
            if let Err(e) = self.store.mark_delivered(hash, envelope.id()) {
                tracing::error!("Failed to settle {} in {}: {}", envelope.id(), hash, e);
            }
        }

        let adapter_ok = adapter_result.as_ref().map(|r| r.success).unwrap_or(false);
        let delivered_to = enqueued.len() + fan_out.delivered + usize::from(adapter_ok);
        let matched_any = !endpoint_hashes.is_empty() || fan_out.matched > 0 || adapter_result.is_some();
        let duration = elapsed_ms(started);

        let result = if delivered_to > 0 {
            self.traces.update_span(
                envelope.id(),
                SpanUpdate::delivered().with_metadata(json!({
                    "deliveredTo": delivered_to,
                    "endpoints": enqueued.len(),
                    "subscribers": fan_out.delivered,
                })),
            );
            DeliveryResult::delivered(duration).with_response(
                adapter_result
                    .as_ref()
                    .and_then(|r| r.response_message_id.clone()),
            )
        } else {
            let reason = if matched_any {
                errors.join("; ")
            } else {
                REASON_UNROUTABLE.to_string()
            };
            if !dead_lettered {
                self.store.dead_letter(&DeadLetter::new(&envelope, None, &reason))?;
                dead_lettered = true;
            }
            self.traces.update_span(envelope.id(), SpanUpdate::failed(&reason));
            let mut failed = DeliveryResult::failed(reason, duration);
            failed.dead_lettered = dead_lettered;
            failed
        };

        tracing::debug!(
            "Published {} to {} ({} targets, success={})",
            envelope.id(),
            envelope.subject(),
            delivered_to,
            result.success
        );

        Ok(PublishResult {
            message_id: envelope.id().to_string(),
            kind: PublishKind::Message,
            delivered_to,
            endpoint_hashes,
            adapter_result,
            result,
        })
    }

    fn matching_endpoints(&self, subject: &str) -> Vec<String> {
        let matcher = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        let mut hashes = matcher.matches(subject);
        hashes.sort();
        hashes.dedup();
        hashes
    }

    /// Continue the parent's trace when it is known, otherwise start a new one.
    fn trace_context(&self, envelope: &Envelope, parent_id: Option<String>) -> TraceContext {
        let inherited = parent_id.as_deref().and_then(|id| match self.traces.get_span(id) {
            Ok(span) => span.map(|s| s.trace_id),
            Err(e) => {
                tracing::warn!("Trace lookup for {} failed: {}", id, e);
                None
            }
        });

        TraceContext {
            trace_id: inherited.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            span_id: envelope.id().to_string(),
            parent_span_id: parent_id,
        }
    }

    fn adapter_context(&self, envelope: &Envelope, trace: TraceContext) -> AdapterContext {
        let agent = self
            .resolver
            .as_ref()
            .and_then(|r| r.lookup(envelope.subject()));

        let platform = envelope
            .from()
            .strip_prefix(HUMAN_PREFIX)
            .and_then(|rest| rest.split('.').next())
            .filter(|name| !name.is_empty())
            .map(|name| PlatformInfo {
                name: name.to_string(),
                metadata: json!({ "sender": envelope.from() }),
            });

        AdapterContext {
            agent,
            platform,
            trace: Some(trace),
        }
    }

    // ---- subscriptions ----

    /// Attach a handler for every message and signal matching `pattern`.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<Subscription>
    where
        F: Fn(&Envelope) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.subscriptions.subscribe(pattern, Arc::new(handler))
    }

    // ---- endpoints ----

    pub fn register_endpoint(&self, subject: &str) -> Result<Endpoint> {
        let endpoint = self.store.register_endpoint(subject)?;
        self.endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(&endpoint.subject, endpoint.hash.clone())?;
        Ok(endpoint)
    }

    pub fn unregister_endpoint(&self, hash: &str) -> Result<bool> {
        let Some(endpoint) = self.store.endpoint(hash)? else {
            return Ok(false);
        };
        self.endpoints
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&endpoint.subject, &endpoint.hash);
        self.store.unregister_endpoint(hash)
    }

    pub fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        self.store.list_endpoints()
    }

    // ---- observability ----

    pub fn list_messages(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>> {
        self.store.list_messages(filter)
    }

    pub fn get_message(&self, message_id: &str) -> Result<Vec<MessageRecord>> {
        self.store.get_message(message_id)
    }

    pub fn read_mailbox(&self, hash: &str) -> Result<Vec<crate::store::MailboxEntry>> {
        self.store.read_mailbox(hash)
    }

    pub fn dead_letters(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetter>> {
        self.store.dead_letters(filter)
    }

    pub fn get_span(&self, message_id: &str) -> Result<Option<TraceSpan>> {
        self.traces.get_span(message_id)
    }

    pub fn metrics(&self) -> Result<RelayMetrics> {
        Ok(RelayMetrics {
            store: self.store.counts()?,
            traces: self.traces.metrics()?,
            subscribers: self.subscriptions.len(),
            adapters: self.adapters.statuses(),
        })
    }

    pub fn rebuild_index(&self) -> Result<RebuildStats> {
        self.store.rebuild_index()
    }

    pub fn adapter_statuses(&self) -> Vec<AdapterInfo> {
        self.adapters.statuses()
    }

    // ---- lifecycle ----

    /// Start every registered adapter, handing each a publisher that does
    /// not keep the relay alive.
    pub async fn start_adapters(self: &Arc<Self>) -> Vec<String> {
        let handle: Arc<dyn RelayPublisher> = Arc::new(RelayHandle(Arc::downgrade(self)));
        self.adapters.start_all(handle).await
    }

    /// Stop all adapters within the configured shutdown window.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down relay");
        self.adapters.stop_all(self.options.shutdown_timeout).await;
    }
}

#[async_trait]
impl RelayPublisher for RelayCore {
    async fn publish(
        &self,
        subject: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<PublishResult> {
        RelayCore::publish(self, subject, payload, options).await
    }

    async fn dead_letter(&self, envelope: &Envelope, reason: &str) -> Result<()> {
        self.store.dead_letter(&DeadLetter::new(envelope, None, reason))
    }
}

/// Weak publisher handed to adapters.
struct RelayHandle(Weak<RelayCore>);

impl RelayHandle {
    fn core(&self) -> Result<Arc<RelayCore>> {
        self.0
            .upgrade()
            .ok_or_else(|| Error::Delivery("relay has shut down".to_string()))
    }
}

#[async_trait]
impl RelayPublisher for RelayHandle {
    async fn publish(
        &self,
        subject: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<PublishResult> {
        self.core()?.publish(subject, payload, options).await
    }

    async fn dead_letter(&self, envelope: &Envelope, reason: &str) -> Result<()> {
        let core = self.core()?;
        core.store.dead_letter(&DeadLetter::new(envelope, None, reason))
    }
}
