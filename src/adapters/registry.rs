//! Adapter registry: prefix routing, lifecycle and fault isolation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinSet;

use super::{elapsed_ms, AdapterStatus, RelayAdapter, RelayPublisher};
use crate::error::{Error, Result};
use crate::protocol::{AdapterContext, DeliveryResult, Envelope};

/// Registry view of one adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInfo {
    pub id: String,
    pub subject_prefixes: Vec<String>,
    pub status: AdapterStatus,
}

#[derive(Default)]
struct Tables {
    adapters: HashMap<String, Arc<dyn RelayAdapter>>,
    /// prefix -> adapter id
    prefixes: HashMap<String, String>,
}

/// Routes subjects to adapters by longest matching prefix.
#[derive(Default)]
pub struct AdapterRegistry {
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.ids())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an adapter and index its prefixes. A prefix already owned by
    /// another adapter is taken over, with a warning.
    pub fn register(&self, adapter: Arc<dyn RelayAdapter>) -> Result<()> {
        let id = adapter.id().to_string();
        let prefixes = adapter.subject_prefixes();
        if prefixes.is_empty() || prefixes.iter().any(|p| p.is_empty()) {
            return Err(Error::Validation(format!(
                "adapter '{}' must declare non-empty subject prefixes",
                id
            )));
        }

        let mut tables = self.write();
        if tables.adapters.contains_key(&id) {
            return Err(Error::Validation(format!("adapter '{}' is already registered", id)));
        }

        for prefix in &prefixes {
            if let Some(previous) = tables.prefixes.insert(prefix.clone(), id.clone()) {
                tracing::warn!(
                    "Subject prefix '{}' moved from adapter '{}' to '{}'",
                    prefix,
                    previous,
                    id
                );
            }
        }
        tables.adapters.insert(id.clone(), adapter);
        tracing::info!("Registered adapter '{}' for {:?}", id, prefixes);
        Ok(())
    }

    /// Remove an adapter and any prefixes still pointing at it.
    pub fn unregister(&self, id: &str) -> Option<Arc<dyn RelayAdapter>> {
        let mut tables = self.write();
        let adapter = tables.adapters.remove(id)?;
        tables.prefixes.retain(|_, owner| owner != id);
        tracing::info!("Unregistered adapter '{}'", id);
        Some(adapter)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RelayAdapter>> {
        self.read().adapters.get(id).cloned()
    }

    /// The adapter owning the longest prefix of `subject`.
    pub fn route(&self, subject: &str) -> Option<Arc<dyn RelayAdapter>> {
        let tables = self.read();
        tables
            .prefixes
            .iter()
            .filter(|(prefix, _)| subject.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .and_then(|(_, id)| tables.adapters.get(id).cloned())
    }

    /// Deliver through the routed adapter, if any.
    ///
    /// The adapter runs in its own task so that a panic surfaces as a failed
    /// result instead of unwinding into the publisher.
    pub async fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        context: Option<&AdapterContext>,
    ) -> Option<DeliveryResult> {
        let adapter = self.route(subject)?;
        let id = adapter.id().to_string();
        let started = Instant::now();

        let subject = subject.to_string();
        let envelope = envelope.clone();
        let context = context.cloned();
        let task = tokio::spawn(async move {
            adapter
                .deliver(&subject, &envelope, context.as_ref())
                .await
        });

        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!("Adapter '{}' panicked during delivery", id);
                DeliveryResult::failed(format!("adapter '{}' panicked", id), elapsed_ms(started))
            }
            Err(e) => DeliveryResult::failed(
                format!("adapter '{}' task aborted: {}", id, e),
                elapsed_ms(started),
            ),
        };
        Some(result)
    }

    /// Start every adapter. Failures are logged and do not stop the others.
    /// Returns the ids that failed to start.
    pub async fn start_all(&self, publisher: Arc<dyn RelayPublisher>) -> Vec<String> {
        let adapters: Vec<Arc<dyn RelayAdapter>> = self.read().adapters.values().cloned().collect();
        let mut failed = Vec::new();

        for adapter in adapters {
            match adapter.start(publisher.clone()).await {
                Ok(()) => tracing::info!("Started adapter '{}'", adapter.id()),
                Err(e) => {
                    tracing::error!("Failed to start adapter '{}': {}", adapter.id(), e);
                    failed.push(adapter.id().to_string());
                }
            }
        }
        failed
    }

    /// Stop every adapter concurrently, bounded by `window`.
    pub async fn stop_all(&self, window: Duration) {
        let adapters: Vec<Arc<dyn RelayAdapter>> = self.read().adapters.values().cloned().collect();
        let mut tasks = JoinSet::new();

        for adapter in adapters {
            tasks.spawn(async move {
                let id = adapter.id().to_string();
                match tokio::time::timeout(window, adapter.stop()).await {
                    Ok(Ok(())) => tracing::info!("Stopped adapter '{}'", id),
                    Ok(Err(e)) => tracing::warn!("Adapter '{}' failed to stop cleanly: {}", id, e),
                    Err(_) => tracing::warn!("Adapter '{}' did not stop within {:?}", id, window),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Adapter stop task failed: {}", e);
            }
        }
    }

    pub fn statuses(&self) -> Vec<AdapterInfo> {
        let tables = self.read();
        let mut infos: Vec<AdapterInfo> = tables
            .adapters
            .iter()
            .map(|(id, adapter)| {
                let mut subject_prefixes: Vec<String> = tables
                    .prefixes
                    .iter()
                    .filter(|(_, owner)| *owner == id)
                    .map(|(prefix, _)| prefix.clone())
                    .collect();
                subject_prefixes.sort();
                AdapterInfo {
                    id: id.clone(),
                    subject_prefixes,
                    status: adapter.status(),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::adapters::{AdapterState, StatusCell};
    use crate::protocol::EnvelopeBuilder;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Publisher for adapters that never publish back.
    pub(crate) struct NullPublisher;

    #[async_trait]
    impl RelayPublisher for NullPublisher {
        async fn publish(
            &self,
            _subject: &str,
            _payload: serde_json::Value,
            _options: crate::core::PublishOptions,
        ) -> Result<crate::core::PublishResult> {
            Err(Error::Delivery("no relay attached".to_string()))
        }

        async fn dead_letter(&self, _envelope: &Envelope, _reason: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Adapter that records deliveries and answers with a fixed outcome.
    pub(crate) struct StubAdapter {
        pub id: String,
        pub prefixes: Vec<String>,
        pub succeed: bool,
        pub panic: bool,
        pub calls: AtomicUsize,
        pub status: StatusCell,
    }

    impl StubAdapter {
        pub(crate) fn new(id: &str, prefix: &str) -> Self {
            Self {
                id: id.to_string(),
                prefixes: vec![prefix.to_string()],
                succeed: true,
                panic: false,
                calls: AtomicUsize::new(0),
                status: StatusCell::new(),
            }
        }

        pub(crate) fn failing(mut self) -> Self {
            self.succeed = false;
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RelayAdapter for StubAdapter {
        fn id(&self) -> &str {
            &self.id
        }

        fn subject_prefixes(&self) -> Vec<String> {
            self.prefixes.clone()
        }

        async fn start(&self, _relay: Arc<dyn RelayPublisher>) -> Result<()> {
            self.status.set_state(AdapterState::Running);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.status.set_state(AdapterState::Stopped);
            Ok(())
        }

        async fn deliver(
            &self,
            _subject: &str,
            _envelope: &Envelope,
            _context: Option<&AdapterContext>,
        ) -> DeliveryResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("stub adapter bug");
            }
            if self.succeed {
                DeliveryResult::delivered(0)
            } else {
                DeliveryResult::failed("stub refused", 0)
            }
        }

        fn status(&self) -> AdapterStatus {
            self.status.snapshot()
        }
    }

    fn envelope(subject: &str) -> Envelope {
        EnvelopeBuilder::new(subject, json!("hi")).build().unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let registry = AdapterRegistry::new();
        registry
            .register(Arc::new(StubAdapter::new("human", "relay.human.")))
            .unwrap();
        registry
            .register(Arc::new(StubAdapter::new("telegram", "relay.human.telegram.")))
            .unwrap();

        let routed = registry.route("relay.human.telegram.42").unwrap();
        assert_eq!(routed.id(), "telegram");
        let routed = registry.route("relay.human.slack.42").unwrap();
        assert_eq!(routed.id(), "human");
        assert!(registry.route("relay.agent.x").is_none());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(StubAdapter::new("a", "x."))).unwrap();
        assert!(registry.register(Arc::new(StubAdapter::new("a", "y."))).is_err());
    }

    #[test]
    fn test_prefix_takeover_and_unregister() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(StubAdapter::new("first", "x."))).unwrap();
        registry.register(Arc::new(StubAdapter::new("second", "x."))).unwrap();
        assert_eq!(registry.route("x.y").unwrap().id(), "second");

        registry.unregister("second").unwrap();
        assert!(registry.route("x.y").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_isolates_panic() {
        let registry = AdapterRegistry::new();
        let mut stub = StubAdapter::new("buggy", "relay.agent.");
        stub.panic = true;
        registry.register(Arc::new(stub)).unwrap();

        let result = registry
            .deliver("relay.agent.x", &envelope("relay.agent.x"), None)
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_deliver_without_route() {
        let registry = AdapterRegistry::new();
        let result = registry.deliver("a.b", &envelope("a.b"), None).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_statuses_list_prefixes() {
        let registry = AdapterRegistry::new();
        registry.register(Arc::new(StubAdapter::new("b", "b."))).unwrap();
        registry.register(Arc::new(StubAdapter::new("a", "a."))).unwrap();
        registry.stop_all(Duration::from_millis(100)).await;

        let statuses = registry.statuses();
        assert_eq!(statuses[0].id, "a");
        assert_eq!(statuses[0].subject_prefixes, vec!["a.".to_string()]);
        assert_eq!(statuses[0].status.state, AdapterState::Stopped);
    }
}
