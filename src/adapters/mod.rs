//! Delivery adapters.
//!
//! An adapter owns one or more subject prefixes and bridges messages on those
//! subjects to something outside the relay: an agent runtime, a webhook, a
//! chat platform. Adapters are registered with the `AdapterRegistry`, which
//! routes each published message to at most one adapter.

pub mod loader;
pub mod plugin;
pub mod registry;
pub mod runtime_agent;
pub mod telegram;
pub mod webhook;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::task::TaskTracker;

use crate::core::{PublishOptions, PublishResult};
use crate::error::Result;
use crate::protocol::{AdapterContext, DeliveryResult, Envelope};

pub use loader::{load_adapters, BuiltinAdapters, LoadFailure, LoadedAdapters};
pub use registry::{AdapterInfo, AdapterRegistry};
pub use runtime_agent::RuntimeAgentAdapter;

/// Handle adapters use to publish back into the relay (replies, signals).
#[async_trait]
pub trait RelayPublisher: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<PublishResult>;

    /// Record a terminal failure for an envelope the adapter gave up on.
    async fn dead_letter(&self, envelope: &Envelope, reason: &str) -> Result<()>;
}

/// A delivery adapter.
///
/// `deliver` never fails with an `Err`: every outcome, including refusal, is
/// reported through the returned `DeliveryResult`.
#[async_trait]
pub trait RelayAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Subject prefixes this adapter handles, e.g. `relay.human.telegram.`.
    fn subject_prefixes(&self) -> Vec<String>;

    async fn start(&self, relay: Arc<dyn RelayPublisher>) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        context: Option<&AdapterContext>,
    ) -> DeliveryResult;

    fn status(&self) -> AdapterStatus;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AdapterState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Point-in-time adapter health and counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterStatus {
    pub state: AdapterState,
    pub messages_in: u64,
    pub messages_out: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Shared mutable status for adapter implementations.
#[derive(Debug, Default)]
pub struct StatusCell(Mutex<AdapterStatus>);

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut AdapterStatus)) {
        let mut status = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    pub fn snapshot(&self) -> AdapterStatus {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_state(&self, state: AdapterState) {
        self.update(|s| {
            s.state = state;
            if state == AdapterState::Running {
                s.started_at = Some(Utc::now());
            }
        });
    }

    pub fn record_in(&self) {
        self.update(|s| s.messages_in += 1);
    }

    pub fn record_out(&self) {
        self.update(|s| s.messages_out += 1);
    }

    pub fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.update(|s| {
            s.errors += 1;
            s.last_error = Some(error);
        });
    }
}

/// Slot holding the publisher handed to an adapter on `start()`.
#[derive(Default)]
pub struct PublisherSlot(Mutex<Option<Arc<dyn RelayPublisher>>>);

impl PublisherSlot {
    pub fn set(&self, publisher: Arc<dyn RelayPublisher>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(publisher);
    }

    pub fn clear(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn get(&self) -> Option<Arc<dyn RelayPublisher>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for PublisherSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherSlot")
            .field("attached", &self.get().is_some())
            .finish()
    }
}

/// Error text for deliveries refused by a stopped adapter.
pub const STOPPED_ERROR: &str = "adapter stopped";

/// Tracks in-flight deliveries so `stop()` can wait for them.
///
/// Closed by `drain`; reopened when the adapter starts again.
#[derive(Debug, Default)]
pub struct InFlight(TaskTracker);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reopen(&self) {
        self.0.reopen();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Run `delivery` as tracked work; `None` once closed.
    pub async fn run<F: Future>(&self, delivery: F) -> Option<F::Output> {
        if self.0.is_closed() {
            return None;
        }
        Some(self.0.track_future(delivery).await)
    }

    /// Refuse new work and wait up to `window` for running work to finish.
    /// Returns whether everything finished in time.
    pub async fn drain(&self, window: Duration) -> bool {
        self.0.close();
        tokio::time::timeout(window, self.0.wait()).await.is_ok()
    }
}

/// Milliseconds elapsed since `start`, for `DeliveryResult::duration_ms`.
pub(crate) fn elapsed_ms(start: std::time::Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_cell_counters() {
        let cell = StatusCell::new();
        cell.set_state(AdapterState::Running);
        cell.record_in();
        cell.record_in();
        cell.record_out();
        cell.record_error("timeout");

        let status = cell.snapshot();
        assert_eq!(status.state, AdapterState::Running);
        assert!(status.started_at.is_some());
        assert_eq!(status.messages_in, 2);
        assert_eq!(status.messages_out, 1);
        assert_eq!(status.errors, 1);
        assert_eq!(status.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_in_flight_drain_waits_then_refuses() {
        let in_flight = Arc::new(InFlight::new());
        let (release, gate) = tokio::sync::oneshot::channel::<()>();

        let running = in_flight.clone();
        let task = tokio::spawn(async move {
            running
                .run(async move {
                    let _ = gate.await;
                    7
                })
                .await
        });
        while in_flight.is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(!in_flight.drain(Duration::from_millis(20)).await);
        assert_eq!(in_flight.run(async { 1 }).await, None);

        release.send(()).unwrap();
        assert_eq!(task.await.unwrap(), Some(7));
        assert!(in_flight.drain(Duration::from_millis(20)).await);

        in_flight.reopen();
        assert_eq!(in_flight.run(async { 1 }).await, Some(1));
    }

    #[test]
    fn test_status_serializes_lowercase_state() {
        let json = serde_json::to_value(AdapterStatus::default()).unwrap();
        assert_eq!(json["state"], "stopped");
        assert_eq!(json["messagesIn"], 0);
    }
}
