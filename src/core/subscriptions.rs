//! In-memory subscriber registry.
//!
//! Subscribers receive both durable messages and ephemeral signals for any
//! subject their pattern matches. Nothing here touches disk.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::error::Result;
use crate::protocol::{Envelope, SubjectMatcher};

/// Subscriber callback. An `Err` counts as a failed delivery to that subscriber.
pub type Handler = Arc<dyn Fn(&Envelope) -> std::result::Result<(), String> + Send + Sync>;

#[derive(Default)]
struct Inner {
    matcher: SubjectMatcher<u64>,
    handlers: HashMap<u64, (String, Handler)>,
    next_id: u64,
}

/// Outcome of fanning one envelope out to subscribers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanOut {
    pub matched: usize,
    pub delivered: usize,
    pub errors: Vec<String>,
}

#[derive(Clone, Default)]
pub struct Subscriptions {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Subscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriptions")
            .field("count", &self.len())
            .finish()
    }
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attach a handler to a subject pattern.
    pub fn subscribe(&self, pattern: &str, handler: Handler) -> Result<Subscription> {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.matcher.insert(pattern, id)?;
        inner.next_id += 1;
        inner.handlers.insert(id, (pattern.to_string(), handler));
        tracing::debug!("Subscribed #{} to {}", id, pattern);

        Ok(Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
            active: true,
        })
    }

    fn detach(inner: &Mutex<Inner>, id: u64) {
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((pattern, _)) = inner.handlers.remove(&id) {
            inner.matcher.remove(&pattern, &id);
            tracing::debug!("Unsubscribed #{} from {}", id, pattern);
        }
    }

    /// Number of subscribers whose pattern matches `subject`.
    pub fn count_matching(&self, subject: &str) -> usize {
        self.lock().matcher.matches(subject).len()
    }

    /// Invoke every matching handler. Handlers run outside the registry lock,
    /// and a failing or panicking handler does not affect the others.
    pub fn dispatch(&self, envelope: &Envelope) -> FanOut {
        let handlers: Vec<(u64, Handler)> = {
            let inner = self.lock();
            inner
                .matcher
                .matches(envelope.subject())
                .into_iter()
                .filter_map(|id| inner.handlers.get(&id).map(|(_, h)| (id, h.clone())))
                .collect()
        };

        let mut out = FanOut {
            matched: handlers.len(),
            ..Default::default()
        };

        for (id, handler) in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => out.delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!("Subscriber #{} failed on {}: {}", id, envelope.subject(), e);
                    out.errors.push(format!("subscriber #{}: {}", id, e));
                }
                Err(_) => {
                    tracing::error!("Subscriber #{} panicked on {}", id, envelope.subject());
                    out.errors.push(format!("subscriber #{}: panicked", id));
                }
            }
        }

        out
    }
}

/// Handle returned by `subscribe`. Dropping it detaches the handler.
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Inner>>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.registry.upgrade() {
            Subscriptions::detach(&inner, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Wrap a closure as a `Handler`.
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Envelope) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EnvelopeBuilder;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(subject: &str) -> Envelope {
        EnvelopeBuilder::new(subject, json!("ping")).build().unwrap()
    }

    fn counter() -> (Arc<AtomicUsize>, Handler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let h = handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (count, h)
    }

    #[test]
    fn test_dispatch_to_matching_patterns() {
        let subs = Subscriptions::new();
        let (exact, h1) = counter();
        let (wild, h2) = counter();
        let (other, h3) = counter();
        let _a = subs.subscribe("relay.agent.proj1.bot", h1).unwrap();
        let _b = subs.subscribe("relay.agent.>", h2).unwrap();
        let _c = subs.subscribe("relay.human.*", h3).unwrap();

        let out = subs.dispatch(&envelope("relay.agent.proj1.bot"));
        assert_eq!(out.matched, 2);
        assert_eq!(out.delivered, 2);
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(wild.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_detaches() {
        let subs = Subscriptions::new();
        let (count, h) = counter();
        let sub = subs.subscribe("a.b", h).unwrap();
        assert_eq!(subs.len(), 1);

        drop(sub);
        assert!(subs.is_empty());
        assert_eq!(subs.dispatch(&envelope("a.b")).matched, 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_leaves_others() {
        let subs = Subscriptions::new();
        let (_, h1) = counter();
        let (kept, h2) = counter();
        let first = subs.subscribe("a.*", h1).unwrap();
        let _second = subs.subscribe("a.*", h2).unwrap();

        first.unsubscribe();
        let out = subs.dispatch(&envelope("a.b"));
        assert_eq!(out.matched, 1);
        assert_eq!(kept.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_handler_is_isolated() {
        let subs = Subscriptions::new();
        let (count, ok) = counter();
        let _bad = subs
            .subscribe("a.b", handler(|_| Err("boom".to_string())))
            .unwrap();
        let _panics = subs.subscribe("a.b", handler(|_| panic!("handler bug"))).unwrap();
        let _good = subs.subscribe("a.b", ok).unwrap();

        let out = subs.dispatch(&envelope("a.b"));
        assert_eq!(out.matched, 3);
        assert_eq!(out.delivered, 1);
        assert_eq!(out.errors.len(), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let subs = Subscriptions::new();
        let (_, h) = counter();
        assert!(subs.subscribe("a.>.b", h).is_err());
        assert!(subs.is_empty());
    }
}
