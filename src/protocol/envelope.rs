//! Message envelopes with anti-runaway budgets.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Default maximum hops for a causal chain.
pub const DEFAULT_MAX_HOPS: u32 = 5;

/// Default time-to-live in seconds.
pub const DEFAULT_TTL_SECS: i64 = 3600;

/// Default number of publishes a chain may perform.
pub const DEFAULT_CALL_BUDGET: u32 = 10;

/// Hop, TTL and call-count limits carried by every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub max_hops: u32,
    pub hops_used: u32,
    /// Ancestor message IDs, oldest first.
    pub ancestor_chain: Vec<String>,
    /// Absolute expiry instant.
    pub ttl: DateTime<Utc>,
    pub call_budget_remaining: u32,
}

impl Budget {
    /// Fresh budget for a root message.
    pub fn root(defaults: &BudgetDefaults) -> Self {
        Self {
            max_hops: defaults.max_hops,
            hops_used: 0,
            ancestor_chain: Vec::new(),
            ttl: Utc::now() + Duration::seconds(defaults.ttl_secs),
            call_budget_remaining: defaults.call_budget,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.ttl
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> std::time::Duration {
        (self.ttl - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Check the hop and call limits. Expiry is checked separately because it
    /// settles as a dead letter instead of a rejection.
    pub fn check(&self) -> Result<()> {
        if self.hops_used >= self.max_hops {
            return Err(Error::BudgetExceeded(format!(
                "hop limit reached ({}/{})",
                self.hops_used, self.max_hops
            )));
        }
        if self.call_budget_remaining == 0 {
            return Err(Error::BudgetExceeded("call budget exhausted".to_string()));
        }
        Ok(())
    }

    /// Budget for the next hop.
    fn advance(&self, parent_id: Option<&str>) -> Self {
        let mut next = self.clone();
        next.hops_used += 1;
        next.call_budget_remaining -= 1;
        if let Some(id) = parent_id {
            next.ancestor_chain.push(id.to_string());
        }
        next
    }
}

/// Configurable defaults for root budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetDefaults {
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_call_budget")]
    pub call_budget: u32,
}

fn default_max_hops() -> u32 {
    DEFAULT_MAX_HOPS
}

fn default_ttl_secs() -> i64 {
    DEFAULT_TTL_SECS
}

fn default_call_budget() -> u32 {
    DEFAULT_CALL_BUDGET
}

impl Default for BudgetDefaults {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            ttl_secs: DEFAULT_TTL_SECS,
            call_budget: DEFAULT_CALL_BUDGET,
        }
    }
}

/// Per-publish overrides applied on top of the computed budget.
///
/// On a root publish they set the limits. On a causal child they can only
/// tighten what the parent passed down, and extra ancestor ids are appended
/// after the inherited chain.
#[derive(Debug, Clone, Default)]
pub struct BudgetOverrides {
    pub max_hops: Option<u32>,
    pub hops_used: Option<u32>,
    pub ttl: Option<DateTime<Utc>>,
    pub call_budget_remaining: Option<u32>,
    pub ancestor_chain: Option<Vec<String>>,
}

impl BudgetOverrides {
    fn apply(&self, mut budget: Budget, inherited: bool) -> Budget {
        if let Some(v) = self.max_hops {
            budget.max_hops = if inherited { budget.max_hops.min(v) } else { v };
        }
        if let Some(v) = self.hops_used {
            // Overrides never walk a chain backwards.
            budget.hops_used = budget.hops_used.max(v);
        }
        if let Some(v) = self.ttl {
            budget.ttl = if inherited { budget.ttl.min(v) } else { v };
        }
        if let Some(v) = self.call_budget_remaining {
            budget.call_budget_remaining = if inherited {
                budget.call_budget_remaining.min(v)
            } else {
                v
            };
        }
        if let Some(chain) = &self.ancestor_chain {
            if inherited {
                let known = budget.ancestor_chain.clone();
                budget
                    .ancestor_chain
                    .extend(chain.iter().filter(|id| !known.contains(id)).cloned());
            } else {
                budget.ancestor_chain = chain.clone();
            }
        }
        budget
    }
}

/// First id that appears twice in a chain.
fn repeated_ancestor(chain: &[String]) -> Option<&str> {
    let mut seen = HashSet::new();
    for id in chain {
        if !seen.insert(id.as_str()) {
            return Some(id);
        }
    }
    None
}

/// The causal parent of a publish: its id and budget.
#[derive(Debug, Clone)]
pub struct Parent {
    pub id: String,
    pub budget: Budget,
}

impl From<&Envelope> for Parent {
    fn from(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id.clone(),
            budget: envelope.budget.clone(),
        }
    }
}

/// Immutable wrapper around a published payload.
///
/// Fields are private; an envelope is only constructed through
/// [`EnvelopeBuilder`] and read through accessors afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    id: String,
    subject: String,
    payload: Value,
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    created_at: DateTime<Utc>,
    budget: Budget,
}

impl Envelope {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn is_expired(&self) -> bool {
        self.budget.is_expired()
    }

    /// `Err(Expired)` once the TTL has passed.
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::Expired(self.id.clone()));
        }
        Ok(())
    }
}

/// Builder for envelopes; `build` runs the budget checks.
pub struct EnvelopeBuilder {
    subject: String,
    payload: Value,
    from: String,
    reply_to: Option<String>,
    parent: Option<Parent>,
    overrides: BudgetOverrides,
    defaults: BudgetDefaults,
}

impl EnvelopeBuilder {
    pub fn new(subject: impl Into<String>, payload: Value) -> Self {
        Self {
            subject: subject.into(),
            payload,
            from: "anonymous".to_string(),
            reply_to: None,
            parent: None,
            overrides: BudgetOverrides::default(),
            defaults: BudgetDefaults::default(),
        }
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn parent(mut self, parent: Option<Parent>) -> Self {
        self.parent = parent;
        self
    }

    pub fn overrides(mut self, overrides: BudgetOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn defaults(mut self, defaults: BudgetDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Compute the budget this publish would run under, before allocation.
    pub fn effective_budget(&self) -> Budget {
        match &self.parent {
            Some(parent) => self.overrides.apply(parent.budget.clone(), true),
            None => self.overrides.apply(Budget::root(&self.defaults), false),
        }
    }

    /// Run hop, call and cycle checks and allocate the envelope.
    ///
    /// The returned envelope may already be expired; callers decide how to
    /// settle it.
    pub fn build(self) -> Result<Envelope> {
        let budget = self.effective_budget();
        budget.check()?;

        let parent_id = self.parent.as_ref().map(|p| p.id.as_str());
        let budget = budget.advance(parent_id);
        if let Some(id) = repeated_ancestor(&budget.ancestor_chain) {
            return Err(Error::CycleDetected(id.to_string()));
        }

        Ok(Envelope {
            id: generate_id(),
            budget,
            subject: self.subject,
            payload: self.payload,
            from: self.from,
            reply_to: self.reply_to,
            created_at: Utc::now(),
        })
    }
}

fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn root() -> Envelope {
        EnvelopeBuilder::new("relay.agent.proj1.bot", json!({"content": "hi"}))
            .from("relay.human.console.c1")
            .build()
            .unwrap()
    }

    #[test]
    fn test_root_envelope() {
        let envelope = root();
        assert_eq!(envelope.subject(), "relay.agent.proj1.bot");
        assert_eq!(envelope.from(), "relay.human.console.c1");
        assert_eq!(envelope.budget().hops_used, 1);
        assert_eq!(envelope.budget().call_budget_remaining, DEFAULT_CALL_BUDGET - 1);
        assert!(envelope.budget().ancestor_chain.is_empty());
        assert!(!envelope.is_expired());
    }

    #[test]
    fn test_hops_increase_along_chain() {
        let first = root();
        let second = EnvelopeBuilder::new("relay.human.console.c1", json!("ok"))
            .parent(Some(Parent::from(&first)))
            .build()
            .unwrap();

        assert_eq!(second.budget().hops_used, first.budget().hops_used + 1);
        assert_eq!(second.budget().ancestor_chain, vec![first.id().to_string()]);
    }

    #[test]
    fn test_hop_limit_rejected() {
        let result = EnvelopeBuilder::new("a.b", json!(null))
            .overrides(BudgetOverrides {
                max_hops: Some(3),
                hops_used: Some(3),
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(Error::BudgetExceeded(_))));
    }

    #[test]
    fn test_overrides_never_lower_hops() {
        let first = root();
        let budget = EnvelopeBuilder::new("a.b", json!(null))
            .parent(Some(Parent::from(&first)))
            .overrides(BudgetOverrides {
                hops_used: Some(0),
                ..Default::default()
            })
            .effective_budget();
        assert_eq!(budget.hops_used, first.budget().hops_used);
    }

    #[test]
    fn test_cycle_detected() {
        let first = root();
        let mut parent = Parent::from(&first);
        parent.budget.ancestor_chain.push(first.id().to_string());

        let result = EnvelopeBuilder::new("a.b", json!(null))
            .parent(Some(parent))
            .build();
        assert!(matches!(result, Err(Error::CycleDetected(_))));
    }

    #[test]
    fn test_child_cannot_lift_inherited_limits() {
        let first = EnvelopeBuilder::new("a.b", json!(null))
            .overrides(BudgetOverrides {
                max_hops: Some(2),
                ..Default::default()
            })
            .build()
            .unwrap();
        let second = EnvelopeBuilder::new("a.b", json!(null))
            .parent(Some(Parent::from(&first)))
            .build()
            .unwrap();
        assert_eq!(second.budget().hops_used, 2);

        let result = EnvelopeBuilder::new("a.b", json!(null))
            .parent(Some(Parent::from(&second)))
            .overrides(BudgetOverrides {
                max_hops: Some(1000),
                call_budget_remaining: Some(1000),
                ancestor_chain: Some(Vec::new()),
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(Error::BudgetExceeded(_))));
    }

    #[test]
    fn test_child_overrides_only_tighten() {
        let first = root();
        let parent = Parent::from(&first);

        let loose = EnvelopeBuilder::new("a.b", json!(null))
            .parent(Some(parent.clone()))
            .overrides(BudgetOverrides {
                max_hops: Some(50),
                ttl: Some(first.budget().ttl + Duration::hours(5)),
                call_budget_remaining: Some(500),
                ..Default::default()
            })
            .effective_budget();
        assert_eq!(loose.max_hops, first.budget().max_hops);
        assert_eq!(loose.ttl, first.budget().ttl);
        assert_eq!(loose.call_budget_remaining, first.budget().call_budget_remaining);

        let tight = EnvelopeBuilder::new("a.b", json!(null))
            .parent(Some(parent))
            .overrides(BudgetOverrides {
                max_hops: Some(3),
                ttl: Some(first.budget().ttl - Duration::minutes(30)),
                call_budget_remaining: Some(2),
                ..Default::default()
            })
            .effective_budget();
        assert_eq!(tight.max_hops, 3);
        assert_eq!(tight.ttl, first.budget().ttl - Duration::minutes(30));
        assert_eq!(tight.call_budget_remaining, 2);
    }

    #[test]
    fn test_child_chain_is_append_only() {
        let first = root();
        let second = EnvelopeBuilder::new("a.b", json!(null))
            .parent(Some(Parent::from(&first)))
            .build()
            .unwrap();

        let third = EnvelopeBuilder::new("a.b", json!(null))
            .parent(Some(Parent::from(&second)))
            .overrides(BudgetOverrides {
                ancestor_chain: Some(vec!["external-1".to_string()]),
                ..Default::default()
            })
            .build()
            .unwrap();
        assert_eq!(
            third.budget().ancestor_chain,
            vec![
                first.id().to_string(),
                "external-1".to_string(),
                second.id().to_string()
            ]
        );
    }

    #[test]
    fn test_repeated_ancestor_is_cycle() {
        let result = EnvelopeBuilder::new("a.b", json!(null))
            .overrides(BudgetOverrides {
                ancestor_chain: Some(vec!["m1".to_string(), "m2".to_string(), "m1".to_string()]),
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(Error::CycleDetected(id)) if id == "m1"));
    }

    #[test]
    fn test_call_budget_exhausted() {
        let result = EnvelopeBuilder::new("a.b", json!(null))
            .overrides(BudgetOverrides {
                call_budget_remaining: Some(0),
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(Error::BudgetExceeded(_))));
    }

    #[test]
    fn test_expired_envelope_is_still_built() {
        let envelope = EnvelopeBuilder::new("a.b", json!(null))
            .overrides(BudgetOverrides {
                ttl: Some(Utc::now() - Duration::seconds(5)),
                ..Default::default()
            })
            .build()
            .unwrap();
        assert!(envelope.is_expired());
        assert_eq!(envelope.budget().remaining(), std::time::Duration::ZERO);
        assert!(matches!(envelope.ensure_live(), Err(Error::Expired(id)) if id == envelope.id()));
        assert!(root().ensure_live().is_ok());
    }
}
