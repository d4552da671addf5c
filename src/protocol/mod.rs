//! Relay protocol: subjects, envelopes and delivery types.
//!
//! - Subject validation and wildcard matching
//! - Immutable envelopes carrying hop/TTL/call budgets
//! - Delivery results, dead letters and adapter context

pub mod envelope;
pub mod subject;
pub mod types;

pub use envelope::{Budget, BudgetDefaults, BudgetOverrides, Envelope, EnvelopeBuilder, Parent};
pub use subject::{subject_matches, validate_pattern, validate_subject, SubjectMatcher};
pub use types::{
    AdapterContext, AgentInfo, DeadLetter, DeliveryResult, MessageStatus, PlatformInfo,
    PublishKind, TraceContext,
};
