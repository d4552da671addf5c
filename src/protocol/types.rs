//! Shared types for the relay protocol.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::envelope::Envelope;

/// Durable message or ephemeral signal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PublishKind {
    #[default]
    Message,
    Signal,
}

/// Delivery status of a message in an endpoint mailbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "delivered" => Some(MessageStatus::Delivered),
            "failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure record for an unroutable or undeliverable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub endpoint_hash: Option<String>,
    pub message_id: String,
    pub reason: String,
    pub envelope: Envelope,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(envelope: &Envelope, endpoint_hash: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            endpoint_hash: endpoint_hash.map(str::to_string),
            message_id: envelope.id().to_string(),
            reason: reason.into(),
            envelope: envelope.clone(),
            failed_at: Utc::now(),
        }
    }
}

/// Outcome of a single delivery attempt. Returned, never raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub dead_lettered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_message_id: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl DeliveryResult {
    pub fn delivered(duration_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duration_ms,
            ..Default::default()
        }
    }

    pub fn with_dead_lettered(mut self) -> Self {
        self.dead_lettered = true;
        self
    }

    pub fn with_response(mut self, message_id: Option<String>) -> Self {
        self.response_message_id = message_id;
        self
    }
}

/// Agent identity resolved for a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub directory: PathBuf,
    pub runtime: String,
    #[serde(default)]
    pub manifest: Value,
}

/// Originating platform details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub name: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Trace identifiers propagated to adapters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

/// Optional delivery-time enrichment. Adapters must work without it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AdapterContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceContext>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [MessageStatus::Pending, MessageStatus::Delivered, MessageStatus::Failed] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse("read"), None);
    }

    #[test]
    fn test_delivery_result_serializes_camel_case() {
        let result = DeliveryResult::failed("Adapter at capacity", 0).with_dead_lettered();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["deadLettered"], true);
        assert_eq!(json["error"], "Adapter at capacity");
        assert!(json.get("responseMessageId").is_none());
    }
}
