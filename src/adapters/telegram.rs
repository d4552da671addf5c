//! Telegram outbound bridge: `relay.human.telegram.{chatId}` -> chat message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use teloxide::prelude::*;

use super::{
    elapsed_ms, AdapterState, AdapterStatus, InFlight, RelayAdapter, RelayPublisher, StatusCell,
    STOPPED_ERROR,
};
use crate::error::{Error, Result};
use crate::protocol::{AdapterContext, DeliveryResult, Envelope};

pub const TELEGRAM_PREFIX: &str = "relay.human.telegram.";

/// Telegram's per-message text limit.
const MAX_MESSAGE_CHARS: usize = 4096;

/// How long `stop()` waits for in-flight sends.
const STOP_WINDOW: Duration = Duration::from_secs(10);

fn default_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_token_env")]
    pub bot_token_env: String,
}

impl TelegramConfig {
    fn token(&self) -> Result<String> {
        if let Some(token) = self.bot_token.as_ref().filter(|t| !t.is_empty()) {
            return Ok(token.clone());
        }
        std::env::var(&self.bot_token_env).map_err(|_| {
            Error::Config(format!(
                "no bot token configured and ${} is not set",
                self.bot_token_env
            ))
        })
    }
}

pub struct TelegramAdapter {
    id: String,
    bot: Bot,
    in_flight: InFlight,
    status: StatusCell,
}

impl TelegramAdapter {
    pub fn new(id: impl Into<String>, config: &TelegramConfig) -> Result<Self> {
        Ok(Self::with_bot(id, Bot::new(config.token()?)))
    }

    pub fn with_bot(id: impl Into<String>, bot: Bot) -> Self {
        Self {
            id: id.into(),
            bot,
            in_flight: InFlight::new(),
            status: StatusCell::new(),
        }
    }

    async fn send(&self, subject: &str, envelope: &Envelope, started: Instant) -> DeliveryResult {
        self.status.record_in();

        let Some(chat) = chat_id(subject) else {
            let error = format!("no chat id in subject {}", subject);
            self.status.record_error(error.clone());
            return DeliveryResult::failed(error, elapsed_ms(started));
        };

        let text = render(envelope.payload());
        for part in chunks(&text) {
            if let Err(e) = self.bot.send_message(chat, part).await {
                let error = format!("telegram send failed: {}", e);
                tracing::warn!("{} ({})", error, envelope.id());
                self.status.record_error(error.clone());
                return DeliveryResult::failed(error, elapsed_ms(started));
            }
        }

        self.status.record_out();
        DeliveryResult::delivered(elapsed_ms(started))
    }
}

/// Chat id from the final subject token.
fn chat_id(subject: &str) -> Option<ChatId> {
    subject
        .strip_prefix(TELEGRAM_PREFIX)
        .filter(|rest| !rest.contains('.'))
        .and_then(|rest| rest.parse::<i64>().ok())
        .map(ChatId)
}

/// Human-readable text for a payload.
fn render(payload: &Value) -> String {
    if let Some(text) = payload.as_str() {
        return text.to_string();
    }
    if payload.get("type").and_then(Value::as_str) == Some("error") {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return format!("Error: {}", message);
    }
    ["text", "content", "message"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}

/// Split text into Telegram-sized chunks on char boundaries.
fn chunks(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(MAX_MESSAGE_CHARS)
        .map(|c| c.iter().collect())
        .collect()
}

#[async_trait]
impl RelayAdapter for TelegramAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject_prefixes(&self) -> Vec<String> {
        vec![TELEGRAM_PREFIX.to_string()]
    }

    async fn start(&self, _relay: Arc<dyn RelayPublisher>) -> Result<()> {
        self.in_flight.reopen();
        self.status.set_state(AdapterState::Running);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.status.set_state(AdapterState::Stopping);
        if !self.in_flight.drain(STOP_WINDOW).await {
            tracing::warn!(
                "Telegram '{}' stopped with {} send(s) still running",
                self.id,
                self.in_flight.len()
            );
        }
        self.status.set_state(AdapterState::Stopped);
        Ok(())
    }

    async fn deliver(
        &self,
        subject: &str,
        envelope: &Envelope,
        _context: Option<&AdapterContext>,
    ) -> DeliveryResult {
        let started = Instant::now();
        self.in_flight
            .run(self.send(subject, envelope, started))
            .await
            .unwrap_or_else(|| DeliveryResult::failed(STOPPED_ERROR, elapsed_ms(started)))
    }

    fn status(&self) -> AdapterStatus {
        self.status.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_id_from_subject() {
        assert_eq!(chat_id("relay.human.telegram.12345"), Some(ChatId(12345)));
        assert_eq!(chat_id("relay.human.telegram.-100200"), Some(ChatId(-100200)));
        assert_eq!(chat_id("relay.human.telegram.abc"), None);
        assert_eq!(chat_id("relay.human.telegram.1.2"), None);
        assert_eq!(chat_id("relay.human.slack.1"), None);
    }

    #[test]
    fn test_render_runtime_events() {
        assert_eq!(render(&json!("plain")), "plain");
        assert_eq!(render(&json!({"type": "done", "text": "All set"})), "All set");
        assert_eq!(
            render(&json!({"type": "error", "message": "boom"})),
            "Error: boom"
        );
    }

    #[test]
    fn test_chunks_respect_limit() {
        let text = "é".repeat(MAX_MESSAGE_CHARS + 10);
        let parts = chunks(&text);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chars().count(), MAX_MESSAGE_CHARS);
        assert!(chunks("").is_empty());
    }

    #[tokio::test]
    async fn test_deliver_refused_after_stop() {
        let adapter = TelegramAdapter::with_bot("tg", Bot::new("12345:offline"));
        let env = crate::protocol::EnvelopeBuilder::new("relay.human.telegram.42", json!("hi"))
            .build()
            .unwrap();

        adapter.stop().await.unwrap();
        let refused = adapter.deliver(env.subject(), &env, None).await;
        assert_eq!(refused.error.as_deref(), Some(STOPPED_ERROR));
        assert_eq!(adapter.status().messages_in, 0);

        // Restarted adapters accept work again; a subject without a chat id
        // fails before any network call.
        let relay: Arc<dyn RelayPublisher> = Arc::new(crate::adapters::registry::tests::NullPublisher);
        adapter.start(relay).await.unwrap();
        let result = adapter.deliver("relay.human.slack.1", &env, None).await;
        assert!(result.error.unwrap().contains("no chat id"));
        assert_eq!(adapter.status().messages_in, 1);
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let config = TelegramConfig {
            bot_token: None,
            bot_token_env: "AGENT_RELAY_TEST_UNSET_TOKEN".to_string(),
        };
        assert!(matches!(
            TelegramAdapter::new("tg", &config),
            Err(Error::Config(_))
        ));
    }
}
