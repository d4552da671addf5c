//! Webhook bridge: POSTs each message on its prefixes to an HTTP endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    elapsed_ms, AdapterState, AdapterStatus, InFlight, RelayAdapter, RelayPublisher, StatusCell,
    STOPPED_ERROR,
};
use crate::error::{Error, Result};
use crate::protocol::{AdapterContext, DeliveryResult, Envelope};

fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Prefixes {
    One(String),
    Many(Vec<String>),
}

impl Prefixes {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Prefixes::One(p) => vec![p],
            Prefixes::Many(ps) => ps,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,
    pub subject_prefix: Prefixes,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Serialize)]
struct WebhookBody<'a> {
    subject: &'a str,
    envelope: &'a Envelope,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a AdapterContext>,
}

pub struct WebhookAdapter {
    id: String,
    url: String,
    prefixes: Vec<String>,
    headers: BTreeMap<String, String>,
    client: Client,
    timeout: Duration,
    in_flight: InFlight,
    status: StatusCell,
}

impl WebhookAdapter {
    pub fn new(id: impl Into<String>, config: WebhookConfig) -> Result<Self> {
        let id = id.into();
        if !config.url.starts_with("http://") && !config.url.starts_with("https://") {
            return Err(Error::Config(format!(
                "webhook '{}' url must be http(s): {}",
                id, config.url
            )));
        }
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("webhook '{}' client: {}", id, e)))?;

        Ok(Self {
            id,
            url: config.url,
            prefixes: config.subject_prefix.into_vec(),
            headers: config.headers,
            client,
            timeout,
            in_flight: InFlight::new(),
            status: StatusCell::new(),
        })
    }

    async fn post(
        &self,
        subject: &str,
        envelope: &Envelope,
        context: Option<&AdapterContext>,
        started: Instant,
    ) -> DeliveryResult {
        self.status.record_in();

        let mut request = self.client.post(&self.url).json(&WebhookBody {
            subject,
            envelope,
            context,
        });
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let error = match request.send().await {
            Ok(response) if response.status().is_success() => {
                self.status.record_out();
                return DeliveryResult::delivered(elapsed_ms(started));
            }
            Ok(response) => format!("webhook returned {}", response.status()),
            Err(e) if e.is_timeout() => "webhook timed out".to_string(),
            Err(e) => format!("webhook request failed: {}", e),
        };

        tracing::warn!("Webhook '{}' failed for {}: {}", self.id, envelope.id(), error);
        self.status.record_error(error.clone());
        DeliveryResult::failed(error, elapsed_ms(started))
    }
}

#[async_trait]
impl RelayAdapter for WebhookAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn subject_prefixes(&self) -> Vec<String> {
        self.prefixes.clone()
    }

    async fn start(&self, _relay: Arc<dyn RelayPublisher>) -> Result<()> {
        self.in_flight.reopen();
        self.status.set_state(AdapterState::Running);
        Ok(())
    }

    /// Waits for in-flight requests; none can outlive the request timeout.
    async fn stop(&self) -> Result<()> {
        self.status.set_state(AdapterState::Stopping);
        if !self.in_flight.drain(self.timeout).await {
            tracing::warn!(
                "Webhook '{}' stopped with {} request(s) still running",
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
        context: Option<&AdapterContext>,
    ) -> DeliveryResult {
        let started = Instant::now();
        self.in_flight
            .run(self.post(subject, envelope, context, started))
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
    use crate::protocol::EnvelopeBuilder;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering with `status` after `delay_ms`; returns
    /// the request text.
    async fn serve_once(status: u16, delay_ms: u64) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut request = String::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.push_str(&String::from_utf8_lossy(&buf[..n]));
                if let Some(idx) = request.find("\r\n\r\n") {
                    let length = request[..idx]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= idx + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let response = format!("HTTP/1.1 {} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
            socket.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (url, handle)
    }

    fn config(url: String) -> WebhookConfig {
        serde_json::from_value(json!({
            "url": url,
            "subjectPrefix": ["relay.webhook.ci."],
            "headers": {"x-relay-token": "secret"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_posts_envelope() {
        let (url, server) = serve_once(200, 0).await;
        let adapter = WebhookAdapter::new("ci", config(url)).unwrap();
        let env = EnvelopeBuilder::new("relay.webhook.ci.build", json!({"ok": true}))
            .build()
            .unwrap();

        let result = adapter.deliver(env.subject(), &env, None).await;
        assert!(result.success, "{:?}", result.error);

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("x-relay-token: secret"));
        assert!(request.contains(env.id()));
        assert_eq!(adapter.status().messages_out, 1);
    }

    #[tokio::test]
    async fn test_non_2xx_fails() {
        let (url, server) = serve_once(503, 0).await;
        let adapter = WebhookAdapter::new("ci", config(url)).unwrap();
        let env = EnvelopeBuilder::new("relay.webhook.ci.build", json!("x"))
            .build()
            .unwrap();

        let result = adapter.deliver(env.subject(), &env, None).await;
        server.await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("503"));
        assert_eq!(adapter.status().errors, 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_request_then_refuses() {
        let (url, server) = serve_once(200, 200).await;
        let adapter = Arc::new(WebhookAdapter::new("ci", config(url)).unwrap());
        let env = EnvelopeBuilder::new("relay.webhook.ci.build", json!("x"))
            .build()
            .unwrap();

        let delivering = adapter.clone();
        let sent = env.clone();
        let delivery =
            tokio::spawn(async move { delivering.deliver(sent.subject(), &sent, None).await });
        while adapter.status().messages_in == 0 {
            tokio::task::yield_now().await;
        }

        adapter.stop().await.unwrap();
        assert_eq!(adapter.status().state, AdapterState::Stopped);
        assert_eq!(adapter.status().messages_out, 1);
        assert!(delivery.await.unwrap().success);
        server.await.unwrap();

        let refused = adapter.deliver(env.subject(), &env, None).await;
        assert!(!refused.success);
        assert_eq!(refused.error.as_deref(), Some(STOPPED_ERROR));
        assert_eq!(adapter.status().messages_in, 1);
    }

    #[test]
    fn test_single_prefix_and_bad_url() {
        let cfg: WebhookConfig = serde_json::from_value(json!({
            "url": "ftp://example.com",
            "subjectPrefix": "relay.webhook."
        }))
        .unwrap();
        assert_eq!(cfg.subject_prefix.clone().into_vec(), vec!["relay.webhook.".to_string()]);
        assert!(WebhookAdapter::new("x", cfg).is_err());
    }
}
