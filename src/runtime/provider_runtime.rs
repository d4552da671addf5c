//! `AgentRuntime` backed by a one-shot `Provider` completion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::{AgentRuntime, EventStream, Provider, RuntimeEvent, SendOptions, SessionOptions};
use crate::error::Result;

const EVENT_BUFFER: usize = 32;

pub struct ProviderRuntime {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    default_cwd: Option<PathBuf>,
    sessions: Mutex<HashMap<String, SessionOptions>>,
}

impl ProviderRuntime {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            model: None,
            default_cwd: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_default_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.default_cwd = cwd;
        self
    }

    fn session_cwd(&self, session_id: &str) -> Option<PathBuf> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .and_then(|s| s.cwd.clone())
    }
}

#[async_trait]
impl AgentRuntime for ProviderRuntime {
    async fn ensure_session(&self, session_id: &str, options: &SessionOptions) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if !sessions.contains_key(session_id) {
            tracing::debug!("New {} session {}", self.provider.name(), session_id);
        }
        sessions.insert(session_id.to_string(), options.clone());
        Ok(())
    }

    async fn send_message(
        &self,
        session_id: &str,
        content: &str,
        options: SendOptions,
    ) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let provider = self.provider.clone();
        let model = self.model.clone();
        let cwd = options
            .cwd
            .or_else(|| self.session_cwd(session_id))
            .or_else(|| self.default_cwd.clone());
        let session_id = session_id.to_string();
        let content = content.to_string();
        let system = options.system_context;
        let cancel = options.cancel;

        tokio::spawn(async move {
            let _ = tx
                .send(RuntimeEvent::SessionStarted {
                    session_id: session_id.clone(),
                })
                .await;

            let completion = provider.complete(
                &content,
                system.as_deref(),
                model.as_deref(),
                cwd.as_deref(),
            );

            let terminal = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Session {} cancelled", session_id);
                    return;
                }
                result = completion => match result {
                    Ok(text) => {
                        let text = text.trim().to_string();
                        let _ = tx.send(RuntimeEvent::TextDelta { text: text.clone() }).await;
                        RuntimeEvent::Done { text: Some(text) }
                    }
                    Err(e) => RuntimeEvent::Error { message: e.to_string() },
                },
            };
            let _ = tx.send(terminal).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ProviderError;
    use std::path::Path;
    use std::time::Duration;
    use tokio_stream::StreamExt;
    use tokio_util::sync::CancellationToken;

    struct EchoProvider {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Provider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn complete(
            &self,
            prompt: &str,
            system_prompt: Option<&str>,
            _model: Option<&str>,
            _working_dir: Option<&Path>,
        ) -> std::result::Result<String, ProviderError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ProviderError::ApiError("model overloaded".to_string()));
            }
            Ok(format!("{} [{}]", prompt, system_prompt.unwrap_or("-")))
        }

        fn default_model(&self) -> Option<&str> {
            None
        }
    }

    fn runtime(delay_ms: u64, fail: bool) -> ProviderRuntime {
        ProviderRuntime::new(Arc::new(EchoProvider {
            delay: Duration::from_millis(delay_ms),
            fail,
        }))
    }

    #[tokio::test]
    async fn test_stream_ends_with_done() {
        let runtime = runtime(0, false);
        let options = SendOptions {
            system_context: Some("ctx".to_string()),
            ..Default::default()
        };
        let events: Vec<RuntimeEvent> = runtime
            .send_message("s1", "hello", options)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], RuntimeEvent::SessionStarted { .. }));
        assert_eq!(events[2], RuntimeEvent::Done { text: Some("hello [ctx]".to_string()) });
    }

    #[tokio::test]
    async fn test_provider_error_is_terminal_event() {
        let runtime = runtime(0, true);
        let events: Vec<RuntimeEvent> = runtime
            .send_message("s1", "hello", SendOptions::default())
            .await
            .unwrap()
            .collect()
            .await;

        let last = events.last().unwrap();
        assert!(last.is_terminal());
        assert!(matches!(last, RuntimeEvent::Error { message } if message.contains("overloaded")));
    }

    #[tokio::test]
    async fn test_cancel_closes_stream_without_terminal() {
        let runtime = runtime(5_000, false);
        let cancel = CancellationToken::new();
        let options = SendOptions {
            cancel: cancel.clone(),
            ..Default::default()
        };
        let mut stream = runtime.send_message("s1", "slow", options).await.unwrap();

        assert!(matches!(stream.next().await, Some(RuntimeEvent::SessionStarted { .. })));
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
