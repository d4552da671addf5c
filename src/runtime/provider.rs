//! AI provider trait and factory.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::claude::ClaudeProvider;
use super::ollama::OllamaProvider;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Unknown provider: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// AI Provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Check if the provider is available (CLI installed or API reachable).
    async fn is_available(&self) -> bool;

    /// Complete a prompt. `system_prompt` carries side context that must not
    /// be mixed into the user prompt.
    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        model: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<String>;

    fn default_model(&self) -> Option<&str>;
}

/// Provider factory.
pub fn create_provider(name: &str, base_url: Option<&str>) -> Result<Arc<dyn Provider>> {
    match name {
        "claude" => Ok(Arc::new(ClaudeProvider::new())),
        "ollama" => Ok(match base_url {
            Some(url) => Arc::new(OllamaProvider::with_base_url(url)),
            None => Arc::new(OllamaProvider::new()),
        }),
        other => Err(ProviderError::Unknown(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory() {
        assert_eq!(create_provider("claude", None).unwrap().name(), "claude");
        assert_eq!(
            create_provider("ollama", Some("http://gpu-box:11434")).unwrap().name(),
            "ollama"
        );
        assert!(matches!(
            create_provider("grok", None),
            Err(ProviderError::Unknown(_))
        ));
    }
}
