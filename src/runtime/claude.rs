//! Claude CLI provider.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use super::provider::{Provider, ProviderError, Result};

pub struct ClaudeProvider {
    cli_path: String,
    default_model: String,
}

impl ClaudeProvider {
    pub fn new() -> Self {
        Self::with_cli_path("claude")
    }

    pub fn with_cli_path(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
            default_model: "sonnet".to_string(),
        }
    }

    fn command(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        model: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Command {
        let mut cmd = Command::new(&self.cli_path);
        cmd.arg("-c").arg("-p").arg(prompt);

        if let Some(system) = system_prompt.filter(|s| !s.trim().is_empty()) {
            cmd.arg("--append-system-prompt").arg(system);
        }
        if let Some(m) = selected_model_arg(model) {
            cmd.arg("--model").arg(m);
        }
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        // Dropping the completion future (timeout, shutdown) kills the CLI.
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }
}

impl Default for ClaudeProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn selected_model_arg(model: Option<&str>) -> Option<String> {
    model
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != "default")
        .map(ToString::to_string)
}

#[async_trait]
impl Provider for ClaudeProvider {
    fn name(&self) -> &str {
        "claude"
    }

    async fn is_available(&self) -> bool {
        Command::new(&self.cli_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn complete(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        model: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<String> {
        let output = self
            .command(prompt, system_prompt, model, working_dir)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ProviderError::NotAvailable(format!("{} not found on PATH", self.cli_path))
                }
                _ => ProviderError::IoError(e),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ProviderError::ApiError(stderr.trim().to_string()))
        }
    }

    fn default_model(&self) -> Option<&str> {
        Some(&self.default_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_does_not_force_override() {
        assert_eq!(selected_model_arg(Some("default")), None);
        assert_eq!(selected_model_arg(Some("")), None);
        assert_eq!(selected_model_arg(Some("opus")), Some("opus".to_string()));
    }

    #[test]
    fn system_prompt_goes_to_its_own_flag() {
        let provider = ClaudeProvider::new();
        let cmd = provider.command("do the thing", Some("<relay_context/>"), None, None);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec!["-c", "-p", "do the thing", "--append-system-prompt", "<relay_context/>"]
        );
    }

    #[tokio::test]
    async fn missing_cli_is_not_available() {
        let provider = ClaudeProvider::with_cli_path("/nonexistent/claude-cli");
        assert!(!provider.is_available().await);
        let err = provider.complete("hi", None, None, None).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotAvailable(_)));
    }
}
