//! LLM provider client.
//!
//! One operation: [`LlmClient::complete`] — prompt in, text out, single
//! non-streaming request with a bounded token budget. Providers:
//! `anthropic` (messages API, `ANTHROPIC_API_KEY`), `ollama`
//! (`/api/generate`), and `disabled` for deployments without a model.
//!
//! A request that exceeds the configured timeout surfaces as
//! [`LlmError::Timeout`], which the orchestrator maps to a gateway
//! timeout — never an indefinite hang. 429/5xx retry with the same
//! backoff the embedding client uses; other 4xx fail immediately.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::LlmConfig;

/// The seam the orchestrator talks through: prompt in, text out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn is_enabled(&self) -> bool;

    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),
    #[error("LLM provider is disabled")]
    Disabled,
    #[error("LLM service error: {0}")]
    Service(String),
}

pub struct LlmClient {
    config: LlmConfig,
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn is_enabled(&self) -> bool {
        self.config.is_enabled()
    }

    /// Send one prompt and return the completion text.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        match self.config.provider.as_str() {
            "anthropic" => self.complete_anthropic(prompt).await,
            "ollama" => self.complete_ollama(prompt).await,
            "disabled" => Err(LlmError::Disabled),
            other => Err(LlmError::Service(format!("unknown llm provider: {}", other))),
        }
    }
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self { config }
    }

    fn model(&self) -> Result<&str, LlmError> {
        self.config
            .model
            .as_deref()
            .ok_or_else(|| LlmError::Service("llm.model not configured".to_string()))
    }

    fn http_client(&self) -> Result<reqwest::Client, LlmError> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Service(e.to_string()))
    }

    async fn complete_anthropic(&self, prompt: &str) -> Result<String, LlmError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| LlmError::Service("ANTHROPIC_API_KEY not set".to_string()))?;
        let model = self.model()?;
        let client = self.http_client()?;

        let body = serde_json::json!({
            "model": model,
            "max_tokens": self.config.max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        });

        let json = self
            .send_with_retry(|| {
                client
                    .post(format!("{}/v1/messages", ANTHROPIC_BASE_URL))
                    .header("x-api-key", api_key.clone())
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body)
            })
            .await?;

        json["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Service("malformed messages response".to_string()))
    }

    async fn complete_ollama(&self, prompt: &str) -> Result<String, LlmError> {
        let base_url = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        let model = self.model()?;
        let client = self.http_client()?;

        let body = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {"num_predict": self.config.max_tokens},
        });

        let json = self
            .send_with_retry(|| client.post(format!("{}/api/generate", base_url)).json(&body))
            .await?;

        json["response"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| LlmError::Service("malformed generate response".to_string()))
    }

    /// Issue the request with retry/backoff for transient failures.
    async fn send_with_retry<F>(&self, build: F) -> Result<serde_json::Value, LlmError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let mut last_err = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json()
                            .await
                            .map_err(|e| LlmError::Service(e.to_string()));
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(LlmError::Service(format!("{}: {}", status, body_text)));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(LlmError::Service(format!("{}: {}", status, body_text)));
                }
                Err(e) if e.is_timeout() => {
                    // A timed-out call is not retried: the caller's budget
                    // is already spent.
                    return Err(LlmError::Timeout(timeout));
                }
                Err(e) => {
                    last_err = Some(LlmError::Service(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| LlmError::Service("LLM request failed after retries".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_provider_errors() {
        let client = LlmClient::new(LlmConfig::default());
        assert!(!client.is_enabled());
        assert!(matches!(
            client.complete("hello").await,
            Err(LlmError::Disabled)
        ));
    }

    #[tokio::test]
    async fn unknown_provider_is_service_error() {
        let client = LlmClient::new(LlmConfig {
            provider: "bard".to_string(),
            model: Some("x".to_string()),
            ..LlmConfig::default()
        });
        assert!(matches!(
            client.complete("hello").await,
            Err(LlmError::Service(_))
        ));
    }
}
