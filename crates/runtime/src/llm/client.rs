//! Transports carrying verification prompts to a model
//!
//! Two transports exist: the hosted backend (`POST /scan`, authenticated
//! with the login token) and direct provider APIs (OpenAI-compatible chat
//! completions for OpenAI and OpenRouter, the Messages API for Anthropic).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::prompt::VerificationPrompt;
use crate::config::{LlmProviderKind, LlmSettings, Settings};
use crate::types::{VerificationError, VerificationResult};

/// Raw model answer and the identity of the model that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmCompletion {
    pub model_name: String,
    pub text: String,
}

/// Request metadata forwarded to the hosted backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanMetadata {
    pub app_version: String,
    pub app_platform: String,
    pub mcp_client: String,
    pub mcp_server: String,
    pub mcp_tool: String,
}

/// Carries one prompt to a model
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(
        &self,
        prompt: &VerificationPrompt,
        metadata: &ScanMetadata,
    ) -> VerificationResult<LlmCompletion>;

    /// Transport name for logging.
    fn name(&self) -> &str;
}

fn http_client(timeout_secs: u64) -> VerificationResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| VerificationError::Configuration(format!("Failed to build HTTP client: {}", e)))
}

#[derive(Debug, Serialize)]
struct BackendScanRequest<'a> {
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct BackendScanResponse {
    model_name: String,
    response: String,
}

/// Hosted verification backend
pub struct BackendTransport {
    client: reqwest::Client,
    base_url: String,
    login_token: String,
}

impl BackendTransport {
    pub fn new(
        base_url: impl Into<String>,
        login_token: impl Into<String>,
        timeout_secs: u64,
    ) -> VerificationResult<Self> {
        Ok(Self {
            client: http_client(timeout_secs)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            login_token: login_token.into(),
        })
    }
}

#[async_trait]
impl LlmTransport for BackendTransport {
    async fn complete(
        &self,
        prompt: &VerificationPrompt,
        metadata: &ScanMetadata,
    ) -> VerificationResult<LlmCompletion> {
        let combined = prompt.combined();
        let start = std::time::Instant::now();

        let response = self
            .client
            .post(format!("{}/scan", self.base_url))
            .query(&[
                ("login_request_id", self.login_token.as_str()),
                ("app_version", metadata.app_version.as_str()),
                ("app_platform", metadata.app_platform.as_str()),
                ("mcp_client", metadata.mcp_client.as_str()),
                ("mcp_server", metadata.mcp_server.as_str()),
                ("mcp_tool", metadata.mcp_tool.as_str()),
            ])
            .json(&BackendScanRequest { prompt: &combined })
            .send()
            .await
            .map_err(|e| VerificationError::Transport(format!("Backend request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED {
            return Err(VerificationError::UsageLimitExceeded(
                "Hosted verification quota exhausted".to_string(),
            ));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VerificationError::Transport(format!(
                "Backend error ({}): {}",
                status, error_text
            )));
        }

        let body: BackendScanResponse = response.json().await.map_err(|e| {
            VerificationError::Parse(format!("Invalid backend scan response: {}", e))
        })?;

        tracing::info!(
            "LLM verification: transport=backend model={} latency={:?}",
            body.model_name,
            start.elapsed()
        );

        Ok(LlmCompletion {
            model_name: body.model_name,
            text: body.response,
        })
    }

    fn name(&self) -> &str {
        "backend"
    }
}

/// Direct model-provider API
pub struct ProviderTransport {
    client: reqwest::Client,
    provider: LlmProviderKind,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl ProviderTransport {
    pub fn from_settings(settings: &LlmSettings) -> VerificationResult<Self> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            VerificationError::Configuration(format!(
                "No API key configured for provider {}",
                settings.provider
            ))
        })?;
        let base_url = settings
            .base_url
            .clone()
            .or_else(|| settings.provider.default_base_url().map(str::to_string))
            .ok_or_else(|| {
                VerificationError::Configuration(format!(
                    "Provider {} is not a direct model provider",
                    settings.provider
                ))
            })?;

        Ok(Self {
            client: http_client(settings.request_timeout_secs)?,
            provider: settings.provider,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: settings.model_name().to_string(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// OpenAI-compatible chat completion (OpenAI and OpenRouter)
    async fn openai_completion(&self, prompt: &VerificationPrompt) -> VerificationResult<LlmCompletion> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.instructions },
                { "role": "user", "content": prompt.input }
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature
        });

        let start = std::time::Instant::now();

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| VerificationError::Transport(format!("LLM request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VerificationError::Transport(format!(
                "LLM API error ({}): {}",
                status, error_text
            )));
        }

        let resp_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| VerificationError::Parse(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(usage) = resp_json.get("usage") {
            tracing::info!(
                "LLM usage: provider={} model={} prompt_tokens={} completion_tokens={} latency={:?}",
                self.provider,
                self.model,
                usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                start.elapsed(),
            );
        }

        let text = resp_json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| VerificationError::Parse("No content in LLM response choices".to_string()))?;

        Ok(LlmCompletion {
            model_name: self.reported_model(&resp_json),
            text,
        })
    }

    /// Anthropic Messages API completion
    async fn anthropic_completion(&self, prompt: &VerificationPrompt) -> VerificationResult<LlmCompletion> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": prompt.instructions,
            "messages": [
                { "role": "user", "content": prompt.input }
            ]
        });

        let start = std::time::Instant::now();

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| VerificationError::Transport(format!("Anthropic request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VerificationError::Transport(format!(
                "Anthropic API error ({}): {}",
                status, error_text
            )));
        }

        let resp_json: serde_json::Value = response.json().await.map_err(|e| {
            VerificationError::Parse(format!("Failed to parse Anthropic response: {}", e))
        })?;

        if let Some(usage) = resp_json.get("usage") {
            tracing::info!(
                "LLM usage: provider=anthropic model={} input_tokens={} output_tokens={} latency={:?}",
                self.model,
                usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                start.elapsed(),
            );
        }

        // Content comes back as an array of blocks
        let text = resp_json
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|blocks| {
                blocks
                    .iter()
                    .find(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
            })
            .and_then(|b| b.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| VerificationError::Parse("No text content in Anthropic response".to_string()))?;

        Ok(LlmCompletion {
            model_name: self.reported_model(&resp_json),
            text,
        })
    }

    fn reported_model(&self, resp_json: &serde_json::Value) -> String {
        resp_json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&self.model)
            .to_string()
    }
}

#[async_trait]
impl LlmTransport for ProviderTransport {
    async fn complete(
        &self,
        prompt: &VerificationPrompt,
        _metadata: &ScanMetadata,
    ) -> VerificationResult<LlmCompletion> {
        match self.provider {
            LlmProviderKind::Anthropic => self.anthropic_completion(prompt).await,
            _ => self.openai_completion(prompt).await,
        }
    }

    fn name(&self) -> &str {
        "provider"
    }
}

/// Pick the transport the settings allow.
///
/// The backend provider needs a login token (and a backend URL); direct
/// providers need an API key.
pub fn select_transport(settings: &Settings) -> VerificationResult<Arc<dyn LlmTransport>> {
    match settings.llm.provider {
        LlmProviderKind::Backend => {
            let token = settings.login_token.as_deref().ok_or_else(|| {
                VerificationError::Configuration(
                    "Hosted backend selected but no login token is available".to_string(),
                )
            })?;
            let url = settings.backend.url.as_deref().ok_or_else(|| {
                VerificationError::Configuration("backend.url is not configured".to_string())
            })?;
            tracing::debug!("Using hosted backend transport");
            Ok(Arc::new(BackendTransport::new(
                url,
                token,
                settings.llm.request_timeout_secs,
            )?))
        }
        _ => {
            let transport = ProviderTransport::from_settings(&settings.llm)?;
            tracing::debug!(
                "Using direct provider transport: provider={} model={}",
                settings.llm.provider,
                transport.model()
            );
            Ok(Arc::new(transport))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_without_token_is_a_configuration_error() {
        let mut settings = Settings::default();
        settings.backend.url = Some("http://localhost:9".into());
        let err = select_transport(&settings).err().unwrap();
        assert!(matches!(err, VerificationError::Configuration(_)));
        assert!(err.to_string().contains("login token"));
    }

    #[test]
    fn provider_without_key_is_a_configuration_error() {
        let mut settings = Settings::default();
        settings.llm.provider = LlmProviderKind::OpenAI;
        let err = select_transport(&settings).err().unwrap();
        assert!(err.to_string().contains("No API key"));
    }

    #[test]
    fn selects_backend_with_token() {
        let mut settings = Settings::default();
        settings.login_token = Some("token".into());
        settings.backend.url = Some("http://localhost:9/".into());
        let transport = select_transport(&settings).unwrap();
        assert_eq!(transport.name(), "backend");
    }

    #[test]
    fn selects_provider_with_key() {
        let mut settings = Settings::default();
        settings.llm.provider = LlmProviderKind::Anthropic;
        settings.llm.api_key = Some("sk-ant".into());
        let transport = select_transport(&settings).unwrap();
        assert_eq!(transport.name(), "provider");
    }
}
