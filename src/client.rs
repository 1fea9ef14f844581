//! Model-calling capability: the trait the runner depends on, plus an async
//! client for OpenAI-compatible chat-completions APIs.
//!
//! The client is single-shot per call: retries belong to the runner's
//! per-batch attempt budget, while the request timeout is the only bound
//! enforced here. Token usage reported by the API is folded into cumulative
//! per-instance counters after every call.

use crate::checkpoint::TokenUsage;
use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Failure modes of a single model call. Transient failures are recorded and
/// retried by the runner; cancellation triggers flush-and-exit.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("transient call failure: {0}")]
    Transient(String),

    #[error("call interrupted")]
    Cancelled,
}

/// The capability contract: given a prompt, positionally-bound image
/// references, and a token budget, return a completion. Counters are
/// cumulative per instance.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(
        &self,
        prompt: &str,
        image_refs: &[PathBuf],
        max_tokens: u32,
    ) -> std::result::Result<String, CallError>;

    fn token_usage(&self) -> TokenUsage;
}

/// API configuration, parsed from a `key=value` args string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    /// Image resolution hint for GPT-4V-series models.
    pub detail: String,
}

impl ApiConfig {
    /// Parse from `model=...,base_url=...[,api_key=...,timeout=N,detail=...]`.
    pub fn from_model_args(args: &str) -> Result<Self> {
        let mut url = None;
        let mut model = None;
        let mut api_key = None;
        let mut timeout = 120u64;
        let mut detail = "auto".to_string();

        for part in args.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part.split_once('=').ok_or_else(|| {
                HarnessError::InvalidModelArgs(format!("Invalid format: {}", part))
            })?;

            match key.trim() {
                "base_url" => url = Some(value.trim().to_string()),
                "model" => model = Some(value.trim().to_string()),
                "api_key" => api_key = Some(value.trim().to_string()),
                "detail" => detail = value.trim().to_string(),
                "timeout" => {
                    timeout = value.trim().parse().map_err(|_| {
                        HarnessError::InvalidModelArgs(format!("Invalid timeout: {}", value))
                    })?
                }
                _ => {} // Ignore unknown keys
            }
        }

        let url = url.ok_or_else(|| HarnessError::MissingField("base_url".to_string()))?;
        let model = model.ok_or_else(|| HarnessError::MissingField("model".to_string()))?;

        Ok(Self {
            url: format!("{}/chat/completions", url.trim_end_matches('/')),
            model,
            api_key,
            timeout_seconds: timeout,
            detail,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}

/// Async client for OpenAI-compatible APIs with multimodal messages.
pub struct OpenAiClient {
    client: Client,
    config: ApiConfig,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

impl OpenAiClient {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            config,
            prompt_tokens: AtomicU64::new(0),
            completion_tokens: AtomicU64::new(0),
            total_tokens: AtomicU64::new(0),
        })
    }

    /// Build the single user message: the prompt text followed by every image
    /// as a base64 data URL, in reference order.
    fn user_message(
        &self,
        prompt: &str,
        image_refs: &[PathBuf],
    ) -> std::result::Result<serde_json::Value, CallError> {
        let mut content = vec![serde_json::json!({
            "type": "text",
            "text": prompt
        })];

        for path in image_refs {
            let bytes = std::fs::read(path)
                .map_err(|e| CallError::Transient(format!("read {}: {}", path.display(), e)))?;
            let url = format!("data:{};base64,{}", mime_for(path), BASE64.encode(&bytes));
            content.push(serde_json::json!({
                "type": "image_url",
                "image_url": {
                    "url": url,
                    "detail": self.config.detail
                }
            }));
        }

        Ok(serde_json::json!({
            "role": "user",
            "content": content
        }))
    }

    fn record_usage(&self, usage: &ApiUsage) {
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn call(
        &self,
        prompt: &str,
        image_refs: &[PathBuf],
        max_tokens: u32,
    ) -> std::result::Result<String, CallError> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![self.user_message(prompt, image_refs)?],
            max_tokens,
        };

        let mut req = self.client.post(&self.config.url).json(&request);
        if let Some(ref api_key) = self.config.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| CallError::Transient(format!("request to {}: {}", self.config.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Transient(format!("HTTP {}: {}", status, body)));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| CallError::Transient(format!("decode response: {}", e)))?;

        if let Some(ref usage) = body.usage {
            self.record_usage(usage);
        }

        body.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CallError::Transient("no choices in response".to_string()))
    }

    fn token_usage(&self) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_from_model_args() {
        let config = ApiConfig::from_model_args(
            "model=gpt-4-turbo-2024-04-09,base_url=http://localhost:8000/v1,api_key=sk-test",
        )
        .unwrap();

        assert_eq!(config.model, "gpt-4-turbo-2024-04-09");
        assert_eq!(config.url, "http://localhost:8000/v1/chat/completions");
        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.detail, "auto");
        assert_eq!(config.timeout_seconds, 120);
    }

    #[test]
    fn test_api_config_missing_base_url() {
        let err = ApiConfig::from_model_args("model=gpt-4").unwrap_err();
        assert!(matches!(err, HarnessError::MissingField(f) if f == "base_url"));
    }

    #[test]
    fn test_api_config_invalid_pair() {
        assert!(ApiConfig::from_model_args("model").is_err());
    }

    #[test]
    fn test_api_config_timeout_and_detail() {
        let config =
            ApiConfig::from_model_args("model=m,base_url=http://x/v1,timeout=30,detail=high")
                .unwrap();
        assert_eq!(config.timeout_seconds, 30);
        assert_eq!(config.detail, "high");
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for(Path::new("a.jpg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("a.png")), "image/png");
        assert_eq!(mime_for(Path::new("a")), "image/png");
    }
}
