// OpenAI-compatible /chat/completions adapter (OpenRouter by default)

use super::{classify_failure, http_client, network_error, CompletionProvider};
use crate::core::config::ResolverConfig;
use crate::core::errors::{truncate_chars, ResolutionError, RAW_EXCERPT_CHARS};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, instrument, warn};

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

pub struct ChatCompletionsProvider {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    app_referer: String,
    app_title: String,
}

impl ChatCompletionsProvider {
    pub fn new(config: &ResolverConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_keys
            .first()
            .cloned()
            .unwrap_or_default();
        if api_key.is_empty() {
            anyhow::bail!("Resolver API key is required (set RESOLVER_API_KEYS)");
        }
        if config.api_keys.len() > 1 {
            warn!("Chat provider uses a single API key; ignoring {} extra", config.api_keys.len() - 1);
        }

        Ok(Self {
            http_client: http_client(config.timeout_seconds)?,
            endpoint: config.endpoint.clone(),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            app_referer: config.app_referer.clone(),
            app_title: config.app_title.clone(),
        })
    }
}

#[async_trait]
impl CompletionProvider for ChatCompletionsProvider {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, prompt: &str) -> Result<String, ResolutionError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let start = Instant::now();
        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("HTTP-Referer", &self.app_referer)
            .header("X-Title", &self.app_title)
            .json(&request)
            .send()
            .await
            .map_err(|e| network_error(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| network_error(&e))?;
        debug!(
            "Chat completion returned {} in {:.2}ms",
            status,
            start.elapsed().as_secs_f64() * 1000.0
        );

        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &headers, &body));
        }

        let data: Value =
            serde_json::from_str(&body).map_err(|e| ResolutionError::MalformedUpstreamPayload {
                message: format!("Response body is not JSON: {}", e),
                raw_response: truncate_chars(&body, RAW_EXCERPT_CHARS),
            })?;

        data.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(|content| content.trim().to_string())
            .ok_or_else(|| ResolutionError::MalformedUpstreamPayload {
                message: "Response has no choices[0].message.content".to_string(),
                raw_response: truncate_chars(&data.to_string(), RAW_EXCERPT_CHARS),
            })
    }

    fn name(&self) -> &'static str {
        "chat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ProviderKind, OPENROUTER_URL};

    fn config(keys: &[&str]) -> ResolverConfig {
        ResolverConfig {
            provider: ProviderKind::ChatCompletions,
            endpoint: OPENROUTER_URL.to_string(),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            model: "openai/gpt-4o".to_string(),
            max_tokens: 512,
            temperature: 0.3,
            timeout_seconds: 30,
            quota_cooldown_seconds: 60,
            app_referer: "http://localhost".to_string(),
            app_title: "Book-Finder".to_string(),
        }
    }

    #[test]
    fn test_requires_api_key() {
        assert!(ChatCompletionsProvider::new(&config(&[])).is_err());
        assert!(ChatCompletionsProvider::new(&config(&["sk-test"])).is_ok());
    }

    #[test]
    fn test_request_payload_shape() {
        let request = ChatCompletionRequest {
            model: "openai/gpt-4o",
            max_tokens: 512,
            temperature: 0.3,
            messages: vec![ChatMessage {
                role: "user",
                content: "hello",
            }],
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["model"], "openai/gpt-4o");
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hello");
    }
}
