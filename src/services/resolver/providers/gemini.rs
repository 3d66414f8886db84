// Gemini generateContent adapter with multi-key rotation

use super::{classify_failure, http_client, network_error, CompletionProvider};
use crate::core::config::ResolverConfig;
use crate::core::errors::{truncate_chars, ResolutionError, RAW_EXCERPT_CHARS};
use crate::middleware::{ApiKeyPool, KeyStats, MAX_COOLDOWN};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub struct GeminiProvider {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    key_pool: ApiKeyPool,
}

impl GeminiProvider {
    pub fn new(config: &ResolverConfig) -> anyhow::Result<Self> {
        if config.api_keys.is_empty() {
            anyhow::bail!("At least one Gemini API key is required (set RESOLVER_API_KEYS)");
        }
        info!(
            "Gemini provider: model {}, {} API key(s)",
            config.model,
            config.api_keys.len()
        );

        Ok(Self {
            http_client: http_client(config.timeout_seconds)?,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            key_pool: ApiKeyPool::new(
                config.api_keys.clone(),
                Duration::from_secs(config.quota_cooldown_seconds),
            ),
        })
    }

    fn url(&self) -> String {
        format!("{}/{}:generateContent", self.base_url, self.model)
    }
}

/// Cooldown for a parked key, bounded so a hostile hint cannot overflow the deadline
fn cooldown_from_hint(seconds: Option<f64>) -> Option<Duration> {
    seconds
        .filter(|s| s.is_finite())
        .map(|s| Duration::from_secs_f64(s.clamp(0.0, MAX_COOLDOWN.as_secs_f64())))
}

fn request_body(prompt: &str, max_tokens: u32, temperature: f32) -> Value {
    json!({
        "contents": [{ "parts": [{ "text": prompt }] }],
        "generationConfig": {
            "maxOutputTokens": max_tokens,
            "temperature": temperature,
        },
    })
}

/// Concatenated text parts of the first candidate
fn response_text(data: &Value) -> Option<String> {
    let parts = data.pointer("/candidates/0/content/parts")?.as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    (!text.trim().is_empty()).then(|| text.trim().to_string())
}

#[async_trait]
impl CompletionProvider for GeminiProvider {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, prompt: &str) -> Result<String, ResolutionError> {
        let (key_index, api_key) = match self.key_pool.acquire().await {
            Ok(key) => key,
            Err(wait) => {
                warn!("All Gemini API keys are cooling down ({:.1}s left)", wait.as_secs_f64());
                return Err(ResolutionError::QuotaExceeded {
                    message: "All API keys are cooling down after quota errors".to_string(),
                    retry_after_seconds: Some(wait.as_secs_f64()),
                });
            }
        };

        let start = Instant::now();
        let response = self
            .http_client
            .post(self.url())
            .header("x-goog-api-key", &api_key)
            .json(&request_body(prompt, self.max_tokens, self.temperature))
            .send()
            .await
            .map_err(|e| network_error(&e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| network_error(&e))?;
        debug!(
            "Gemini key #{} returned {} in {:.2}ms",
            key_index,
            status,
            start.elapsed().as_secs_f64() * 1000.0
        );

        if !status.is_success() {
            let err = classify_failure(status.as_u16(), &headers, &body);
            if let ResolutionError::QuotaExceeded {
                retry_after_seconds,
                ..
            } = &err
            {
                self.key_pool
                    .park(key_index, cooldown_from_hint(*retry_after_seconds))
                    .await;
            }
            return Err(err);
        }

        let data: Value =
            serde_json::from_str(&body).map_err(|e| ResolutionError::MalformedUpstreamPayload {
                message: format!("Response body is not JSON: {}", e),
                raw_response: truncate_chars(&body, RAW_EXCERPT_CHARS),
            })?;

        response_text(&data).ok_or_else(|| ResolutionError::MalformedUpstreamPayload {
            message: "Response has no candidates[0].content.parts text".to_string(),
            raw_response: truncate_chars(&data.to_string(), RAW_EXCERPT_CHARS),
        })
    }

    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn key_stats(&self) -> Vec<KeyStats> {
        self.key_pool.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ProviderKind, GEMINI_BASE_URL};

    fn config(keys: &[&str]) -> ResolverConfig {
        ResolverConfig {
            provider: ProviderKind::Gemini,
            endpoint: format!("{}/", GEMINI_BASE_URL),
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            model: "gemini-2.5-flash".to_string(),
            max_tokens: 512,
            temperature: 0.3,
            timeout_seconds: 30,
            quota_cooldown_seconds: 60,
            app_referer: "http://localhost".to_string(),
            app_title: "Book-Finder".to_string(),
        }
    }

    #[test]
    fn test_requires_keys_and_builds_url() {
        assert!(GeminiProvider::new(&config(&[])).is_err());
        let provider = GeminiProvider::new(&config(&["k1", "k2"])).unwrap();
        assert_eq!(
            provider.url(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }

    #[test]
    fn test_request_body_shape() {
        let body = request_body("hello", 256, 0.2);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn test_response_text_joins_parts() {
        let data = json!({
            "candidates": [{ "content": { "parts": [{ "text": "[{\"title\": " }, { "text": "\"Dune\"}]" }] } }]
        });
        assert_eq!(response_text(&data).unwrap(), "[{\"title\": \"Dune\"}]");
        assert!(response_text(&json!({ "candidates": [] })).is_none());
        assert!(response_text(&json!({ "promptFeedback": { "blockReason": "SAFETY" } })).is_none());
    }

    #[test]
    fn test_cooldown_hint_is_bounded() {
        assert_eq!(cooldown_from_hint(Some(12.5)), Some(Duration::from_millis(12_500)));
        assert_eq!(cooldown_from_hint(Some(9_999_999_999_999_999_999.0)), Some(MAX_COOLDOWN));
        assert_eq!(cooldown_from_hint(Some(-3.0)), Some(Duration::ZERO));
        assert_eq!(cooldown_from_hint(Some(f64::NAN)), None);
        assert_eq!(cooldown_from_hint(None), None);
    }
}
