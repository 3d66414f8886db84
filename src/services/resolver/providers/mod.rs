// Upstream text-generation adapters
//
// Adapters never retry: each `complete` is exactly one upstream call (or none,
// when every key is cooling down).

pub mod chat;
pub mod gemini;

pub use chat::ChatCompletionsProvider;
pub use gemini::GeminiProvider;

use crate::core::config::{ProviderKind, ResolverConfig};
use crate::core::errors::{truncate_chars, ResolutionError, RAW_EXCERPT_CHARS};
use crate::middleware::KeyStats;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

static RETRY_HINT_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)retry (?:in|after)\s*([0-9]+(?:\.[0-9]+)?)\s*s").ok()
});
static RETRY_DELAY_RE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#""retryDelay"\s*:\s*"([0-9]+(?:\.[0-9]+)?)s""#).ok()
});

/// A text-generation service that answers one prompt with free text
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ResolutionError>;

    /// Short name for logs and health output
    fn name(&self) -> &'static str;

    /// Per-key health, for adapters that rotate several API keys
    async fn key_stats(&self) -> Vec<KeyStats> {
        Vec::new()
    }
}

/// Build the adapter selected by configuration
pub fn build_provider(config: &ResolverConfig) -> anyhow::Result<Arc<dyn CompletionProvider>> {
    let provider: Arc<dyn CompletionProvider> = match config.provider {
        ProviderKind::ChatCompletions => Arc::new(ChatCompletionsProvider::new(config)?),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(config)?),
    };
    Ok(provider)
}

/// HTTP client with the configured request timeout
pub(crate) fn http_client(timeout_seconds: u64) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;

    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds))
        .connect_timeout(Duration::from_secs(timeout_seconds.min(10)))
        .pool_max_idle_per_host(5)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .context("Failed to create HTTP client")
}

/// Seconds to wait, from "retry in 12.5s", "retry after 30 seconds" or a
/// Gemini `retryDelay` field
pub fn parse_retry_hint(text: &str) -> Option<f64> {
    [&RETRY_HINT_RE, &RETRY_DELAY_RE].iter().find_map(|re| {
        re.as_ref()?
            .captures(text)?
            .get(1)?
            .as_str()
            .parse::<f64>()
            .ok()
    })
}

/// Statuses whose body may still describe a quota or rate limit
const QUOTA_PRONE_STATUSES: [u16; 2] = [403, 503];

const QUOTA_MARKERS: [&str; 6] = [
    "resource_exhausted",
    "quota exceeded",
    "exceeded your current quota",
    "rate limit",
    "rate_limit",
    "ratelimit",
];

fn looks_like_quota(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }
    if !QUOTA_PRONE_STATUSES.contains(&status) {
        return false;
    }
    let lower = body.to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Human-readable message from a JSON error body, or an excerpt of the raw text
fn error_message(body: &str, parsed: Option<&Value>) -> String {
    parsed
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| truncate_chars(body.trim(), RAW_EXCERPT_CHARS))
}

/// Classify a non-success upstream response
pub fn classify_failure(status: u16, headers: &HeaderMap, body: &str) -> ResolutionError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();

    if looks_like_quota(status, body) {
        let header_hint = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<f64>().ok());
        let message = error_message(body, parsed.as_ref());
        return ResolutionError::QuotaExceeded {
            retry_after_seconds: parse_retry_hint(body)
                .or_else(|| parse_retry_hint(&message))
                .or(header_hint),
            message,
        };
    }

    ResolutionError::UpstreamHttp {
        status,
        details: parsed
            .unwrap_or_else(|| Value::String(truncate_chars(body, RAW_EXCERPT_CHARS))),
    }
}

/// Transport-level failure (DNS, connect, TLS, timeout)
pub fn network_error(err: &reqwest::Error) -> ResolutionError {
    let message = if err.is_timeout() {
        format!("Request to resolution service timed out: {}", err)
    } else {
        err.to_string()
    };
    ResolutionError::Network { message }
}
