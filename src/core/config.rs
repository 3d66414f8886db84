use crate::core::errors::ConfigError;
use std::env;
use std::str::FromStr;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
    pub max_upload_bytes: usize,
}

/// Detection configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub target_size: u32,
    pub inference_backend: Option<String>,
    pub detector_model_path: String,
    /// Number of ONNX sessions per model (controls inference parallelism)
    pub onnx_pool_size: usize,
}

/// OCR configuration
#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub model_path: String,
    pub dict_path: String,
}

/// Which upstream adapter resolves books
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// OpenAI-compatible `/chat/completions` endpoint
    ChatCompletions,
    /// Gemini `generateContent` with a quota-aware key pool
    Gemini,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chat" | "openai" | "openrouter" => Ok(ProviderKind::ChatCompletions),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

/// Resolution provider configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub provider: ProviderKind,
    pub endpoint: String,
    pub api_keys: Vec<String>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub quota_cooldown_seconds: u64,
    pub app_referer: String,
    pub app_title: String,
}

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub ocr: OcrConfig,
    pub resolver: ResolverConfig,
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from an arbitrary key lookup (environment in production)
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Comma-separated API keys
        let api_keys = lookup("RESOLVER_API_KEYS")
            .map(|keys| {
                keys.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let log_level = lookup("LOG_LEVEL")
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let provider = match lookup("RESOLVER_PROVIDER") {
            Some(name) if !name.trim().is_empty() => name.parse()?,
            _ => ProviderKind::ChatCompletions,
        };

        let (default_endpoint, default_model) = match provider {
            ProviderKind::ChatCompletions => (OPENROUTER_URL, "openai/gpt-4o"),
            ProviderKind::Gemini => (GEMINI_BASE_URL, "gemini-2.5-flash"),
        };

        Ok(Self {
            server: ServerConfig {
                port: parse_or(&lookup, "SERVER_PORT", 5000),
                host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                log_level,
                max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            },
            detection: DetectionConfig {
                confidence_threshold: parse_or(&lookup, "CONFIDENCE_THRESHOLD", 0.5),
                iou_threshold: parse_or(&lookup, "IOU_THRESHOLD", 0.7),
                target_size: parse_or(&lookup, "TARGET_SIZE", 640),
                inference_backend: lookup("INFERENCE_BACKEND")
                    .map(|s| s.trim().to_uppercase())
                    .filter(|s| !s.is_empty()),
                detector_model_path: lookup("DETECTOR_MODEL_PATH")
                    .unwrap_or_else(|| "models/spine_detector.onnx".to_string()),
                onnx_pool_size: lookup("ONNX_POOL_SIZE")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or_else(|| std::cmp::min(num_cpus::get(), 4).max(1)),
            },
            ocr: OcrConfig {
                model_path: lookup("OCR_MODEL_PATH")
                    .unwrap_or_else(|| "models/ocr/rec.onnx".to_string()),
                dict_path: lookup("OCR_DICT_PATH")
                    .unwrap_or_else(|| "models/ocr/dict.txt".to_string()),
            },
            resolver: ResolverConfig {
                provider,
                endpoint: lookup("RESOLVER_ENDPOINT")
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| default_endpoint.to_string()),
                api_keys,
                model: lookup("RESOLVER_MODEL")
                    .filter(|s| !s.trim().is_empty())
                    .unwrap_or_else(|| default_model.to_string()),
                max_tokens: parse_or(&lookup, "RESOLVER_MAX_TOKENS", 512),
                temperature: parse_or(&lookup, "RESOLVER_TEMPERATURE", 0.3),
                timeout_seconds: parse_or(&lookup, "RESOLVER_TIMEOUT_SECONDS", 30),
                quota_cooldown_seconds: parse_or(&lookup, "QUOTA_COOLDOWN_SECONDS", 60),
                app_referer: lookup("RESOLVER_APP_REFERER")
                    .unwrap_or_else(|| "http://localhost".to_string()),
                app_title: lookup("RESOLVER_APP_TITLE")
                    .unwrap_or_else(|| "Book-Finder".to_string()),
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // API keys are not required here: providers refuse to start without one

        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            return Err(ConfigError::InvalidConfidenceThreshold(
                self.detection.confidence_threshold,
            ));
        }

        if !(0.0..=1.0).contains(&self.detection.iou_threshold) {
            return Err(ConfigError::InvalidIoUThreshold(self.detection.iou_threshold));
        }

        if !(320..=2048).contains(&self.detection.target_size) {
            return Err(ConfigError::InvalidDetectionConfig(format!(
                "target_size must be between 320 and 2048, got {}",
                self.detection.target_size
            )));
        }

        if self.detection.onnx_pool_size == 0 {
            return Err(ConfigError::InvalidPoolSize(self.detection.onnx_pool_size));
        }

        if self.resolver.timeout_seconds == 0 {
            return Err(ConfigError::InvalidResolverConfig(
                "timeout_seconds must be > 0 (unbounded upstream calls are not allowed)"
                    .to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.resolver.temperature) {
            return Err(ConfigError::InvalidResolverConfig(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                self.resolver.temperature
            )));
        }

        if self.resolver.max_tokens == 0 {
            return Err(ConfigError::InvalidResolverConfig(
                "max_tokens must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_bytes
    }

    pub fn confidence_threshold(&self) -> f32 {
        self.detection.confidence_threshold
    }

    pub fn iou_threshold(&self) -> f32 {
        self.detection.iou_threshold
    }

    pub fn target_size(&self) -> u32 {
        self.detection.target_size
    }

    pub fn onnx_pool_size(&self) -> usize {
        self.detection.onnx_pool_size
    }

    pub fn api_keys(&self) -> &[String] {
        &self.resolver.api_keys
    }
}

// Note: No Default implementation because Config::new() can fail

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = Config::load_from(|key| map.get(key).cloned())?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.target_size(), 640);
        assert_eq!(config.confidence_threshold(), 0.5);
        assert_eq!(config.resolver.provider, ProviderKind::ChatCompletions);
        assert_eq!(config.resolver.endpoint, OPENROUTER_URL);
        assert_eq!(config.resolver.timeout_seconds, 30);
        assert!(config.api_keys().is_empty());
    }

    #[test]
    fn test_gemini_provider_defaults() {
        let config = config_from(&[
            ("RESOLVER_PROVIDER", "gemini"),
            ("RESOLVER_API_KEYS", "a, b,,c"),
        ])
        .unwrap();
        assert_eq!(config.resolver.provider, ProviderKind::Gemini);
        assert_eq!(config.resolver.model, "gemini-2.5-flash");
        assert_eq!(config.api_keys(), &["a", "b", "c"]);
    }

    #[test]
    fn test_rejects_invalid_threshold() {
        let err = config_from(&[("CONFIDENCE_THRESHOLD", "1.5")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfidenceThreshold(_)));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = config_from(&[("RESOLVER_TIMEOUT_SECONDS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidResolverConfig(_)));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = config_from(&[("RESOLVER_PROVIDER", "carrier-pigeon")]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(_)));
    }
}
