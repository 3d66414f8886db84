// Custom error types for the spine identification pipeline
//
// Using thiserror for ergonomic error definitions with:
// - Type-safe error matching per stage
// - Automatic Display/Error trait implementations
// - Stable machine-readable kinds for the HTTP layer

use serde_json::{json, Value};
use thiserror::Error;

/// Longest raw upstream text echoed back to callers or logs
pub const RAW_EXCERPT_CHARS: usize = 500;

/// Truncate text to at most `max_chars` characters (char-boundary safe)
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Spine detection errors
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Detection model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Detection inference failed: {0}")]
    Inference(String),
}

impl From<ort::Error> for DetectionError {
    fn from(err: ort::Error) -> Self {
        DetectionError::Inference(err.to_string())
    }
}

/// OCR errors
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("OCR engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("OCR recognition failed: {0}")]
    Recognition(String),
}

impl From<ort::Error> for OcrError {
    fn from(err: ort::Error) -> Self {
        OcrError::Recognition(err.to_string())
    }
}

/// Book resolution errors
///
/// Each variant is a distinct outcome the caller can render; none of them
/// aborts a request.
#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    #[error("Could not reach resolution service: {message}")]
    Network { message: String },

    #[error("Resolution service returned HTTP {status}")]
    UpstreamHttp { status: u16, details: Value },

    #[error("Resolution service payload is malformed: {message}")]
    MalformedUpstreamPayload { message: String, raw_response: String },

    #[error("Resolution service quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        retry_after_seconds: Option<f64>,
    },

    #[error("Could not parse model output")]
    UnparseableResponse { raw_text: String },
}

impl ResolutionError {
    /// Stable kind string used in response bodies and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ResolutionError::Network { .. } => "network_error",
            ResolutionError::UpstreamHttp { .. } => "model_call_failed",
            ResolutionError::MalformedUpstreamPayload { .. } => "invalid_model_response",
            ResolutionError::QuotaExceeded { .. } => "quota_exceeded",
            ResolutionError::UnparseableResponse { .. } => "could_not_parse_model_output",
        }
    }

    /// JSON body rendered under `book_info`
    pub fn to_body(&self) -> Value {
        match self {
            ResolutionError::Network { message } => json!({
                "error": self.kind(),
                "message": message,
            }),
            ResolutionError::UpstreamHttp { status, details } => json!({
                "error": self.kind(),
                "message": self.to_string(),
                "status_code": status,
                "details": details,
            }),
            ResolutionError::MalformedUpstreamPayload {
                message,
                raw_response,
            } => json!({
                "error": self.kind(),
                "message": message,
                "raw_response": raw_response,
            }),
            ResolutionError::QuotaExceeded {
                message,
                retry_after_seconds,
            } => json!({
                "error": self.kind(),
                "message": message,
                "retry_after_seconds": retry_after_seconds,
            }),
            ResolutionError::UnparseableResponse { raw_text } => json!({
                "error": self.kind(),
                "message": "The model returned text that could not be parsed as JSON.",
                "raw_text": raw_text,
                "suggestion": "Try again or check the OCR input quality",
            }),
        }
    }
}

/// Pipeline orchestration errors (fatal to a request)
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Decode(_) => "decode_error",
            PipelineError::ModelUnavailable(_) => "model_unavailable",
            PipelineError::Inference(_) => "inference_error",
            PipelineError::TaskJoinFailed(_) => "internal_error",
        }
    }
}

impl From<DetectionError> for PipelineError {
    fn from(err: DetectionError) -> Self {
        match err {
            DetectionError::ModelUnavailable(msg) => PipelineError::ModelUnavailable(msg),
            DetectionError::Inference(msg) => PipelineError::Inference(msg),
        }
    }
}

impl From<OcrError> for PipelineError {
    fn from(err: OcrError) -> Self {
        match err {
            OcrError::EngineUnavailable(msg) => PipelineError::ModelUnavailable(msg),
            OcrError::Recognition(msg) => PipelineError::Inference(msg),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid detection config: {0}")]
    InvalidDetectionConfig(String),

    #[error("Invalid resolver config: {0}")]
    InvalidResolverConfig(String),

    #[error("Confidence threshold must be in [0.0, 1.0], got {0}")]
    InvalidConfidenceThreshold(f32),

    #[error("IoU threshold must be in [0.0, 1.0], got {0}")]
    InvalidIoUThreshold(f32),

    #[error("Pool size must be > 0, got {0}")]
    InvalidPoolSize(usize),

    #[error("Unknown resolver provider '{0}' (expected 'chat' or 'gemini')")]
    UnknownProvider(String),
}

// Convenience type aliases for Results
pub type DetectionResult<T> = Result<T, DetectionError>;
pub type OcrResult<T> = Result<T, OcrError>;
pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        let text = "ééééé";
        assert_eq!(truncate_chars(text, 3), "ééé");
        assert_eq!(truncate_chars(text, 10), text);
    }

    #[test]
    fn test_quota_body_carries_retry_after() {
        let err = ResolutionError::QuotaExceeded {
            message: "slow down".to_string(),
            retry_after_seconds: Some(12.5),
        };
        let body = err.to_body();
        assert_eq!(body["error"], "quota_exceeded");
        assert_eq!(body["retry_after_seconds"], 12.5);
    }

    #[test]
    fn test_detection_error_maps_to_pipeline_kind() {
        let err: PipelineError = DetectionError::ModelUnavailable("missing".into()).into();
        assert_eq!(err.kind(), "model_unavailable");
    }
}
