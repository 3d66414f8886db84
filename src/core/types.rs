// Data types flowing between pipeline stages

use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Letterboxed model input
///
/// Content occupies the top-left `content_width x content_height` pixels,
/// the rest is zero padding.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub pixels: RgbImage,
    pub scale: f32,
    pub content_width: u32,
    pub content_height: u32,
    pub source_width: u32,
    pub source_height: u32,
}

impl PreparedImage {
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

/// One detected spine in PreparedImage pixel space
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "box")]
    pub bbox: [i32; 4],
    pub confidence: f32,
}

/// Rotated spine crop ready for OCR
#[derive(Debug, Clone)]
pub struct SpineCrop {
    pub index: usize,
    pub detection: Detection,
    pub image: DynamicImage,
}

/// A single OCR guess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrCandidate {
    pub text: String,
    pub confidence: f32,
}

/// OCR guesses for one crop, in engine order
pub type OcrCandidateSet = Vec<OcrCandidate>;

/// Resolved book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookRecord {
    pub title: String,
    pub author: String,
    pub isbn: String,
    pub description: String,
    /// Set only for records recovered from unstructured model output
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub low_confidence: bool,
}

/// `book_info` field of the response: books or a rendered resolution error
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BookInfo {
    Books(Vec<BookRecord>),
    Error(Value),
}

/// Pipeline response payload
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyResponse {
    pub detections: Vec<OcrCandidateSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book_info: Option<BookInfo>,
    pub success: bool,
}

impl IdentifyResponse {
    /// Payload for an image with no qualifying spines
    pub fn no_spines() -> Self {
        Self {
            detections: Vec::new(),
            book_info: None,
            success: true,
        }
    }
}

/// Per-request stage timings
#[derive(Debug, Clone, Default)]
pub struct StageTimings {
    pub prepare: Duration,
    pub detect: Duration,
    pub read: Duration,
    pub resolve: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_early_exit_payload_shape() {
        let body = serde_json::to_value(IdentifyResponse::no_spines()).unwrap();
        assert_eq!(body, serde_json::json!({"detections": [], "success": true}));
    }

    #[test]
    fn test_low_confidence_flag_only_serialized_when_set() {
        let mut record = BookRecord {
            title: "Dune".into(),
            author: "Frank Herbert".into(),
            isbn: "N/A".into(),
            description: "Desert planet.".into(),
            low_confidence: false,
        };
        let body = serde_json::to_value(&record).unwrap();
        assert!(body.get("low_confidence").is_none());

        record.low_confidence = true;
        let body = serde_json::to_value(&record).unwrap();
        assert_eq!(body["low_confidence"], true);
    }
}
