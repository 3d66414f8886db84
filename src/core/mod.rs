pub mod config;
pub mod errors;
pub mod types;

// Re-export commonly used items for convenience
pub use config::Config;
pub use errors::{
    ConfigError, DetectionError, OcrError, PipelineError, ResolutionError,
};
pub use types::{
    BookInfo, BookRecord, Detection, IdentifyResponse, OcrCandidate, OcrCandidateSet,
    PreparedImage, SpineCrop,
};
