// Library exports for the bookshelf spine identification workflow

// Core modules
pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod server;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    errors::{ConfigError, DetectionError, OcrError, PipelineError, ResolutionError},
    types::{
        BookInfo, BookRecord, Detection, IdentifyResponse, OcrCandidate, OcrCandidateSet,
        PreparedImage, SpineCrop,
    },
};

pub use middleware::ApiKeyPool;

pub use orchestration::SpinePipeline;

pub use services::{
    BookResolver, ImagePreparer, OnnxSpineDetector, OnnxTextReader, RegionExtractor,
    SpineDetector, TextReader,
};

pub use utils::Metrics;
