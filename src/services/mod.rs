pub mod detection;
pub mod extraction;
pub mod model_handle;
pub mod ocr;
pub mod onnx_builder; // Shared ONNX session builder and pool for detector and recognizer
pub mod preparation;
pub mod resolver;

// Re-export commonly used services
pub use detection::{OnnxSpineDetector, SpineDetector};
pub use extraction::RegionExtractor;
pub use ocr::{OnnxTextReader, TextReader};
pub use preparation::ImagePreparer;
pub use resolver::{build_provider, BookResolver};
