pub mod image_ops;
pub mod metrics;

// Re-export commonly used items
pub use image_ops::{crop_clamped, letterbox, rotate_ccw, Letterboxed};
pub use metrics::{Metrics, MetricsSnapshot};
