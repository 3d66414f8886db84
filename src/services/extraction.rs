// Cuts detected spines out of the prepared image and stands them upright

use crate::core::types::{Detection, PreparedImage, SpineCrop};
use crate::utils::image_ops::{crop_clamped, rotate_ccw};
use image::DynamicImage;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, Default)]
pub struct RegionExtractor;

impl RegionExtractor {
    pub fn new() -> Self {
        Self
    }

    /// One crop per detection, same order
    ///
    /// Boxes are clamped to the image; each crop is rotated 90°
    /// counter-clockwise so vertical spine text reads horizontally.
    #[instrument(skip_all, fields(detections = detections.len()))]
    pub fn crop(&self, image: &PreparedImage, detections: &[Detection]) -> Vec<SpineCrop> {
        detections
            .iter()
            .enumerate()
            .map(|(index, detection)| {
                let region = crop_clamped(&image.pixels, detection.bbox);
                let upright = rotate_ccw(&region);
                debug!(
                    "Crop {}: box {:?} -> {}x{}",
                    index,
                    detection.bbox,
                    upright.width(),
                    upright.height()
                );
                SpineCrop {
                    index,
                    detection: *detection,
                    image: DynamicImage::ImageRgb8(upright),
                }
            })
            .collect()
    }
}
