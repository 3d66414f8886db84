// Upload decoding and letterboxing into the detector's input grid

use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::PreparedImage;
use crate::utils::image_ops::letterbox;
use image::DynamicImage;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy)]
pub struct ImagePreparer {
    target_width: u32,
    target_height: u32,
}

impl ImagePreparer {
    pub fn new(target_size: u32) -> Self {
        Self {
            target_width: target_size,
            target_height: target_size,
        }
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    /// Decode raw upload bytes and letterbox them
    #[instrument(skip(self, raw_bytes), fields(bytes = raw_bytes.len()))]
    pub fn prepare(&self, raw_bytes: &[u8]) -> PipelineResult<PreparedImage> {
        let img = image::load_from_memory(raw_bytes)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;
        self.prepare_decoded(&img)
    }

    /// Letterbox an already decoded image (any color type)
    pub fn prepare_decoded(&self, img: &DynamicImage) -> PipelineResult<PreparedImage> {
        let (source_width, source_height) = (img.width(), img.height());
        if source_width == 0 || source_height == 0 {
            return Err(PipelineError::Decode(format!(
                "image has no pixels ({}x{})",
                source_width, source_height
            )));
        }

        // Drops alpha, expands grayscale and palette images
        let rgb = img.to_rgb8();
        let boxed = letterbox(&rgb, self.target_width, self.target_height);

        debug!(
            "Prepared {}x{} -> {}x{} (scale {:.4}, content {}x{})",
            source_width,
            source_height,
            self.target_width,
            self.target_height,
            boxed.scale,
            boxed.content_width,
            boxed.content_height
        );

        Ok(PreparedImage {
            pixels: boxed.canvas,
            scale: boxed.scale,
            content_width: boxed.content_width,
            content_height: boxed.content_height,
            source_width,
            source_height,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes(img: DynamicImage) -> Vec<u8> {
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn test_prepared_image_matches_target_and_aspect() {
        let preparer = ImagePreparer::new(640);
        let bytes = png_bytes(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            800,
            300,
            Rgba([10, 20, 30, 128]),
        )));

        let prepared = preparer.prepare(&bytes).unwrap();
        assert_eq!((prepared.width(), prepared.height()), (640, 640));
        assert_eq!((prepared.source_width, prepared.source_height), (800, 300));

        let src_ratio = 800.0 / 300.0;
        let ratio = prepared.content_width as f32 / prepared.content_height as f32;
        // Within one pixel of the source aspect ratio
        assert!((prepared.content_height as f32 * (ratio - src_ratio)).abs() <= 1.0);
    }

    #[test]
    fn test_grayscale_is_expanded_to_rgb() {
        let preparer = ImagePreparer::new(320);
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(
            320,
            320,
            image::Luma([90]),
        ));
        let prepared = preparer.prepare(&png_bytes(gray)).unwrap();
        assert_eq!(prepared.pixels.get_pixel(5, 5).0, [90, 90, 90]);
    }

    #[test]
    fn test_undecodable_bytes_are_decode_errors() {
        let preparer = ImagePreparer::new(640);
        let err = preparer.prepare(b"GIF89a but not really").unwrap_err();
        assert_eq!(err.kind(), "decode_error");
    }
}
