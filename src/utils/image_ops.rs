use image::{imageops, RgbImage};

/// Letterbox result: canvas plus the geometry needed to map boxes back
#[derive(Debug, Clone)]
pub struct Letterboxed {
    pub canvas: RgbImage,
    pub scale: f32,
    pub content_width: u32,
    pub content_height: u32,
}

/// Uniform-scale resize into a `target_w x target_h` zero canvas.
///
/// Content is anchored top-left; padding only at bottom/right.
pub fn letterbox(img: &RgbImage, target_w: u32, target_h: u32) -> Letterboxed {
    let (src_w, src_h) = img.dimensions();
    let scale = f32::min(
        target_h as f32 / src_h.max(1) as f32,
        target_w as f32 / src_w.max(1) as f32,
    );

    let new_w = ((src_w as f32 * scale).round() as u32).clamp(1, target_w);
    let new_h = ((src_h as f32 * scale).round() as u32).clamp(1, target_h);

    let mut canvas = RgbImage::new(target_w, target_h);
    if new_w == src_w && new_h == src_h {
        imageops::replace(&mut canvas, img, 0, 0);
    } else {
        let resized = imageops::resize(img, new_w, new_h, imageops::FilterType::Triangle);
        imageops::replace(&mut canvas, &resized, 0, 0);
    }

    Letterboxed {
        canvas,
        scale,
        content_width: new_w,
        content_height: new_h,
    }
}

/// Crop `[x1, y1, x2, y2]` clamped to the image; never returns an empty image.
pub fn crop_clamped(img: &RgbImage, bbox: [i32; 4]) -> RgbImage {
    let (w, h) = img.dimensions();
    let (w, h) = (w.max(1) as i32, h.max(1) as i32);

    let x1 = bbox[0].clamp(0, w - 1);
    let y1 = bbox[1].clamp(0, h - 1);
    let x2 = bbox[2].clamp(x1 + 1, w);
    let y2 = bbox[3].clamp(y1 + 1, h);

    imageops::crop_imm(
        img,
        x1 as u32,
        y1 as u32,
        (x2 - x1) as u32,
        (y2 - y1) as u32,
    )
    .to_image()
}

/// Rotate 90° counter-clockwise; the canvas grows to `h x w`.
pub fn rotate_ccw(img: &RgbImage) -> RgbImage {
    imageops::rotate270(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_letterbox_wide_image() {
        let img = RgbImage::from_pixel(1280, 720, Rgb([200, 10, 10]));
        let out = letterbox(&img, 640, 640);

        assert_eq!(out.canvas.dimensions(), (640, 640));
        assert_eq!((out.content_width, out.content_height), (640, 360));
        assert!((out.scale - 0.5).abs() < 1e-6);
        // Padding below the content
        assert_eq!(out.canvas.get_pixel(10, 400), &Rgb([0, 0, 0]));
        assert_eq!(out.canvas.get_pixel(10, 10), &Rgb([200, 10, 10]));
    }

    #[test]
    fn test_letterbox_tall_image_pads_right() {
        let img = RgbImage::from_pixel(300, 900, Rgb([50, 60, 70]));
        let out = letterbox(&img, 640, 640);

        assert_eq!(out.content_height, 640);
        // 300 * 640/900 = 213.3
        assert_eq!(out.content_width, 213);
        assert_eq!(out.canvas.get_pixel(500, 100), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_letterbox_keeps_tiny_dimension() {
        let img = RgbImage::from_pixel(4000, 1, Rgb([255, 255, 255]));
        let out = letterbox(&img, 640, 640);
        assert_eq!(out.content_width, 640);
        assert_eq!(out.content_height, 1);
    }

    #[test]
    fn test_crop_clamped_edges() {
        let img = RgbImage::new(100, 50);
        assert_eq!(crop_clamped(&img, [90, 40, 150, 80]).dimensions(), (10, 10));
        assert_eq!(crop_clamped(&img, [-20, -20, 10, 5]).dimensions(), (10, 5));
        // Fully outside and degenerate boxes still yield a pixel
        assert_eq!(crop_clamped(&img, [500, 500, 600, 600]).dimensions(), (1, 1));
        assert_eq!(crop_clamped(&img, [30, 30, 30, 30]).dimensions(), (1, 1));
    }

    #[test]
    fn test_rotate_ccw_moves_top_right_to_top_left() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(3, 0, Rgb([255, 0, 0]));
        let rotated = rotate_ccw(&img);

        assert_eq!(rotated.dimensions(), (2, 4));
        assert_eq!(rotated.get_pixel(0, 0), &Rgb([255, 0, 0]));
    }
}
