// Splits an upright spine crop into phrase-sized regions for line recognition
//
// Otsu binarization, polarity detection, then row and column projection
// profiles. Deterministic: same pixels, same regions.

use image::GrayImage;
use imageproc::contrast::otsu_level;
use tracing::trace;

/// Below this gap between class means the crop is treated as blank
const MIN_CONTRAST: f32 = 24.0;
/// Row gaps up to this many pixels don't split a text band
const ROW_GAP_MERGE: usize = 2;
const MIN_BAND_HEIGHT: usize = 6;
/// Column gap, relative to band height, that separates two phrases
const WORD_GAP_RATIO: f32 = 0.8;
const MIN_SEGMENT_WIDTH: usize = 4;
const REGION_PADDING: u32 = 2;
pub const MAX_REGIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Phrase regions in reading order (top to bottom, then left to right)
pub fn segment_text_regions(gray: &GrayImage) -> Vec<TextRegion> {
    let (w, h) = gray.dimensions();
    if (w as usize) < MIN_SEGMENT_WIDTH || (h as usize) < MIN_BAND_HEIGHT {
        return Vec::new();
    }

    let level = otsu_level(gray);
    let Some(ink) = ink_mask(gray, level) else {
        trace!("Crop {}x{} has no usable contrast", w, h);
        return Vec::new();
    };

    let (w, h) = (w as usize, h as usize);
    let row_threshold = (w / 100).max(1);
    let row_profile: Vec<usize> = (0..h)
        .map(|y| ink[y * w..(y + 1) * w].iter().filter(|&&on| on).count())
        .collect();

    let bands: Vec<(usize, usize)> = runs(&row_profile, row_threshold, ROW_GAP_MERGE)
        .into_iter()
        .filter(|(start, end)| end - start >= MIN_BAND_HEIGHT)
        .collect();

    let mut regions = Vec::new();
    'bands: for (top, bottom) in bands {
        let band_height = bottom - top;
        let col_profile: Vec<usize> = (0..w)
            .map(|x| (top..bottom).filter(|&y| ink[y * w + x]).count())
            .collect();
        let max_gap = (band_height as f32 * WORD_GAP_RATIO) as usize;

        for (left, right) in runs(&col_profile, 1, max_gap) {
            if right - left < MIN_SEGMENT_WIDTH {
                continue;
            }
            regions.push(padded(left, top, right, bottom, w, h));
            if regions.len() == MAX_REGIONS {
                break 'bands;
            }
        }
    }

    trace!("Segmented {} text regions (otsu level {})", regions.len(), level);
    regions
}

/// Foreground mask with text pixels set, or None for a blank crop
fn ink_mask(gray: &GrayImage, level: u8) -> Option<Vec<bool>> {
    let (mut dark_sum, mut dark_count) = (0u64, 0u64);
    let (mut light_sum, mut light_count) = (0u64, 0u64);
    for p in gray.pixels() {
        let v = p[0];
        if v <= level {
            dark_sum += v as u64;
            dark_count += 1;
        } else {
            light_sum += v as u64;
            light_count += 1;
        }
    }
    if dark_count == 0 || light_count == 0 {
        return None;
    }

    let contrast = light_sum as f32 / light_count as f32 - dark_sum as f32 / dark_count as f32;
    if contrast < MIN_CONTRAST {
        return None;
    }

    // Text is the minority class: light text on a dark spine flips polarity
    let light_text = dark_count > light_count;
    Some(
        gray.pixels()
            .map(|p| if light_text { p[0] > level } else { p[0] <= level })
            .collect(),
    )
}

/// Half-open `[start, end)` runs where `profile >= threshold`, joining runs
/// separated by at most `max_gap` entries
fn runs(profile: &[usize], threshold: usize, max_gap: usize) -> Vec<(usize, usize)> {
    let mut out: Vec<(usize, usize)> = Vec::new();
    let mut start = None;

    for (i, &value) in profile.iter().enumerate() {
        match (value >= threshold, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                push_run(&mut out, (s, i), max_gap);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        push_run(&mut out, (s, profile.len()), max_gap);
    }
    out
}

fn push_run(out: &mut Vec<(usize, usize)>, run: (usize, usize), max_gap: usize) {
    match out.last_mut() {
        Some(last) if run.0 - last.1 <= max_gap => last.1 = run.1,
        _ => out.push(run),
    }
}

fn padded(left: usize, top: usize, right: usize, bottom: usize, w: usize, h: usize) -> TextRegion {
    let pad = REGION_PADDING as usize;
    let x1 = left.saturating_sub(pad);
    let y1 = top.saturating_sub(pad);
    let x2 = (right + pad).min(w);
    let y2 = (bottom + pad).min(h);
    TextRegion {
        x: x1 as u32,
        y: y1 as u32,
        width: (x2 - x1) as u32,
        height: (y2 - y1) as u32,
    }
}
