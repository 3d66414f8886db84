// OCR Service Module - spine text recognition
//
// A spine crop is split into phrase regions, and each region goes through a
// CTC line recognizer (PaddleOCR-style ONNX export). One region yields one
// candidate.

pub mod ctc;
pub mod segmentation;

use crate::core::config::OcrConfig;
use crate::core::errors::{OcrError, OcrResult};
use crate::core::types::{OcrCandidate, OcrCandidateSet, SpineCrop};
use crate::services::model_handle::LazyModel;
use crate::services::onnx_builder::{build_session_pool, OnnxSessionPool};
use anyhow::Context;
use ctc::{ctc_decode, Charset};
use image::{imageops, DynamicImage, RgbImage};
use ndarray::Array4;
use ort::value::Value;
use rayon::prelude::*;
use segmentation::segment_text_regions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Recognizer input height
const TARGET_HEIGHT: u32 = 48;
const MIN_WIDTH: u32 = 16;
const MAX_WIDTH: u32 = 1280;

/// Extracts text candidates from spine crops
///
/// Pixel format conversion is the reader's job; callers pass crops as-is.
pub trait TextReader: Send + Sync {
    /// Candidates for one crop in engine order; empty when no text is found
    fn read(&self, crop: &DynamicImage) -> OcrResult<OcrCandidateSet>;

    /// Fail fast when the engine cannot be loaded
    fn ensure_ready(&self) -> OcrResult<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    /// Read every crop in parallel; output is aligned with `crops`
    fn read_all(&self, crops: &[SpineCrop]) -> Vec<OcrCandidateSet> {
        self.read_all_counted(crops).0
    }

    /// Like `read_all`, also returning how many crops failed
    ///
    /// A failing crop becomes an empty set.
    fn read_all_counted(&self, crops: &[SpineCrop]) -> (Vec<OcrCandidateSet>, usize) {
        let results: Vec<OcrResult<OcrCandidateSet>> =
            crops.par_iter().map(|crop| self.read(&crop.image)).collect();

        let mut failures = 0;
        let sets = results
            .into_iter()
            .zip(crops)
            .map(|(result, crop)| {
                result.unwrap_or_else(|e| {
                    warn!("OCR failed for crop {}: {}", crop.index, e);
                    failures += 1;
                    Vec::new()
                })
            })
            .collect();
        (sets, failures)
    }
}

struct LoadedRecognizer {
    backend: String,
    input_name: String,
    pool: OnnxSessionPool,
    charset: Charset,
}

/// CTC line recognizer backed by ONNX Runtime
pub struct OnnxTextReader {
    model: LazyModel<LoadedRecognizer>,
}

impl OnnxTextReader {
    /// Weights and dictionary are loaded on first use (or by `ensure_ready`)
    pub fn new(config: &OcrConfig, pool_size: usize, inference_backend: Option<String>) -> Self {
        let model_path = PathBuf::from(&config.model_path);
        let dict_path = PathBuf::from(&config.dict_path);

        let model = LazyModel::new("OCR recognizer", move || {
            let charset = Charset::load(&dict_path)?;
            let (backend, pool) = build_session_pool(
                &model_path,
                "OCR recognizer",
                pool_size,
                inference_backend.as_deref(),
            )?;
            let input_name = {
                let session = pool.acquire()?;
                session
                    .inputs
                    .first()
                    .map(|input| input.name.clone())
                    .context("OCR model declares no inputs")?
            };
            Ok(LoadedRecognizer {
                backend,
                input_name,
                pool,
                charset,
            })
        });

        Self { model }
    }

    fn loaded(&self) -> OcrResult<Arc<LoadedRecognizer>> {
        self.model
            .get()
            .map_err(|e| OcrError::EngineUnavailable(format!("{:#}", e)))
    }

    /// Backend name once loaded
    pub fn backend(&self) -> Option<String> {
        self.model.get_if_loaded().map(|r| r.backend.clone())
    }

    fn recognize_line(&self, engine: &LoadedRecognizer, line: &RgbImage) -> OcrResult<(String, f32)> {
        let input_value = Value::from_array(preprocess_line(line))?;

        // Copy scores out before the session goes back to the pool
        let (dims, scores) = {
            let mut session = engine
                .pool
                .acquire()
                .map_err(|e| OcrError::Recognition(e.to_string()))?;
            let outputs = session.run(ort::inputs![engine.input_name.as_str() => input_value])?;

            let first_key = outputs
                .keys()
                .next()
                .ok_or_else(|| OcrError::Recognition("No outputs from OCR model".into()))?;
            let (shape, data) = outputs[first_key].try_extract_tensor::<f32>()?;

            let dims: Vec<usize> = shape.iter().map(|&x| x.max(0) as usize).collect();
            (dims, data.to_vec())
        };

        // [1, T, C] or [T, C]
        let (steps, classes) = match dims.as_slice() {
            [1, t, c] => (*t, *c),
            [t, c] => (*t, *c),
            other => {
                return Err(OcrError::Recognition(format!(
                    "Unexpected recognizer output shape: {:?}",
                    other
                )))
            }
        };
        if classes != engine.charset.len() {
            trace!(
                "Recognizer has {} classes, dictionary has {}",
                classes,
                engine.charset.len()
            );
        }

        Ok(ctc_decode(&scores, steps, classes, &engine.charset))
    }
}

impl TextReader for OnnxTextReader {
    #[instrument(skip_all, fields(w = crop.width(), h = crop.height()))]
    fn read(&self, crop: &DynamicImage) -> OcrResult<OcrCandidateSet> {
        let regions = segment_text_regions(&crop.to_luma8());
        if regions.is_empty() {
            debug!("No text regions in crop");
            return Ok(Vec::new());
        }

        let engine = self.loaded()?;
        let rgb = crop.to_rgb8();
        let mut candidates = Vec::with_capacity(regions.len());

        for region in regions {
            let line =
                imageops::crop_imm(&rgb, region.x, region.y, region.width, region.height).to_image();
            let (text, confidence) = self.recognize_line(&engine, &line)?;
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            trace!("Region {:?}: '{}' ({:.2})", region, text, confidence);
            candidates.push(OcrCandidate {
                text: text.to_string(),
                confidence,
            });
        }

        debug!("OCR produced {} candidates", candidates.len());
        Ok(candidates)
    }

    fn ensure_ready(&self) -> OcrResult<()> {
        self.loaded().map(|_| ())
    }

    fn is_ready(&self) -> bool {
        self.model.is_loaded()
    }
}

/// Resize to the recognizer height and normalize to [-1, 1], NCHW
fn preprocess_line(line: &RgbImage) -> Array4<f32> {
    let (w, h) = line.dimensions();
    let scale = TARGET_HEIGHT as f32 / h.max(1) as f32;
    let new_w = ((w as f32 * scale).round() as u32).clamp(MIN_WIDTH, MAX_WIDTH);

    let resized = imageops::resize(line, new_w, TARGET_HEIGHT, imageops::FilterType::Triangle);

    let mut array = Array4::<f32>::zeros((1, 3, TARGET_HEIGHT as usize, new_w as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            array[[0, c, y as usize, x as usize]] = (pixel[c] as f32 / 255.0 - 0.5) / 0.5;
        }
    }
    array
}
