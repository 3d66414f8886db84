use crate::core::config::DetectionConfig;
use crate::core::errors::{DetectionError, DetectionResult};
use crate::core::types::{Detection, PreparedImage};
use crate::services::model_handle::LazyModel;
use crate::services::onnx_builder::{build_session_pool, OnnxSessionPool};
use anyhow::Context;
use ndarray::Array4;
use ort::value::Value;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, instrument, trace};

/// Locates book spines in a letterboxed image
///
/// Implementations are shared read-only across requests and called from
/// blocking threads.
pub trait SpineDetector: Send + Sync {
    /// Boxes in PreparedImage pixel space with `confidence >= confidence_threshold`,
    /// highest confidence first. An empty list is a valid result.
    fn detect(
        &self,
        image: &PreparedImage,
        confidence_threshold: f32,
    ) -> DetectionResult<Vec<Detection>>;

    /// Load weights ahead of the first request
    fn warm_up(&self) -> DetectionResult<()> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        true
    }

    /// Compute backend name for health reporting
    fn backend(&self) -> String {
        "unknown".to_string()
    }
}

struct LoadedDetector {
    backend: String,
    input_name: String,
    pool: OnnxSessionPool,
}

/// YOLO-family ONNX spine detector
pub struct OnnxSpineDetector {
    model: LazyModel<LoadedDetector>,
    iou_threshold: f32,
}

impl OnnxSpineDetector {
    /// Weights are loaded on first use (or by `warm_up`)
    pub fn new(config: &DetectionConfig) -> Self {
        let model_path = PathBuf::from(&config.detector_model_path);
        let pool_size = config.onnx_pool_size;
        let backend = config.inference_backend.clone();

        let model = LazyModel::new("spine detector", move || {
            let (backend, pool) =
                build_session_pool(&model_path, "spine detector", pool_size, backend.as_deref())?;
            let input_name = {
                let session = pool.acquire()?;
                session
                    .inputs
                    .first()
                    .map(|input| input.name.clone())
                    .context("Detector model declares no inputs")?
            };
            Ok(LoadedDetector {
                backend,
                input_name,
                pool,
            })
        });

        Self {
            model,
            iou_threshold: config.iou_threshold,
        }
    }

    fn loaded(&self) -> DetectionResult<std::sync::Arc<LoadedDetector>> {
        self.model
            .get()
            .map_err(|e| DetectionError::ModelUnavailable(format!("{:#}", e)))
    }

    /// NCHW float tensor in [0, 1]
    fn preprocess(image: &PreparedImage) -> Array4<f32> {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let mut array = Array4::<f32>::zeros((1, 3, h, w));

        for (x, y, pixel) in image.pixels.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            array[[0, 0, y, x]] = pixel[0] as f32 / 255.0;
            array[[0, 1, y, x]] = pixel[1] as f32 / 255.0;
            array[[0, 2, y, x]] = pixel[2] as f32 / 255.0;
        }

        trace!("Preprocessed detector input: [1, 3, {}, {}]", h, w);
        array
    }
}

impl SpineDetector for OnnxSpineDetector {
    #[instrument(skip_all, fields(threshold = confidence_threshold))]
    fn detect(
        &self,
        image: &PreparedImage,
        confidence_threshold: f32,
    ) -> DetectionResult<Vec<Detection>> {
        let detector = self.loaded()?;
        let detection_start = Instant::now();

        let input_value = Value::from_array(Self::preprocess(image))?;

        // Acquire session, run, and copy outputs before the session goes back
        let (dims, predictions) = {
            let mut session = detector
                .pool
                .acquire()
                .map_err(|e| DetectionError::Inference(e.to_string()))?;
            let outputs =
                session.run(ort::inputs![detector.input_name.as_str() => input_value])?;

            let first_key = outputs
                .keys()
                .next()
                .ok_or_else(|| DetectionError::Inference("Detector produced no outputs".into()))?;
            let (shape, data) = outputs[first_key].try_extract_tensor::<f32>()?;

            let dims: Vec<usize> = shape.iter().map(|&x| x.max(0) as usize).collect();
            (dims, data.to_vec())
        };

        let detections =
            decode_predictions(&dims, &predictions, confidence_threshold, self.iou_threshold)?;

        debug!(
            "✓ Detection on {}: {} spines in {:.2}ms",
            detector.backend,
            detections.len(),
            detection_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(detections)
    }

    fn warm_up(&self) -> DetectionResult<()> {
        self.loaded().map(|_| ())
    }

    fn is_ready(&self) -> bool {
        self.model.is_loaded()
    }

    fn backend(&self) -> String {
        self.model
            .get_if_loaded()
            .map(|d| d.backend.clone())
            .unwrap_or_else(|| "not loaded".to_string())
    }
}

/// Decode a detector output tensor into thresholded, confidence-ordered boxes
///
/// Supported layouts:
/// - `[1, 4 + C, N]`: raw head (cx, cy, w, h, class scores), NMS applied here
/// - `[1, N, 6]`: end-to-end head (x1, y1, x2, y2, score, class), already suppressed
pub fn decode_predictions(
    dims: &[usize],
    data: &[f32],
    confidence_threshold: f32,
    iou_threshold: f32,
) -> DetectionResult<Vec<Detection>> {
    if dims.len() != 3 || dims[0] != 1 {
        return Err(DetectionError::Inference(format!(
            "Unexpected detector output shape: {:?}",
            dims
        )));
    }
    let expected: usize = dims.iter().product();
    if data.len() != expected {
        return Err(DetectionError::Inference(format!(
            "Detector output has {} values, shape {:?} needs {}",
            data.len(),
            dims,
            expected
        )));
    }

    let mut detections = if dims[2] == 6 {
        decode_end_to_end(dims[1], data, confidence_threshold)
    } else if dims[1] >= 5 {
        let candidates = decode_raw(dims[1], dims[2], data, confidence_threshold);
        nms(candidates, iou_threshold)
    } else {
        return Err(DetectionError::Inference(format!(
            "Detector output shape {:?} is neither [1, 4+C, N] nor [1, N, 6]",
            dims
        )));
    };

    detections.retain(|d| d.confidence >= confidence_threshold);
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(detections)
}

fn decode_raw(channels: usize, anchors: usize, data: &[f32], threshold: f32) -> Vec<Detection> {
    let at = |row: usize, i: usize| data[row * anchors + i];
    let mut out = Vec::new();

    for i in 0..anchors {
        let score = (4..channels)
            .map(|row| at(row, i))
            .fold(f32::NEG_INFINITY, f32::max);
        if !(score >= threshold) {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        let bbox = [
            (cx - w / 2.0) as i32,
            (cy - h / 2.0) as i32,
            (cx + w / 2.0) as i32,
            (cy + h / 2.0) as i32,
        ];
        trace!("Anchor {}: bbox={:?}, conf={:.3}", i, bbox, score);
        out.push(Detection {
            bbox,
            confidence: score,
        });
    }

    debug!("Decoded {} raw candidates above {:.2}", out.len(), threshold);
    out
}

fn decode_end_to_end(rows: usize, data: &[f32], threshold: f32) -> Vec<Detection> {
    data.chunks_exact(6)
        .take(rows)
        .filter(|row| row[4] >= threshold)
        .map(|row| Detection {
            bbox: [row[0] as i32, row[1] as i32, row[2] as i32, row[3] as i32],
            confidence: row[4],
        })
        .collect()
}

fn calculate_iou(box1: &[i32; 4], box2: &[i32; 4]) -> f32 {
    let x1 = box1[0].max(box2[0]);
    let y1 = box1[1].max(box2[1]);
    let x2 = box1[2].min(box2[2]);
    let y2 = box1[3].min(box2[3]);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = ((x2 - x1) as f32) * ((y2 - y1) as f32);
    let area1 = ((box1[2] - box1[0]) as f32) * ((box1[3] - box1[1]) as f32);
    let area2 = ((box2[2] - box2[0]) as f32) * ((box2[3] - box2[1]) as f32);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

fn nms(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    if detections.is_empty() {
        return vec![];
    }

    let mut sorted = detections;
    sorted.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; sorted.len()];

    for i in 0..sorted.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(sorted[i]);

        for j in (i + 1)..sorted.len() {
            if !suppressed[j] && calculate_iou(&sorted[i].bbox, &sorted[j].bbox) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    debug!(
        "NMS: Kept {}/{} detections (IoU threshold {})",
        keep.len(),
        sorted.len(),
        iou_threshold
    );
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a `[1, 5, N]` single-class raw head from (cx, cy, w, h, score) rows
    fn raw_head(anchors: &[[f32; 5]]) -> (Vec<usize>, Vec<f32>) {
        let n = anchors.len();
        let mut data = vec![0.0; 5 * n];
        for (i, a) in anchors.iter().enumerate() {
            for (row, v) in a.iter().enumerate() {
                data[row * n + i] = *v;
            }
        }
        (vec![1, 5, n], data)
    }

    #[test]
    fn test_raw_head_threshold_and_order() {
        let (dims, data) = raw_head(&[
            [100.0, 200.0, 20.0, 300.0, 0.6],
            [300.0, 200.0, 20.0, 300.0, 0.3],
            [500.0, 200.0, 40.0, 300.0, 0.9],
        ]);
        let dets = decode_predictions(&dims, &data, 0.5, 0.7).unwrap();

        assert_eq!(dets.len(), 2);
        assert!(dets.iter().all(|d| d.confidence >= 0.5));
        assert_eq!(dets[0].bbox, [480, 50, 520, 350]);
        assert_eq!(dets[1].bbox, [90, 50, 110, 350]);
    }

    #[test]
    fn test_raw_head_suppresses_duplicates() {
        let (dims, data) = raw_head(&[
            [100.0, 200.0, 20.0, 300.0, 0.8],
            [101.0, 201.0, 20.0, 300.0, 0.7],
            [160.0, 200.0, 20.0, 300.0, 0.75],
        ]);
        let dets = decode_predictions(&dims, &data, 0.5, 0.7).unwrap();

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].confidence, 0.8);
        assert_eq!(dets[1].confidence, 0.75);
    }

    #[test]
    fn test_raw_head_uses_best_class_score() {
        // Two-class raw head [1, 6, 2]
        let dims = vec![1, 6, 2];
        let data = vec![
            50.0, 150.0, // cx
            50.0, 50.0, // cy
            10.0, 10.0, // w
            10.0, 10.0, // h
            0.1, 0.2, // class 0
            0.9, 0.4, // class 1
        ];
        let dets = decode_predictions(&dims, &data, 0.5, 0.7).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].bbox, [45, 45, 55, 55]);
        assert_eq!(dets[0].confidence, 0.9);
    }

    #[test]
    fn test_end_to_end_head() {
        let dims = vec![1, 3, 6];
        let data = vec![
            10.0, 20.0, 30.0, 400.0, 0.55, 0.0, //
            50.5, 20.9, 80.2, 400.7, 0.95, 0.0, //
            90.0, 20.0, 120.0, 400.0, 0.10, 0.0,
        ];
        let dets = decode_predictions(&dims, &data, 0.5, 0.7).unwrap();

        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].bbox, [50, 20, 80, 400]);
        assert_eq!(dets[1].confidence, 0.55);
    }

    #[test]
    fn test_nothing_above_threshold_is_empty() {
        let (dims, data) = raw_head(&[[100.0, 100.0, 10.0, 10.0, 0.2]]);
        assert!(decode_predictions(&dims, &data, 0.5, 0.7).unwrap().is_empty());
    }

    #[test]
    fn test_bad_shapes_are_inference_errors() {
        assert!(matches!(
            decode_predictions(&[1, 3, 10], &[0.0; 30], 0.5, 0.7),
            Err(DetectionError::Inference(_))
        ));
        assert!(matches!(
            decode_predictions(&[1, 5, 10], &[0.0; 7], 0.5, 0.7),
            Err(DetectionError::Inference(_))
        ));
    }

    #[test]
    fn test_calculate_iou() {
        assert_eq!(calculate_iou(&[0, 0, 10, 10], &[20, 20, 30, 30]), 0.0);
        assert_eq!(calculate_iou(&[0, 0, 10, 10], &[0, 0, 10, 10]), 1.0);
        let iou = calculate_iou(&[0, 0, 10, 10], &[5, 0, 15, 10]);
        assert!((iou - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_weights_is_model_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let config = DetectionConfig {
            confidence_threshold: 0.5,
            iou_threshold: 0.7,
            target_size: 640,
            inference_backend: Some("CPU".to_string()),
            detector_model_path: dir.path().join("missing.onnx").display().to_string(),
            onnx_pool_size: 1,
        };
        let detector = OnnxSpineDetector::new(&config);

        assert!(!detector.is_ready());
        assert!(matches!(
            detector.warm_up(),
            Err(DetectionError::ModelUnavailable(_))
        ));
        assert_eq!(detector.backend(), "not loaded");
    }
}
