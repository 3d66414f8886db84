// Spine Pipeline: per-request workflow coordinator
//
// prepare -> detect -> (early exit) -> crop -> read -> resolve, strictly in
// sequence. CPU-bound stages run on the blocking pool; resolution failures
// are rendered into the response instead of failing the request.

use crate::core::config::Config;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{BookInfo, IdentifyResponse, StageTimings};
use crate::middleware::KeyStats;
use crate::services::{
    build_provider, BookResolver, ImagePreparer, OnnxSpineDetector, OnnxTextReader,
    RegionExtractor, SpineDetector, TextReader,
};
use crate::utils::Metrics;
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{error, info, instrument, warn};

/// Main per-request orchestrator
pub struct SpinePipeline {
    preparer: ImagePreparer,
    detector: Arc<dyn SpineDetector>,
    extractor: RegionExtractor,
    reader: Arc<dyn TextReader>,
    resolver: BookResolver,
    metrics: Metrics,
    confidence_threshold: f32,
}

fn join_failed(err: JoinError) -> PipelineError {
    error!("Blocking pipeline task failed: {:?}", err);
    PipelineError::TaskJoinFailed(err.to_string())
}

impl SpinePipeline {
    pub fn new(
        preparer: ImagePreparer,
        detector: Arc<dyn SpineDetector>,
        reader: Arc<dyn TextReader>,
        resolver: BookResolver,
        metrics: Metrics,
        confidence_threshold: f32,
    ) -> Self {
        Self {
            preparer,
            detector,
            extractor: RegionExtractor::new(),
            reader,
            resolver,
            metrics,
            confidence_threshold,
        }
    }

    /// Wire the ONNX detector, ONNX reader and configured provider
    ///
    /// Models load lazily; call `warm_up` to load them ahead of traffic.
    #[instrument(skip_all)]
    pub fn from_config(config: &Config, metrics: Metrics) -> Result<Self> {
        info!("Initializing services...");

        let detector = Arc::new(OnnxSpineDetector::new(&config.detection));
        let reader = Arc::new(OnnxTextReader::new(
            &config.ocr,
            config.onnx_pool_size(),
            config.detection.inference_backend.clone(),
        ));
        let resolver = BookResolver::new(build_provider(&config.resolver)?);

        info!(
            "✓ Ready (target {}px, threshold {:.2}, resolver: {})",
            config.target_size(),
            config.confidence_threshold(),
            resolver.provider_name()
        );

        Ok(Self::new(
            ImagePreparer::new(config.target_size()),
            detector,
            reader,
            resolver,
            metrics,
            config.confidence_threshold(),
        ))
    }

    /// Load detector and OCR weights now instead of on the first request
    ///
    /// Failures are logged; the next request retries the load.
    pub async fn warm_up(&self) {
        let detector = Arc::clone(&self.detector);
        let reader = Arc::clone(&self.reader);
        let start = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || {
            let detector_ready = detector.warm_up();
            let reader_ready = reader.ensure_ready();
            (detector_ready, reader_ready)
        })
        .await;

        match outcome {
            Ok((detector_ready, reader_ready)) => {
                if let Err(e) = detector_ready {
                    warn!("Detector warm-up failed: {}", e);
                }
                if let Err(e) = reader_ready {
                    warn!("OCR warm-up failed: {}", e);
                }
            }
            Err(e) => warn!("Warm-up task failed: {}", e),
        }
        info!("Warm-up finished in {:.2}s", start.elapsed().as_secs_f64());
    }

    pub fn detector_backend(&self) -> String {
        self.detector.backend()
    }

    pub fn detector_ready(&self) -> bool {
        self.detector.is_ready()
    }

    pub fn reader_ready(&self) -> bool {
        self.reader.is_ready()
    }

    pub fn resolver_name(&self) -> &'static str {
        self.resolver.provider_name()
    }

    /// Health of the resolver's API keys (empty for single-key adapters)
    pub async fn key_stats(&self) -> Vec<KeyStats> {
        self.resolver.key_stats().await
    }

    /// Run the full identification workflow on one uploaded image
    #[instrument(skip_all, fields(bytes = raw_bytes.len()))]
    pub async fn identify(&self, raw_bytes: Vec<u8>) -> PipelineResult<IdentifyResponse> {
        let request_start = Instant::now();
        let mut timings = StageTimings::default();

        // Stage 1+2: decode/letterbox and detect
        let preparer = self.preparer;
        let detector = Arc::clone(&self.detector);
        let threshold = self.confidence_threshold;
        let (prepared, detections, prepare_time, detect_time) =
            tokio::task::spawn_blocking(move || -> PipelineResult<_> {
                let stage_start = Instant::now();
                let prepared = preparer.prepare(&raw_bytes)?;
                let prepare_time = stage_start.elapsed();

                let stage_start = Instant::now();
                let detections = detector.detect(&prepared, threshold)?;
                Ok((prepared, detections, prepare_time, stage_start.elapsed()))
            })
            .await
            .map_err(join_failed)??;
        timings.prepare = prepare_time;
        timings.detect = detect_time;

        if detections.is_empty() {
            info!("No spines above {:.2}, skipping OCR and resolution", threshold);
            self.metrics.record_no_spines();
            self.metrics.record_stage_timings(&timings);
            return Ok(IdentifyResponse::no_spines());
        }
        self.metrics.record_spines_detected(detections.len());

        // Stage 3+4: crop and read
        let extractor = self.extractor;
        let reader = Arc::clone(&self.reader);
        let (candidate_sets, ocr_failures, read_time) =
            tokio::task::spawn_blocking(move || -> PipelineResult<_> {
                let stage_start = Instant::now();
                reader.ensure_ready()?;
                let crops = extractor.crop(&prepared, &detections);
                let (sets, failures) = reader.read_all_counted(&crops);
                Ok((sets, failures, stage_start.elapsed()))
            })
            .await
            .map_err(join_failed)??;
        timings.read = read_time;
        if ocr_failures > 0 {
            warn!("{} of {} crops failed OCR", ocr_failures, candidate_sets.len());
            self.metrics.record_ocr_failures(ocr_failures);
        }

        // Stage 5: one batched resolution call
        let stage_start = Instant::now();
        let resolution = self.resolver.resolve(&candidate_sets).await;
        timings.resolve = stage_start.elapsed();
        self.metrics
            .record_resolver_call(resolution.as_ref().err().map(|e| e.kind()), timings.resolve);
        self.metrics.record_stage_timings(&timings);

        let book_info = match resolution {
            Ok(books) => BookInfo::Books(books),
            Err(e) => BookInfo::Error(e.to_body()),
        };

        info!(
            "✓ Identified {} spines in {:.2}ms (prepare {:.1}ms, detect {:.1}ms, read {:.1}ms, resolve {:.1}ms)",
            candidate_sets.len(),
            request_start.elapsed().as_secs_f64() * 1000.0,
            timings.prepare.as_secs_f64() * 1000.0,
            timings.detect.as_secs_f64() * 1000.0,
            timings.read.as_secs_f64() * 1000.0,
            timings.resolve.as_secs_f64() * 1000.0,
        );

        Ok(IdentifyResponse {
            detections: candidate_sets,
            book_info: Some(book_info),
            success: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{DetectionError, DetectionResult, OcrResult, ResolutionError};
    use crate::core::types::{Detection, OcrCandidate, OcrCandidateSet, PreparedImage};
    use crate::services::resolver::providers::CompletionProvider;
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedDetector(DetectionResult<Vec<Detection>>);

    impl SpineDetector for FixedDetector {
        fn detect(&self, _: &PreparedImage, threshold: f32) -> DetectionResult<Vec<Detection>> {
            match &self.0 {
                Ok(dets) => Ok(dets
                    .iter()
                    .copied()
                    .filter(|d| d.confidence >= threshold)
                    .collect()),
                Err(DetectionError::ModelUnavailable(m)) => {
                    Err(DetectionError::ModelUnavailable(m.clone()))
                }
                Err(DetectionError::Inference(m)) => Err(DetectionError::Inference(m.clone())),
            }
        }
    }

    /// Names each crop by its rotated width
    struct WidthReader;

    impl TextReader for WidthReader {
        fn read(&self, crop: &DynamicImage) -> OcrResult<OcrCandidateSet> {
            let text = match crop.width() {
                290 => "DUNE FRANK HERBERT",
                190 => "EMMA JANE AUSTEN",
                _ => return Ok(Vec::new()),
            };
            Ok(vec![OcrCandidate {
                text: text.to_string(),
                confidence: 0.95,
            }])
        }
    }

    struct CountingProvider {
        reply: Result<String, ResolutionError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CompletionProvider for CountingProvider {
        async fn complete(&self, _prompt: &str) -> Result<String, ResolutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    const TWO_BOOKS: &str = r#"[
        {"title": "Dune", "author": "Frank Herbert", "ISBN": "9780441013593", "description": "Politics and sand on Arrakis."},
        {"title": "Emma", "author": "Jane Austen", "ISBN": "N/A", "description": "A matchmaker misreads everyone."}
    ]"#;

    fn two_spines() -> Vec<Detection> {
        vec![
            Detection {
                bbox: [10, 10, 60, 300],
                confidence: 0.91,
            },
            Detection {
                bbox: [100, 10, 130, 200],
                confidence: 0.84,
            },
        ]
    }

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::new(320, 320));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn build(
        detections: DetectionResult<Vec<Detection>>,
        reply: Result<String, ResolutionError>,
    ) -> (SpinePipeline, Arc<CountingProvider>, Metrics) {
        let provider = Arc::new(CountingProvider {
            reply,
            calls: AtomicUsize::new(0),
        });
        let metrics = Metrics::new();
        let pipeline = SpinePipeline::new(
            ImagePreparer::new(640),
            Arc::new(FixedDetector(detections)),
            Arc::new(WidthReader),
            BookResolver::new(provider.clone()),
            metrics.clone(),
            0.5,
        );
        (pipeline, provider, metrics)
    }

    #[tokio::test]
    async fn test_two_spines_end_to_end() {
        let (pipeline, provider, metrics) = build(Ok(two_spines()), Ok(TWO_BOOKS.to_string()));
        let response = pipeline.identify(png_bytes()).await.unwrap();

        assert!(response.success);
        assert_eq!(response.detections.len(), 2);
        assert_eq!(response.detections[0][0].text, "DUNE FRANK HERBERT");
        assert_eq!(response.detections[1][0].text, "EMMA JANE AUSTEN");
        match response.book_info {
            Some(BookInfo::Books(books)) => {
                assert_eq!(books.len(), 2);
                for book in &books {
                    assert!(!book.title.is_empty());
                    assert!(!book.author.is_empty());
                    assert!(!book.description.is_empty());
                }
            }
            other => panic!("expected books, got {:?}", other),
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.spines_detected, 2);
        assert_eq!(snapshot.resolver_calls_success, 1);
    }

    #[tokio::test]
    async fn test_no_detections_exits_early() {
        let low = vec![Detection {
            bbox: [0, 0, 10, 10],
            confidence: 0.2,
        }];
        let (pipeline, provider, metrics) = build(Ok(low), Ok(TWO_BOOKS.to_string()));
        let response = pipeline.identify(png_bytes()).await.unwrap();

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"detections": [], "success": true})
        );
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.snapshot().requests_no_spines, 1);
    }

    #[tokio::test]
    async fn test_resolution_error_is_rendered() {
        let quota = ResolutionError::QuotaExceeded {
            message: "slow down".to_string(),
            retry_after_seconds: Some(12.5),
        };
        let (pipeline, _, metrics) = build(Ok(two_spines()), Err(quota));
        let response = pipeline.identify(png_bytes()).await.unwrap();

        assert!(response.success);
        assert_eq!(response.detections.len(), 2);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["book_info"]["error"], "quota_exceeded");
        assert_eq!(body["book_info"]["retry_after_seconds"], 12.5);
        assert_eq!(metrics.snapshot().resolver_errors.get("quota_exceeded"), Some(&1));
    }

    #[tokio::test]
    async fn test_fatal_errors() {
        let (pipeline, _, _) = build(Ok(two_spines()), Ok(TWO_BOOKS.to_string()));
        let err = pipeline.identify(b"not an image".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), "decode_error");

        let (pipeline, provider, _) = build(
            Err(DetectionError::ModelUnavailable("weights missing".into())),
            Ok(TWO_BOOKS.to_string()),
        );
        let err = pipeline.identify(png_bytes()).await.unwrap_err();
        assert_eq!(err.kind(), "model_unavailable");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
