use crate::core::types::StageTimings;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency samples kept per series; older samples are dropped first
const MAX_SAMPLES: usize = 10_000;

/// Global metrics collector for the application.
///
/// Tracks requests, detections, OCR failures, resolver outcomes and stage
/// durations. Thread-safe and cheap to clone.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Request Metrics
    requests_total: AtomicUsize,
    requests_failed: AtomicUsize,
    requests_no_spines: AtomicUsize,

    // Pipeline Metrics
    spines_detected: AtomicUsize,
    ocr_crops_failed: AtomicUsize,

    // Resolver Metrics
    resolver_calls_total: AtomicUsize,
    resolver_calls_success: AtomicUsize,
    resolver_errors: DashMap<&'static str, AtomicUsize>,
    resolver_latency_ms: RwLock<VecDeque<u64>>,

    // Stage Metrics
    prepare_duration_ms: RwLock<VecDeque<u64>>,
    detect_duration_ms: RwLock<VecDeque<u64>>,
    read_duration_ms: RwLock<VecDeque<u64>>,
    resolve_duration_ms: RwLock<VecDeque<u64>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    // Start time for uptime calculation
    start_time: Instant,
}

fn push_sample(samples: &RwLock<VecDeque<u64>>, duration: Duration) {
    let mut samples = samples.write();
    if samples.len() >= MAX_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(duration.as_millis() as u64);
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                requests_failed: AtomicUsize::new(0),
                requests_no_spines: AtomicUsize::new(0),
                spines_detected: AtomicUsize::new(0),
                ocr_crops_failed: AtomicUsize::new(0),
                resolver_calls_total: AtomicUsize::new(0),
                resolver_calls_success: AtomicUsize::new(0),
                resolver_errors: DashMap::new(),
                resolver_latency_ms: RwLock::new(VecDeque::new()),
                prepare_duration_ms: RwLock::new(VecDeque::new()),
                detect_duration_ms: RwLock::new(VecDeque::new()),
                read_duration_ms: RwLock::new(VecDeque::new()),
                resolve_duration_ms: RwLock::new(VecDeque::new()),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Request Metrics
    pub fn record_request(&self, success: bool) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_no_spines(&self) {
        self.inner.requests_no_spines.fetch_add(1, Ordering::Relaxed);
    }

    // Pipeline Metrics
    pub fn record_spines_detected(&self, count: usize) {
        self.inner.spines_detected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_ocr_failures(&self, count: usize) {
        self.inner.ocr_crops_failed.fetch_add(count, Ordering::Relaxed);
    }

    // Resolver Metrics
    /// `error_kind` is `None` on success
    pub fn record_resolver_call(&self, error_kind: Option<&'static str>, duration: Duration) {
        self.inner.resolver_calls_total.fetch_add(1, Ordering::Relaxed);
        match error_kind {
            None => {
                self.inner.resolver_calls_success.fetch_add(1, Ordering::Relaxed);
            }
            Some(kind) => {
                self.inner
                    .resolver_errors
                    .entry(kind)
                    .or_insert_with(|| AtomicUsize::new(0))
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        push_sample(&self.inner.resolver_latency_ms, duration);
    }

    // Stage Metrics
    pub fn record_stage_timings(&self, timings: &StageTimings) {
        push_sample(&self.inner.prepare_duration_ms, timings.prepare);
        push_sample(&self.inner.detect_duration_ms, timings.detect);
        push_sample(&self.inner.read_duration_ms, timings.read);
        push_sample(&self.inner.resolve_duration_ms, timings.resolve);
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let resolver_latency = self.inner.resolver_latency_ms.read();
        let resolver_latency_avg = avg(&resolver_latency);
        let resolver_latency_p50 = percentile(&resolver_latency, 0.5);
        let resolver_latency_p95 = percentile(&resolver_latency, 0.95);
        drop(resolver_latency);

        let prepare_avg = avg(&self.inner.prepare_duration_ms.read());
        let detect_avg = avg(&self.inner.detect_duration_ms.read());
        let read_avg = avg(&self.inner.read_duration_ms.read());
        let resolve_avg = avg(&self.inner.resolve_duration_ms.read());

        let resolver_errors = self
            .inner
            .resolver_errors
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().load(Ordering::Relaxed)))
            .collect();

        let endpoint_requests = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            requests_no_spines: self.inner.requests_no_spines.load(Ordering::Relaxed),
            spines_detected: self.inner.spines_detected.load(Ordering::Relaxed),
            ocr_crops_failed: self.inner.ocr_crops_failed.load(Ordering::Relaxed),
            resolver_calls_total: self.inner.resolver_calls_total.load(Ordering::Relaxed),
            resolver_calls_success: self.inner.resolver_calls_success.load(Ordering::Relaxed),
            resolver_errors,
            resolver_latency_avg_ms: resolver_latency_avg,
            resolver_latency_p50_ms: resolver_latency_p50,
            resolver_latency_p95_ms: resolver_latency_p95,
            prepare_avg_ms: prepare_avg,
            detect_avg_ms: detect_avg,
            read_avg_ms: read_avg,
            resolve_avg_ms: resolve_avg,
            endpoint_requests,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP requests_total Total identify requests
# TYPE requests_total counter
requests_total {{}} {}

# HELP requests_failed_total Identify requests that ended in an error status
# TYPE requests_failed_total counter
requests_failed_total {{}} {}

# HELP requests_no_spines_total Identify requests with no qualifying spines
# TYPE requests_no_spines_total counter
requests_no_spines_total {{}} {}

# HELP spines_detected_total Spines detected across all requests
# TYPE spines_detected_total counter
spines_detected_total {{}} {}

# HELP ocr_crops_failed_total Crops whose OCR failed and were returned empty
# TYPE ocr_crops_failed_total counter
ocr_crops_failed_total {{}} {}

# HELP resolver_calls_total Upstream resolution calls
# TYPE resolver_calls_total counter
resolver_calls_total {{}} {}

# HELP resolver_calls_success_total Resolution calls that produced books
# TYPE resolver_calls_success_total counter
resolver_calls_success_total {{}} {}

# HELP resolver_latency_avg_ms Average resolution latency in milliseconds
# TYPE resolver_latency_avg_ms gauge
resolver_latency_avg_ms {{}} {}

# HELP stage_avg_duration_ms Average stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
stage_avg_duration_ms {{stage="prepare"}} {}
stage_avg_duration_ms {{stage="detect"}} {}
stage_avg_duration_ms {{stage="read"}} {}
stage_avg_duration_ms {{stage="resolve"}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.requests_total,
            snapshot.requests_failed,
            snapshot.requests_no_spines,
            snapshot.spines_detected,
            snapshot.ocr_crops_failed,
            snapshot.resolver_calls_total,
            snapshot.resolver_calls_success,
            snapshot.resolver_latency_avg_ms,
            snapshot.prepare_avg_ms,
            snapshot.detect_avg_ms,
            snapshot.read_avg_ms,
            snapshot.resolve_avg_ms,
            snapshot.uptime_seconds,
        );

        if !snapshot.resolver_errors.is_empty() {
            out.push_str("\n# HELP resolver_errors_total Resolution failures by kind\n");
            out.push_str("# TYPE resolver_errors_total counter\n");
            for (kind, count) in &snapshot.resolver_errors {
                out.push_str(&format!("resolver_errors_total {{kind=\"{}\"}} {}\n", kind, count));
            }
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub requests_failed: usize,
    pub requests_no_spines: usize,
    pub spines_detected: usize,
    pub ocr_crops_failed: usize,
    pub resolver_calls_total: usize,
    pub resolver_calls_success: usize,
    pub resolver_errors: BTreeMap<String, usize>,
    pub resolver_latency_avg_ms: u64,
    pub resolver_latency_p50_ms: u64,
    pub resolver_latency_p95_ms: u64,
    pub prepare_avg_ms: u64,
    pub detect_avg_ms: u64,
    pub read_avg_ms: u64,
    pub resolve_avg_ms: u64,
    pub endpoint_requests: BTreeMap<String, usize>,
    pub uptime_seconds: u64,
}

fn percentile(values: &VecDeque<u64>, p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = values.iter().copied().collect();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &VecDeque<u64>) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
