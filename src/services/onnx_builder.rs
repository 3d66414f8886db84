// Shared ONNX Runtime session builder with hardware acceleration detection
//
// Used by both the spine detector and the OCR recognizer.

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::{bounded, Receiver, Sender};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use tracing::{debug, info, warn};

// Import acceleration providers based on features
#[cfg(feature = "tensorrt")]
use ort::execution_providers::TensorRTExecutionProvider;

#[cfg(feature = "cuda")]
use ort::execution_providers::CUDAExecutionProvider;

#[cfg(all(target_os = "macos", feature = "coreml"))]
use ort::execution_providers::CoreMLExecutionProvider;

#[cfg(all(target_os = "windows", feature = "directml"))]
use ort::execution_providers::DirectMLExecutionProvider;

#[cfg(feature = "openvino")]
use ort::execution_providers::OpenVINOExecutionProvider;

/// Thread count for ONNX Runtime CPU inference.
///
/// Windows is capped at 6 threads: synchronization overhead makes more cores slower.
/// Reference: https://github.com/microsoft/onnxruntime/issues/3713
///
/// Divided by the pool size so concurrent sessions don't oversubscribe the CPU.
fn optimal_intra_op_threads(pool_size: usize) -> usize {
    let total_cores = num_cpus::get();

    #[cfg(target_os = "windows")]
    let budget = std::cmp::min(6, total_cores);

    #[cfg(not(target_os = "windows"))]
    let budget = total_cores;

    let optimal = (budget / pool_size.max(1)).max(1);
    debug!(
        "CPU threads: {} total cores, {} per session ({} sessions)",
        total_cores, optimal, pool_size
    );
    optimal
}

/// Pool of ONNX Runtime sessions
///
/// `Session::run` needs `&mut Session`, so each in-flight inference takes a
/// session out of the pool. Bounded crossbeam channel: acquire blocks while
/// every session is busy.
pub struct OnnxSessionPool {
    sender: Sender<Session>,
    receiver: Receiver<Session>,
    size: usize,
}

impl OnnxSessionPool {
    pub fn new(sessions: Vec<Session>) -> Self {
        let size = sessions.len();
        let (sender, receiver) = bounded(size.max(1));
        for session in sessions {
            // Capacity equals the session count, so this never blocks
            let _ = sender.send(session);
        }
        Self {
            sender,
            receiver,
            size,
        }
    }

    /// Number of sessions owned by the pool
    pub fn size(&self) -> usize {
        self.size
    }

    /// Acquire a session (blocks if all sessions are in use)
    ///
    /// The session goes back to the pool when the guard drops, even if
    /// inference panics.
    pub fn acquire(&self) -> Result<PooledSession<'_>> {
        if self.size == 0 {
            return Err(anyhow!("Session pool is empty"));
        }
        let session = self
            .receiver
            .recv()
            .map_err(|_| anyhow!("Session pool channel closed"))?;
        Ok(PooledSession {
            session: Some(session),
            pool: self,
        })
    }

    fn release(&self, session: Session) {
        if self.sender.send(session).is_err() {
            warn!("Session pool closed, dropping session");
        }
    }
}

/// Session checked out of an [`OnnxSessionPool`]
pub struct PooledSession<'a> {
    session: Option<Session>,
    pool: &'a OnnxSessionPool,
}

impl Deref for PooledSession<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        // Only taken in Drop
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}

/// Load a model file and build `pool_size` sessions for it
///
/// Returns (backend_name, pool).
pub fn build_session_pool(
    model_path: &Path,
    model_name: &str,
    pool_size: usize,
    forced_backend: Option<&str>,
) -> Result<(String, OnnxSessionPool)> {
    let model_bytes = std::fs::read(model_path).with_context(|| {
        format!(
            "Failed to read {} model from {}",
            model_name,
            model_path.display()
        )
    })?;
    let model_size_mb = model_bytes.len() as f32 / (1024.0 * 1024.0);
    info!(
        "Loading {} model ({:.1} MB, {} sessions)",
        model_name, model_size_mb, pool_size
    );

    let pool_size = pool_size.max(1);
    let threads = optimal_intra_op_threads(pool_size);
    let mut backend = String::from("CPU");
    let mut sessions = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        let (name, session) = build_session_with_acceleration(
            &model_bytes,
            model_name,
            model_size_mb,
            threads,
            forced_backend,
        )?;
        backend = name;
        sessions.push(session);
    }

    info!("✓ {} model ready on {} ({} sessions)", model_name, backend, pool_size);
    Ok((backend, OnnxSessionPool::new(sessions)))
}

fn commit_with(
    provider: ExecutionProviderDispatch,
    model_bytes: &[u8],
    threads: usize,
) -> ort::Result<Session> {
    Session::builder()?
        .with_execution_providers([provider])?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads)?
        .with_inter_threads(1)?
        .commit_from_memory(model_bytes)
}

/// Build one session, trying acceleration providers compiled in via features
///
/// Order: TensorRT, CUDA, CoreML, DirectML, OpenVINO, then CPU.
pub fn build_session_with_acceleration(
    model_bytes: &[u8],
    model_name: &str,
    model_size_mb: f32,
    threads: usize,
    forced_backend: Option<&str>,
) -> Result<(String, Session)> {
    if let Some(backend) = forced_backend {
        if !backend.is_empty() && !backend.eq_ignore_ascii_case("auto") {
            debug!("INFERENCE_BACKEND={}, forcing backend for {}", backend, model_name);
            return try_forced_backend(backend, model_bytes, model_name, model_size_mb, threads);
        }
    }

    #[cfg(feature = "tensorrt")]
    {
        if let Ok(session) = commit_with(
            TensorRTExecutionProvider::default().build(),
            model_bytes,
            threads,
        ) {
            info!("✓ Using TensorRT acceleration for {}", model_name);
            return Ok(("TensorRT".to_string(), session));
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(session) =
            commit_with(CUDAExecutionProvider::default().build(), model_bytes, threads)
        {
            info!("✓ Using CUDA acceleration for {}", model_name);
            return Ok(("CUDA".to_string(), session));
        }
    }

    #[cfg(all(target_os = "macos", feature = "coreml"))]
    {
        if let Ok(session) =
            commit_with(CoreMLExecutionProvider::default().build(), model_bytes, threads)
        {
            info!("✓ Using CoreML acceleration for {}", model_name);
            return Ok(("CoreML".to_string(), session));
        }
    }

    #[cfg(all(target_os = "windows", feature = "directml"))]
    {
        // DirectML needs sequential execution and no memory pattern
        if let Ok(session) = Session::builder()
            .and_then(|b| b.with_execution_providers([DirectMLExecutionProvider::default().build()]))
            .and_then(|b| b.with_parallel_execution(false))
            .and_then(|b| b.with_memory_pattern(false))
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level1))
            .and_then(|b| b.with_intra_threads(threads))
            .and_then(|b| b.commit_from_memory(model_bytes))
        {
            info!("✓ Using DirectML acceleration for {}", model_name);
            return Ok(("DirectML".to_string(), session));
        }
    }

    #[cfg(feature = "openvino")]
    {
        if let Ok(session) = commit_with(
            OpenVINOExecutionProvider::default()
                .with_device_type("CPU")
                .build(),
            model_bytes,
            threads,
        ) {
            info!("✓ Using OpenVINO acceleration for {}", model_name);
            return Ok(("OpenVINO-CPU".to_string(), session));
        }
    }

    let session = commit_with(CPUExecutionProvider::default().build(), model_bytes, threads)
        .with_context(|| {
            format!(
                "Failed to load {} ONNX model ({:.1} MB). \
                The file may be corrupt or use an unsupported opset",
                model_name, model_size_mb
            )
        })?;

    debug!("Using CPU inference for {}", model_name);
    Ok(("CPU".to_string(), session))
}

/// Force a specific backend (for testing/debugging)
fn try_forced_backend(
    backend: &str,
    model_bytes: &[u8],
    model_name: &str,
    model_size_mb: f32,
    threads: usize,
) -> Result<(String, Session)> {
    let (label, provider): (&str, ExecutionProviderDispatch) =
        match backend.to_lowercase().as_str() {
            #[cfg(feature = "cuda")]
            "cuda" => ("CUDA", CUDAExecutionProvider::default().build()),

            #[cfg(feature = "tensorrt")]
            "tensorrt" => ("TensorRT", TensorRTExecutionProvider::default().build()),

            #[cfg(feature = "openvino")]
            "openvino" => (
                "OpenVINO-CPU",
                OpenVINOExecutionProvider::default()
                    .with_device_type("CPU")
                    .build(),
            ),

            "cpu" => ("CPU", CPUExecutionProvider::default().build()),

            _ => {
                warn!(
                    "Unknown backend '{}', falling back to auto-detection for {}",
                    backend, model_name
                );
                return build_session_with_acceleration(
                    model_bytes,
                    model_name,
                    model_size_mb,
                    threads,
                    None,
                );
            }
        };

    let session = commit_with(provider, model_bytes, threads)
        .with_context(|| format!("Failed to load {} with {}", model_name, label))?;
    info!("✓ Forced {} backend for {}", label, model_name);
    Ok((label.to_string(), session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_pool_refuses_acquire() {
        let pool = OnnxSessionPool::new(Vec::new());
        assert_eq!(pool.size(), 0);
        assert!(pool.acquire().is_err());
    }

    #[test]
    fn test_missing_model_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.onnx");
        let err = build_session_pool(&missing, "detector", 1, Some("cpu"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("absent.onnx"));
    }

    #[test]
    fn test_garbage_model_bytes_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.onnx");
        std::fs::write(&path, b"definitely not a protobuf").unwrap();
        assert!(build_session_pool(&path, "detector", 1, Some("cpu")).is_err());
    }

    #[test]
    fn test_threads_never_zero() {
        assert!(optimal_intra_op_threads(1024) >= 1);
    }
}
