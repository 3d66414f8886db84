// HTTP surface: upload validation, status mapping and monitoring endpoints

use crate::core::{Config, IdentifyResponse, PipelineError};
use crate::orchestration::SpinePipeline;
use crate::utils::Metrics;
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const ALLOWED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "bmp", "webp"];

/// Multipart framing on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<SpinePipeline>,
    pub metrics: Metrics,
}

/// Error response: `{"error": kind, "message": text}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.kind, "message": self.message })),
        )
            .into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Decode(msg) => Self::bad_request(
                "decode_error",
                format!("Failed to read image: {}", msg),
            ),
            PipelineError::ModelUnavailable(msg) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "model_unavailable",
                message: msg,
            },
            PipelineError::Inference(msg) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "inference_error",
                message: msg,
            },
            // Details stay in the server log
            PipelineError::TaskJoinFailed(_) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                kind: "internal_error",
                message: "An unexpected error occurred while processing the image".to_string(),
            },
        }
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::bad_request("invalid_upload", rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::bad_request("file_too_large", err.body_text());
        }
        Self::bad_request("invalid_upload", format!("Malformed multipart body: {}", err.body_text()))
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.config.max_upload_bytes() + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/books/identify", post(identify_books))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn root() -> &'static str {
    "Bookshelf Scanner - spine detection, OCR and book resolution"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.metrics.record_endpoint_request("/health");
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "detector_backend": state.pipeline.detector_backend(),
        "detector_ready": state.pipeline.detector_ready(),
        "ocr_ready": state.pipeline.reader_ready(),
        "resolver": state.pipeline.resolver_name(),
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    let keys = state.pipeline.key_stats().await;

    let mut value = serde_json::to_value(snapshot).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to serialize metrics: {}", e),
        )
    })?;
    if let Some(object) = value.as_object_mut() {
        object.insert("api_keys".to_string(), json!(keys));
    }
    Ok(Json(value))
}

/// Identify books on a shelf photo
///
/// # Request Format:
/// - multipart/form-data
/// - Field "image": one image file (png, jpg, jpeg, gif, bmp, webp)
///
/// # Response:
/// - `{"detections": [...], "book_info": ..., "success": true}`
/// - `{"detections": [], "success": true}` when no spine qualifies
async fn identify_books(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<IdentifyResponse>, ApiError> {
    state.metrics.record_endpoint_request("/books/identify");
    let start_time = std::time::Instant::now();

    let upload = match multipart {
        Ok(multipart) => read_upload(multipart, state.config.max_upload_bytes()).await,
        Err(rejection) => Err(ApiError::from(rejection)),
    };
    let result = match upload {
        Ok(bytes) => state.pipeline.identify(bytes).await.map_err(ApiError::from),
        Err(e) => Err(e),
    };
    state.metrics.record_request(result.is_ok());

    match &result {
        Ok(response) => info!(
            "Request completed in {:.2}s: {} spines",
            start_time.elapsed().as_secs_f64(),
            response.detections.len()
        ),
        Err(e) if e.status.is_server_error() => error!("Request failed: {} ({})", e.kind, e.message),
        Err(e) => warn!("Rejected upload: {} ({})", e.kind, e.message),
    }

    result.map(Json)
}

/// Pull and validate the `image` field
async fn read_upload(mut multipart: Multipart, max_bytes: usize) -> Result<Vec<u8>, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("image") {
            continue;
        }

        let filename = field.file_name().unwrap_or("").to_string();
        if filename.is_empty() {
            return Err(ApiError::bad_request(
                "no_file_selected",
                "Please select a valid image file",
            ));
        }
        check_extension(&filename)?;

        let data = field.bytes().await?;
        if data.is_empty() {
            return Err(ApiError::bad_request("empty_file", "Uploaded image is empty"));
        }
        if data.len() > max_bytes {
            return Err(ApiError::bad_request(
                "file_too_large",
                format!(
                    "File size ({:.2}MB) exceeds maximum allowed size of {:.2}MB",
                    data.len() as f64 / (1024.0 * 1024.0),
                    max_bytes as f64 / (1024.0 * 1024.0)
                ),
            ));
        }
        return Ok(data.to_vec());
    }

    Err(ApiError::bad_request(
        "no_image_uploaded",
        "Please upload an image file in the 'image' field",
    ))
}

fn check_extension(filename: &str) -> Result<(), ApiError> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase());
    match extension {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        other => Err(ApiError::bad_request(
            "invalid_file_type",
            format!(
                "Allowed file types: {}. Received: {}",
                ALLOWED_EXTENSIONS.join(", "),
                other.as_deref().unwrap_or("unknown")
            ),
        )),
    }
}
