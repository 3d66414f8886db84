// Main entry point for the bookshelf scanner service

use bookshelf_scanner::{
    core::Config,
    orchestration::SpinePipeline,
    server::{router, AppState},
    utils::Metrics,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    // Initialize logging
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(format!(
        "bookshelf_scanner={},tower_http=info,ort=off",
        match config.log_level() {
            tracing::Level::TRACE => "trace",
            tracing::Level::DEBUG => "debug",
            tracing::Level::INFO => "info",
            tracing::Level::WARN => "warn",
            tracing::Level::ERROR => "error",
        }
    ));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== BOOKSHELF SCANNER ===");
    info!(
        "Config: target={} conf={:.2} iou={:.2} pool={} resolver={:?} keys={}",
        config.target_size(),
        config.confidence_threshold(),
        config.iou_threshold(),
        config.onnx_pool_size(),
        config.resolver.provider,
        config.api_keys().len()
    );

    // Initialize metrics
    let metrics = Metrics::new();

    // Initialize pipeline and load models ahead of traffic
    info!("Initializing spine pipeline...");
    let pipeline = Arc::new(SpinePipeline::from_config(&config, metrics.clone())?);
    pipeline.warm_up().await;

    let state = AppState {
        config: config.clone(),
        pipeline,
        metrics,
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /                - Root endpoint");
    info!("  GET  /health          - Health check");
    info!("  GET  /metrics         - Prometheus metrics");
    info!("  GET  /stats           - Detailed statistics");
    info!("  POST /books/identify  - Identify books (multipart field 'image')");
    info!("{}", "=".repeat(70));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
