use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
mod service;
mod store;
#[cfg(test)]
mod testutil;

use config::Config;
use engine::WorkerModels;
use service::{FaceService, ServiceOptions};
use store::PersonStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("faceregd=info,tower_http=info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "faceregd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        bind = %config.bind_addr,
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        metric = %config.match_metric,
        threshold = config.match_threshold,
        workers = config.workers,
        "configuration loaded"
    );

    let store = PersonStore::open(&config.db_path, config.duplicate_names)
        .await
        .with_context(|| format!("failed to open person store at {}", config.db_path.display()))?;

    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();
    let engine = engine::spawn_engine(config.workers, config.max_faces, |_| {
        Ok(WorkerModels {
            detector: Box::new(facereg_core::FaceDetector::load(&scrfd_path)?),
            embedder: Box::new(facereg_core::FaceRecognizer::load(&arcface_path)?),
        })
    })
    .context("failed to start engine")?;

    let service = Arc::new(FaceService::new(
        engine,
        Arc::new(store),
        ServiceOptions {
            metric: config.match_metric,
            threshold: config.match_threshold,
            limits: config.ingest_limits(),
            decode_timeout: config.decode_timeout,
            detect_timeout: config.detect_timeout,
        },
    ));
    let app = http::router(service, config.max_body_bytes());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "faceregd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("faceregd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
