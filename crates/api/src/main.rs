//! Alert Manager - Main Entry Point

use anyhow::Context;
use api::{init_logging, install_metrics, Runtime, Settings};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = Settings::path();
    let settings = Settings::load_from(&config_path)
        .with_context(|| format!("failed to load settings from {}", config_path))?;
    init_logging(&settings)?;
    let metrics = install_metrics()?;

    info!("=== Alert Manager v{} ===", env!("CARGO_PKG_VERSION"));
    info!("Settings loaded from {}", config_path);

    let addr = settings.listen_addr.clone();
    let runtime = Runtime::start(settings, config_path, Some(metrics))?;

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Starting API server on {}", addr);

    axum::serve(listener, runtime.router())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await
        .context("API server failed")?;

    runtime.stop().await;
    Ok(())
}
