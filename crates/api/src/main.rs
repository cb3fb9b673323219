use std::sync::Arc;

use anyhow::Context;

use eventide_api::app::services::SharedBus;
use eventide_api::app::{build_app, build_services};
use eventide_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    eventide_observability::init(config.log_format);

    let services = Arc::new(
        build_services(&config)
            .await
            .context("failed to start runtime services")?,
    );
    let app = build_app(Arc::clone(&services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&services.bus)))
        .await
        .context("server error")?;

    match Arc::try_unwrap(services) {
        Ok(services) => services.shutdown().await,
        Err(_) => tracing::warn!("services still referenced at shutdown; workers stop on drop"),
    }
    tracing::info!("stopped");
    Ok(())
}

/// Resolves on Ctrl-C. Closing the bus ends open event streams so the
/// graceful shutdown can complete.
async fn shutdown_signal(bus: SharedBus) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
    bus.close();
}
