/// Server setup and initialization
///
/// Opens the `Cymphony` service, starts the abandonment monitor, resumes
/// background loops of runs that were in flight, and mounts the HTTP routes.

use crate::{
    api::{create_routes, AppState},
    config::Config,
    service::Cymphony,
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::str::FromStr;
use tokio::net::TcpListener;

/// Create the Axum application and the service behind it.
pub async fn create_app(config: Config) -> Result<(Router, Cymphony)> {
    tracing::info!("📁 Data directory: {}", config.data_dir().display());
    let cymphony = Cymphony::open(config.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open cymphony: {}", e))?;

    cymphony.monitor().start(config.monitor_interval()).await?;

    let resumed = cymphony
        .controller()
        .resume()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resume runs: {}", e))?;
    tracing::debug!("Resumed {} runs", resumed);

    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_routes().with_state(AppState {
            cymphony: cymphony.clone(),
        }));

    tracing::info!("✅ Application initialized successfully");
    Ok((app, cymphony))
}

/// Initialize logging, create the application and serve it.
pub async fn start_server(config: Config) -> Result<()> {
    let level = tracing::Level::from_str(&config.log_level).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_max_level(level)
        .init();

    tracing::info!("Starting Cymphony server...");
    let (app, cymphony) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;
    cymphony.monitor().stop().await?;
    Ok(())
}

async fn health_check() -> &'static str {
    "ok"
}
