/// Cymphony server entry point
///
/// Serves:
/// - Workflow and run management at /api/workflows/* and /api/runs/*
/// - Worker task flow at /api/jobs/*
/// - Health check at /healthz
use cymphony::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Configuration comes from CYMPHONY_* environment variables
    let config = Config::default();
    start_server(config).await
}
