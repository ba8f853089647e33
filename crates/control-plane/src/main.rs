// labelq control plane
// Decision: one process serves the HTTP API and runs the fleet loops (ingest, monitor, reaper)

use anyhow::{Context, Result};
use labelq_control_plane::{
    api::{self, ApiConfig},
    backend::{self, BackendConfig},
};
use labelq_fleet::telemetry::{init_telemetry, TelemetryConfig};
use labelq_fleet::{FleetConfig, FleetService};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_telemetry(
        TelemetryConfig::from_env()
            .with_service_name("labelq-control-plane")
            .with_default_filter("labelq_control_plane=debug,labelq_fleet=info,tower_http=debug"),
    );

    let config = FleetConfig::from_env().context("Invalid fleet configuration")?;
    let api_config = ApiConfig::from_env().context("Invalid HTTP configuration")?;
    let backend_config = BackendConfig::from_env().context("Invalid backend configuration")?;
    let deps = backend::connect(&backend_config, &config.channels)
        .await
        .context("Failed to connect backends")?;

    let service = FleetService::setup(deps, config)
        .await
        .context("Failed to set up channels")?;
    let report = service
        .start()
        .await
        .context("Failed to reconcile worker pool")?;
    tracing::info!(
        bound = report.bound,
        duplicates_terminated = report.duplicates_terminated,
        "worker pool reconciled"
    );

    let app = api::build_app(
        service.dispatcher(),
        service.controller(),
        api_config.max_upload_bytes,
    );

    let listener = tokio::net::TcpListener::bind(&api_config.addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("HTTP server listening on {}", api_config.addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    service.shutdown().await.context("Fleet shutdown failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
