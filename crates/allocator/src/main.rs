//! Eco Allocator - energy-aware workload allocation service
//!
//! Runs the allocation workers and the monitoring tick, restores persisted
//! state on startup and serves health, readiness and Prometheus metrics.

use allocator_lib::{telemetry::JsonLinesTelemetrySource, AllocationEngine, MonitoringLoop};
use anyhow::{Context, Result};
use eco_allocator::{
    api, backends::DryRunControlPlane, config::ServiceConfig,
    forecast_client::HttpForecastProvider,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting eco-allocator");

    let config = ServiceConfig::load()?;
    info!(
        engine_id = %config.engine_id,
        state_dir = %config.engine.persistence.state_dir.display(),
        forecast_endpoint = %config.forecast_endpoint,
        "Engine configured"
    );

    let forecast = HttpForecastProvider::new(
        &config.forecast_endpoint,
        config.engine.forecast.timeout(),
    )?;
    let mut telemetry = JsonLinesTelemetrySource::new(&config.energy_log);
    if let Some(path) = &config.inventory_file {
        telemetry = telemetry.with_inventory_file(path);
    }

    let engine = AllocationEngine::builder(config.engine.clone())
        .engine_id(config.engine_id.clone())
        .forecast_provider(Arc::new(forecast))
        .control_plane(Arc::new(DryRunControlPlane::new()))
        .telemetry_source(Arc::new(telemetry))
        .build()
        .await
        .context("Failed to build allocation engine")?;

    let restored = engine
        .restore()
        .await
        .context("Failed to restore persisted state")?;
    info!(
        instances = restored.instances,
        lifecycles = restored.lifecycles,
        interrupted = restored.interrupted,
        "Persisted state restored"
    );

    let regions: HashSet<&str> = config
        .engine
        .catalog
        .iter()
        .flat_map(|spec| spec.regions.iter().map(String::as_str))
        .collect();
    engine
        .logger()
        .log_startup(ENGINE_VERSION, regions.len(), config.engine.catalog.len());

    let (shutdown_tx, _) = broadcast::channel(1);

    let workers = {
        let engine = engine.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { engine.run(shutdown).await })
    };
    let monitor = tokio::spawn(MonitoringLoop::new(engine.clone()).run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(engine.clone()));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());

    workers.await.context("Allocation workers panicked")?;
    monitor.await.context("Monitoring loop panicked")?;
    match api_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API server panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}
