//! Operational HTTP endpoints: liveness, readiness and Prometheus metrics
//!
//! Health and readiness combine the component registry with the
//! supervisor's view of allocations. A halted allocation needs an operator,
//! so it takes the service out of rotation even before the next monitoring
//! tick marks the supervisor component unhealthy.

use allocator_lib::{
    health::{ComponentStatus, HealthResponse, ReadinessResponse},
    AllocationEngine, SystemState,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: AllocationEngine,
}

impl AppState {
    pub fn new(engine: AllocationEngine) -> Self {
        Self { engine }
    }
}

/// Supervisor view reported next to component health
#[derive(Debug, Serialize)]
struct AllocationStatus {
    system_state: SystemState,
    lifecycles: BTreeMap<&'static str, usize>,
    halted: usize,
}

impl AllocationStatus {
    fn of(engine: &AllocationEngine) -> Self {
        let counts = engine.lifecycle_counts();
        let lifecycles = counts
            .iter()
            .map(|(state, count)| (state.as_str(), *count))
            .collect();
        Self {
            system_state: engine.system_state(),
            lifecycles,
            halted: counts.get(&SystemState::Halted).copied().unwrap_or(0),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    #[serde(flatten)]
    health: HealthResponse,
    allocations: AllocationStatus,
}

#[derive(Debug, Serialize)]
struct ReadinessBody {
    #[serde(flatten)]
    readiness: ReadinessResponse,
    system_state: SystemState,
    halted: usize,
}

/// 200 while healthy or degraded; 503 when a component is unhealthy or an
/// allocation is halted
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.engine.health().health().await;
    let allocations = AllocationStatus::of(&state.engine);

    let status_code = match health.status {
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ if allocations.halted > 0 => StatusCode::SERVICE_UNAVAILABLE,
        // forecast fallback or errored lifecycles still serve
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
    };

    (status_code, Json(HealthBody { health, allocations }))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut readiness = state.engine.health().readiness().await;
    let allocations = AllocationStatus::of(&state.engine);

    if readiness.ready && allocations.halted > 0 {
        readiness.ready = false;
        readiness.reason = Some(format!(
            "{} allocation(s) halted, manual intervention required",
            allocations.halted
        ));
    }

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessBody {
            readiness,
            system_state: allocations.system_state,
            halted: allocations.halted,
        }),
    )
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serve until shutdown is signalled
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, engine = %state.engine.logger().engine_id(), "Serving operational endpoints");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            if shutdown.recv().await.is_err() {
                info!("Shutdown channel closed, stopping API server");
            }
        })
        .await?;

    Ok(())
}
