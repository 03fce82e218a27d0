//! Integration tests for the service API endpoints and wiring

use allocator_lib::{
    config::RetryConfig,
    error::ProvisionError,
    executor::CloudControlPlane,
    health::components,
    models::{AllocationPayload, Outcome, Placement},
    telemetry::JsonLinesTelemetrySource,
    AllocationEngine, EngineConfig, EngineMetrics, MonitoringLoop,
};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use eco_allocator::{
    api::{create_router, AppState},
    backends::DryRunControlPlane,
    forecast_client::HttpForecastProvider,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tower::ServiceExt;
use uuid::Uuid;

/// Control plane that creates instances it can neither verify nor remove
struct StuckControlPlane;

#[async_trait]
impl CloudControlPlane for StuckControlPlane {
    async fn provision(&self, request_id: Uuid, placement: &Placement) -> Result<String, ProvisionError> {
        Ok(format!("stuck-{}-{}", placement.region, request_id.simple()))
    }

    async fn verify(&self, _instance_id: &str) -> Result<(), ProvisionError> {
        Err(ProvisionError::permanent("health check failed"))
    }

    async fn register_monitoring(&self, _instance_id: &str) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn deprovision(&self, _instance_id: &str) -> Result<(), ProvisionError> {
        Err(ProvisionError::permanent("instance locked"))
    }
}

fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.persistence.state_dir = dir.path().join("state");
    config.retry = RetryConfig {
        max_attempts: 1,
        initial_backoff_ms: 1,
        max_backoff_ms: 1,
        jitter_ms: 0,
        call_timeout_ms: 1_000,
    };
    config.monitoring.max_recovery_attempts = 1;
    config
}

async fn build_engine(dir: &TempDir, control_plane: Arc<dyn CloudControlPlane>) -> AllocationEngine {
    AllocationEngine::builder(test_config(dir))
        .engine_id("api-test")
        // never reached by the health endpoints
        .forecast_provider(Arc::new(
            HttpForecastProvider::new("http://127.0.0.1:9", Duration::from_millis(100)).unwrap(),
        ))
        .control_plane(control_plane)
        .telemetry_source(Arc::new(JsonLinesTelemetrySource::new(dir.path().join("energy.jsonl"))))
        .build()
        .await
        .unwrap()
}

async fn setup_test_app() -> (Router, Arc<AppState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let engine = build_engine(&dir, Arc::new(DryRunControlPlane::new())).await;
    let state = Arc::new(AppState::new(engine));
    let router = create_router(state.clone());

    (router, state, dir)
}

fn payload(priority: &str) -> AllocationPayload {
    AllocationPayload {
        cpu_request: 2.0,
        memory_request: "4Gi".into(),
        priority: priority.into(),
        max_energy_consumption: 100.0,
    }
}

async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state, _dir) = setup_test_app().await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    for name in components::ALL {
        assert!(health["components"][name].is_object(), "missing {}", name);
    }
    assert_eq!(health["allocations"]["system_state"], "idle");
    assert_eq!(health["allocations"]["halted"], 0);
}

#[tokio::test]
async fn test_degraded_forecast_keeps_healthz_ok() {
    let (app, state, _dir) = setup_test_app().await;
    state
        .engine
        .health()
        .set_degraded(components::FORECAST, "m5.large@eu-west-1: timed out")
        .await;

    let (status, health) = get(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_unhealthy_component_makes_healthz_503() {
    let (app, state, _dir) = setup_test_app().await;
    state
        .engine
        .health()
        .set_unhealthy(components::EXECUTOR, "control plane unreachable")
        .await;

    let (status, health) = get(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_follows_workers_and_health() {
    let (app, state, _dir) = setup_test_app().await;

    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let workers = {
        let engine = state.engine.clone();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };
    let response = state.engine.allocate(payload("high")).await.unwrap();
    assert_eq!(response.outcome, Outcome::Accepted);

    let (status, readiness) = get(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["system_state"], "monitoring_phase");
    assert_eq!(readiness["halted"], 0);

    state
        .engine
        .health()
        .set_unhealthy(components::EXECUTOR, "control plane unreachable")
        .await;
    let (status, readiness) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(readiness["reason"].as_str().unwrap().contains("executor"));

    shutdown_tx.send(()).unwrap();
    workers.await.unwrap();
}

#[tokio::test]
async fn test_halted_allocation_takes_service_out_of_rotation() {
    let dir = TempDir::new().unwrap();
    let engine = build_engine(&dir, Arc::new(StuckControlPlane)).await;
    let app = create_router(Arc::new(AppState::new(engine.clone())));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let workers = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    // verification fails and the rollback cannot remove the instance
    let response = engine.allocate(payload("critical")).await.unwrap();
    assert_eq!(response.outcome, Outcome::Failed);
    let (status, health) = get(app.clone(), "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["allocations"]["system_state"], "error");

    // one failed recovery attempt is all the config allows
    let tick = MonitoringLoop::new(engine.clone()).tick().await;
    assert_eq!(tick.halted, 1);

    let (status, health) = get(app.clone(), "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["allocations"]["halted"], 1);
    assert_eq!(health["allocations"]["lifecycles"]["halted"], 1);

    let (status, readiness) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["halted"], 1);

    shutdown_tx.send(()).unwrap();
    workers.await.unwrap();
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let (app, _state, _dir) = setup_test_app().await;
    let metrics = EngineMetrics::new();
    metrics.record_decision("accepted", 0.004);
    metrics.set_gate_mode("api-test-region", true);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();
    assert!(metrics_text.contains("eco_allocator_decisions_total"));
    assert!(metrics_text.contains("eco_allocator_decision_latency_seconds_bucket"));
    assert!(metrics_text.contains("eco_allocator_gate_over_threshold{region=\"api-test-region\"} 1"));
}

#[tokio::test]
async fn test_service_wiring_allocates_and_reports_ready() {
    let dir = TempDir::new().unwrap();
    let mut forecast_server = mockito::Server::new_async().await;
    let _forecast = forecast_server
        .mock("GET", "/v1/forecast")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"predicted_demand": 2.0, "confidence": 0.9}"#)
        .create_async()
        .await;

    let energy_log = dir.path().join("energy.jsonl");
    std::fs::write(
        &energy_log,
        concat!(
            r#"{"instance_id":"i-ext","region":"us-east-1","power_draw":300.0,"carbon_intensity":390.0,"observed_at":"2024-05-01T10:00:00Z"}"#,
            "\n"
        ),
    )
    .unwrap();

    let mut config = EngineConfig::default();
    config.persistence.state_dir = dir.path().join("state");

    let engine = AllocationEngine::builder(config)
        .engine_id("service-test")
        .forecast_provider(Arc::new(
            HttpForecastProvider::new(&forecast_server.url(), Duration::from_secs(2)).unwrap(),
        ))
        .control_plane(Arc::new(DryRunControlPlane::new()))
        .telemetry_source(Arc::new(JsonLinesTelemetrySource::new(&energy_log)))
        .build()
        .await
        .unwrap();
    engine.restore().await.unwrap();

    let mut monitor = MonitoringLoop::new(engine.clone());
    let tick = monitor.tick().await;
    assert!(tick.telemetry_refreshed);
    assert_eq!(engine.energy_snapshot("i-ext").unwrap().power_draw, 300.0);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let workers = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    let response = engine
        .allocate(AllocationPayload {
            cpu_request: 2.0,
            memory_request: "4Gi".into(),
            priority: "high".into(),
            max_energy_consumption: 100.0,
        })
        .await
        .unwrap();
    assert_eq!(response.outcome, Outcome::Accepted);
    assert!(response.chosen_instance.unwrap().starts_with("dry-eu-west-1-"));

    let app = create_router(Arc::new(AppState::new(engine.clone())));
    let (status, readiness) = get(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["system_state"], "monitoring_phase");

    shutdown_tx.send(()).unwrap();
    workers.await.unwrap();
    assert!(dir.path().join("state").join("inventory.json").exists());
    assert!(dir.path().join("state").join("decisions.jsonl").exists());
}
