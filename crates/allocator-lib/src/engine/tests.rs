use super::*;
use crate::decision_log::read_chain;
use crate::error::{ForecastError, ProvisionError, TelemetryError};
use crate::health::ComponentStatus;
use crate::models::{ForecastResult, InstanceStatus, Placement};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tempfile::TempDir;

struct FixedForecast {
    demand: f64,
    hang: bool,
}

#[async_trait]
impl ForecastProvider for FixedForecast {
    async fn forecast(&self, key: &ForecastKey, horizon: Duration) -> Result<ForecastResult, ForecastError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(ForecastResult {
            key: key.clone(),
            predicted_demand: self.demand,
            horizon_secs: horizon.as_secs(),
            confidence: 0.9,
            generated_at: Utc::now(),
            degraded: false,
        })
    }
}

#[derive(Default)]
struct MockControlPlane {
    verify_fails: AtomicBool,
    provision_calls: AtomicU32,
    deprovision_calls: AtomicU32,
}

#[async_trait]
impl CloudControlPlane for MockControlPlane {
    async fn provision(&self, request_id: Uuid, placement: &Placement) -> Result<String, ProvisionError> {
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("i-{}-{}", placement.region, request_id.simple()))
    }

    async fn verify(&self, _instance_id: &str) -> Result<(), ProvisionError> {
        if self.verify_fails.load(Ordering::SeqCst) {
            return Err(ProvisionError::permanent("health check failed"));
        }
        Ok(())
    }

    async fn register_monitoring(&self, _instance_id: &str) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn deprovision(&self, _instance_id: &str) -> Result<(), ProvisionError> {
        self.deprovision_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct QuietTelemetry;

#[async_trait]
impl TelemetrySource for QuietTelemetry {
    async fn fetch_snapshots(&self) -> Result<Vec<EnergySnapshot>, TelemetryError> {
        Ok(Vec::new())
    }
}

fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.persistence.state_dir = dir.path().to_path_buf();
    config.gate.base_defer_delay_ms = 1;
    config.gate.max_defer_delay_ms = 10;
    config.forecast.timeout_ms = 50;
    config
}

async fn build(config: EngineConfig, forecast: FixedForecast, control_plane: Arc<MockControlPlane>) -> AllocationEngine {
    AllocationEngine::builder(config)
        .engine_id("engine-test")
        .forecast_provider(Arc::new(forecast))
        .control_plane(control_plane)
        .telemetry_source(Arc::new(QuietTelemetry))
        .build()
        .await
        .unwrap()
}

fn steady() -> FixedForecast {
    FixedForecast {
        demand: 2.0,
        hang: false,
    }
}

fn payload(priority: &str, max_energy: f64) -> AllocationPayload {
    AllocationPayload {
        cpu_request: 2.0,
        memory_request: "4Gi".into(),
        priority: priority.into(),
        max_energy_consumption: max_energy,
    }
}

fn observe_everywhere(engine: &AllocationEngine, power_draw: f64, times: usize) {
    for _ in 0..times {
        for region in ["us-east-1", "eu-west-1", "ap-southeast-1"] {
            engine.inner.gate.observe(&EnergySnapshot {
                instance_id: format!("region/{}", region),
                region: region.to_string(),
                power_draw,
                carbon_intensity: 300.0,
                observed_at: Utc::now(),
            });
        }
    }
}

/// Spawn the worker loop; the returned sender stops it
fn start(engine: &AllocationEngine) -> (broadcast::Sender<()>, tokio::task::JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let runner = engine.clone();
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });
    (shutdown_tx, handle)
}

async fn stop(shutdown: broadcast::Sender<()>, handle: tokio::task::JoinHandle<()>) {
    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_accepts_lowest_carbon_fitting_placement() {
    let dir = TempDir::new().unwrap();
    let control_plane = Arc::new(MockControlPlane::default());
    let engine = build(test_config(&dir), steady(), control_plane.clone()).await;
    observe_everywhere(&engine, 600.0, 1);
    let (shutdown, handle) = start(&engine);

    let response = engine.allocate(payload("high", 100.0)).await.unwrap();

    assert_eq!(response.outcome, Outcome::Accepted);
    assert_eq!(response.projected_energy_cost, Some(645.0));
    let instance_id = response.chosen_instance.clone().unwrap();
    assert!(instance_id.starts_with("i-eu-west-1-"));

    let decision = engine.decision(&response.request_id).await.unwrap();
    assert_eq!(
        decision.placement,
        Some(Placement {
            instance_type: "m5.large".into(),
            region: "eu-west-1".into(),
        })
    );
    assert!(!decision.critical_override);

    let instance = engine.inner.inventory.get(&instance_id).unwrap();
    assert_eq!(instance.status, InstanceStatus::Active);
    assert_eq!(instance.request_id, Some(response.request_id));
    assert_eq!(engine.system_state(), SystemState::MonitoringPhase);
    assert_eq!(engine.lifecycles()[0].instance_id.as_deref(), Some(instance_id.as_str()));

    stop(shutdown, handle).await;
    assert!(engine.inner.snapshots.load().unwrap().is_some());
}

#[tokio::test]
async fn test_over_threshold_defers_then_rejects() {
    let dir = TempDir::new().unwrap();
    let control_plane = Arc::new(MockControlPlane::default());
    let engine = build(test_config(&dir), steady(), control_plane.clone()).await;
    observe_everywhere(&engine, 1100.0, 3);
    let (shutdown, handle) = start(&engine);

    let response = engine.allocate(payload("normal", 100.0)).await.unwrap();

    assert_eq!(response.outcome, Outcome::Rejected);
    assert!(response.chosen_instance.is_none());
    let decision = engine.decision(&response.request_id).await.unwrap();
    assert_eq!(decision.attempt, 3);
    assert!(decision.placement.is_none());

    let deferred = engine.decisions(Some(Outcome::Deferred)).await;
    let attempts: Vec<u32> = deferred
        .iter()
        .filter(|d| d.request_id == response.request_id)
        .map(|d| d.attempt)
        .collect();
    assert_eq!(attempts, vec![0, 1, 2]);
    assert_eq!(control_plane.provision_calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.system_state(), SystemState::Idle);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_critical_request_overrides_gate() {
    let dir = TempDir::new().unwrap();
    let control_plane = Arc::new(MockControlPlane::default());
    let engine = build(test_config(&dir), steady(), control_plane.clone()).await;
    observe_everywhere(&engine, 1100.0, 3);
    let (shutdown, handle) = start(&engine);

    let response = engine.allocate(payload("critical", 100.0)).await.unwrap();

    assert_eq!(response.outcome, Outcome::Accepted);
    assert_eq!(response.projected_energy_cost, Some(1145.0));
    let decision = engine.decision(&response.request_id).await.unwrap();
    assert!(decision.critical_override);
    assert_eq!(decision.attempt, 0);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_finished_executions_are_released() {
    let dir = TempDir::new().unwrap();
    let control_plane = Arc::new(MockControlPlane::default());
    let engine = build(test_config(&dir), steady(), control_plane.clone()).await;
    let (shutdown, handle) = start(&engine);

    for _ in 0..5 {
        let response = engine.allocate(payload("critical", 100.0)).await.unwrap();
        assert_eq!(response.outcome, Outcome::Accepted);
    }
    control_plane.verify_fails.store(true, Ordering::SeqCst);
    let failed = engine.allocate(payload("critical", 100.0)).await.unwrap();
    assert_eq!(failed.outcome, Outcome::Failed);

    assert_eq!(engine.inner.executor.tracked(), 0);
    assert_eq!(control_plane.provision_calls.load(Ordering::SeqCst), 6);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_forecast_outage_degrades_but_still_decides() {
    let dir = TempDir::new().unwrap();
    let control_plane = Arc::new(MockControlPlane::default());
    let hanging = FixedForecast {
        demand: 0.0,
        hang: true,
    };
    let engine = build(test_config(&dir), hanging, control_plane.clone()).await;
    let (shutdown, handle) = start(&engine);

    let response = engine.allocate(payload("normal", 100.0)).await.unwrap();

    assert_eq!(response.outcome, Outcome::Accepted);
    let forecast = engine.health().component(components::FORECAST).await.unwrap();
    assert_eq!(forecast.status, ComponentStatus::Degraded);
    let readiness = engine.health().readiness().await;
    assert!(readiness.ready);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_failed_verification_leaves_no_active_instance() {
    let dir = TempDir::new().unwrap();
    let control_plane = Arc::new(MockControlPlane::default());
    control_plane.verify_fails.store(true, Ordering::SeqCst);
    let engine = build(test_config(&dir), steady(), control_plane.clone()).await;
    let (shutdown, handle) = start(&engine);

    let response = engine.allocate(payload("normal", 100.0)).await.unwrap();

    assert_eq!(response.outcome, Outcome::Failed);
    assert!(response.chosen_instance.is_none());
    assert_eq!(control_plane.deprovision_calls.load(Ordering::SeqCst), 1);

    let inventory = engine.inventory();
    assert_eq!(inventory.len(), 1);
    assert_eq!(inventory[0].status, InstanceStatus::Terminated);
    assert_eq!(engine.system_state(), SystemState::Idle);
    assert!(engine.lifecycles().is_empty());

    let decision = engine.decision(&response.request_id).await.unwrap();
    assert!(decision.reason.unwrap().contains("health check failed"));

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_committed_draw_counts_until_next_rollup() {
    let dir = TempDir::new().unwrap();
    let control_plane = Arc::new(MockControlPlane::default());
    let engine = build(test_config(&dir), steady(), control_plane.clone()).await;
    observe_everywhere(&engine, 950.0, 1);
    let (shutdown, handle) = start(&engine);

    let mut regions = Vec::new();
    for _ in 0..3 {
        let response = engine.allocate(payload("normal", 1.0)).await.unwrap();
        assert_eq!(response.outcome, Outcome::Accepted);
        let decision = engine.decision(&response.request_id).await.unwrap();
        regions.push(decision.placement.unwrap().region);
    }
    assert_eq!(regions, vec!["eu-west-1", "us-east-1", "ap-southeast-1"]);

    // every region now sits at 995W; one more m5.large would cross 1000W
    let fourth = engine.allocate(payload("normal", 1.0)).await.unwrap();
    assert_eq!(fourth.outcome, Outcome::Rejected);
    assert_eq!(control_plane.provision_calls.load(Ordering::SeqCst), 3);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_invalid_request_is_never_queued() {
    let dir = TempDir::new().unwrap();
    let engine = build(test_config(&dir), steady(), Arc::new(MockControlPlane::default())).await;

    let err = engine
        .submit(AllocationPayload {
            cpu_request: -1.0,
            memory_request: "lots".into(),
            priority: "urgent".into(),
            max_energy_consumption: 100.0,
        })
        .unwrap_err();

    match err {
        IntakeError::Validation(e) => {
            assert!(e.has_field("cpu_request"));
            assert!(e.has_field("memory_request"));
            assert!(e.has_field("priority"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    let mut receiver = engine.inner.receiver.lock().await;
    assert!(receiver.as_mut().unwrap().try_recv().is_err());
    assert!(engine.decisions(None).await.is_empty());
}

#[tokio::test]
async fn test_dropped_ticket_still_reaches_terminal_decision() {
    let dir = TempDir::new().unwrap();
    let engine = build(test_config(&dir), steady(), Arc::new(MockControlPlane::default())).await;
    let ticket = engine.submit(payload("low", 100.0)).unwrap();
    let request_id = ticket.request_id;
    drop(ticket);
    let (shutdown, handle) = start(&engine);

    let decision = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(decision) = engine.decision(&request_id).await {
                break decision;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(decision.outcome, Outcome::Accepted);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn test_decision_log_chain_verifies() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let log_path = config.persistence.decision_log_path();
    let engine = build(config, steady(), Arc::new(MockControlPlane::default())).await;
    observe_everywhere(&engine, 1100.0, 3);
    let (shutdown, handle) = start(&engine);

    engine.allocate(payload("normal", 100.0)).await.unwrap();
    engine.allocate(payload("critical", 100.0)).await.unwrap();
    stop(shutdown, handle).await;

    let report = read_chain(&log_path).unwrap();
    // three deferrals, one rejection, one acceptance
    assert_eq!(report.records.len(), 5);
    assert_eq!(report.head_hash, engine.inner.decisions.head_hash().await);
    assert!(!report.torn_tail);
}

#[tokio::test]
async fn test_missing_collaborator_is_config_error() {
    let dir = TempDir::new().unwrap();
    let err = AllocationEngine::builder(test_config(&dir))
        .forecast_provider(Arc::new(steady()))
        .telemetry_source(Arc::new(QuietTelemetry))
        .build()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Config(_)));
}

#[tokio::test]
async fn test_restore_compensates_pending_instance() {
    let dir = TempDir::new().unwrap();
    let request_id = Uuid::new_v4();
    {
        let engine = build(test_config(&dir), steady(), Arc::new(MockControlPlane::default())).await;
        engine
            .inner
            .inventory
            .insert(Instance {
                id: "i-half-made".into(),
                instance_type: "m5.large".into(),
                region: "us-east-1".into(),
                status: InstanceStatus::Pending,
                current_utilization: 0.0,
                request_id: Some(request_id),
                reserved_draw: 45.0,
            })
            .unwrap();
        engine
            .inner
            .supervisor
            .transition(request_id, SystemState::Processing)
            .unwrap();
        engine
            .inner
            .supervisor
            .transition(request_id, SystemState::ResourceAllocation)
            .unwrap();
        engine.persist_snapshot().await.unwrap();
    }

    let control_plane = Arc::new(MockControlPlane::default());
    let engine = build(test_config(&dir), steady(), control_plane.clone()).await;
    let report = engine.restore().await.unwrap();

    assert_eq!(report.instances, 1);
    assert_eq!(report.lifecycles, 1);
    assert_eq!(report.compensated, 1);
    assert_eq!(report.interrupted, 1);
    assert_eq!(control_plane.deprovision_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        engine.inner.inventory.get("i-half-made").unwrap().status,
        InstanceStatus::Terminated
    );
    assert_eq!(engine.system_state(), SystemState::Idle);

    let decision = engine.decision(&request_id).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Failed);
}

#[tokio::test]
async fn test_restore_resumes_completed_provisioning() {
    let dir = TempDir::new().unwrap();
    let request_id = Uuid::new_v4();
    {
        let engine = build(test_config(&dir), steady(), Arc::new(MockControlPlane::default())).await;
        engine
            .inner
            .inventory
            .insert(Instance {
                id: "i-done".into(),
                instance_type: "m5.large".into(),
                region: "eu-west-1".into(),
                status: InstanceStatus::Active,
                current_utilization: 0.3,
                request_id: Some(request_id),
                reserved_draw: 45.0,
            })
            .unwrap();
        engine
            .inner
            .supervisor
            .transition(request_id, SystemState::Processing)
            .unwrap();
        engine
            .inner
            .supervisor
            .transition(request_id, SystemState::ResourceAllocation)
            .unwrap();
        engine.persist_snapshot().await.unwrap();
    }

    let control_plane = Arc::new(MockControlPlane::default());
    let engine = build(test_config(&dir), steady(), control_plane.clone()).await;
    let report = engine.restore().await.unwrap();

    assert_eq!(report.reconciled, 1);
    assert_eq!(report.interrupted, 0);
    assert_eq!(control_plane.deprovision_calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.system_state(), SystemState::MonitoringPhase);
    let decision = engine.decision(&request_id).await.unwrap();
    assert_eq!(decision.outcome, Outcome::Accepted);
    assert_eq!(decision.instance_id.as_deref(), Some("i-done"));
}
