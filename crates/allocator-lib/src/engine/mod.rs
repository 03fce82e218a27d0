//! Allocation engine
//!
//! Owns every component and drives each request through the pipeline:
//! forecast and a preliminary gate pass run concurrently, the optimizer
//! selects, then the chosen region's lock is held across the authoritative
//! gate re-check and provisioning. Every decision is logged; terminal ones are
//! delivered, deferred ones go back on the queue.

mod restore;

pub use restore::RestoreReport;

use crate::catalog::{PlacementCatalog, StaticCatalog};
use crate::config::EngineConfig;
use crate::decision_log::DecisionLog;
use crate::error::{ConfigError, EngineError, ExecutorError, IntakeError, PersistenceError};
use crate::executor::{CloudControlPlane, ProvisioningExecutor, RetryPolicy};
use crate::forecast::{ForecastAdapter, ForecastProvider};
use crate::gate::{EnergyGate, GateEvaluation};
use crate::health::{components, HealthRegistry};
use crate::intake::{Intake, QueuedRequest, Ticket};
use crate::inventory::Inventory;
use crate::models::{
    AllocationDecision, AllocationPayload, AllocationRequest, AllocationResponse, EnergySnapshot,
    ForecastKey, Instance, Outcome, PlacementCandidate, RegionSustainability,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::optimizer::{EvaluatedCandidate, Optimizer};
use crate::snapshot::{EngineSnapshot, SnapshotStore};
use crate::supervisor::{Lifecycle, Supervisor, SystemState};
use crate::telemetry::{EnergyStore, TelemetryGateway, TelemetrySource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Assembles an engine from configuration and collaborators
pub struct EngineBuilder {
    config: EngineConfig,
    engine_id: String,
    forecast_provider: Option<Arc<dyn ForecastProvider>>,
    control_plane: Option<Arc<dyn CloudControlPlane>>,
    telemetry_source: Option<Arc<dyn TelemetrySource>>,
    catalog: Option<Arc<dyn PlacementCatalog>>,
    health: Option<HealthRegistry>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            engine_id: Uuid::new_v4().to_string(),
            forecast_provider: None,
            control_plane: None,
            telemetry_source: None,
            catalog: None,
            health: None,
        }
    }

    pub fn engine_id(mut self, engine_id: impl Into<String>) -> Self {
        self.engine_id = engine_id.into();
        self
    }

    pub fn forecast_provider(mut self, provider: Arc<dyn ForecastProvider>) -> Self {
        self.forecast_provider = Some(provider);
        self
    }

    pub fn control_plane(mut self, control_plane: Arc<dyn CloudControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    pub fn telemetry_source(mut self, source: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry_source = Some(source);
        self
    }

    /// Override the config-driven catalog
    pub fn catalog(mut self, catalog: Arc<dyn PlacementCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Share a health registry with the HTTP surface
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Validate configuration, open persisted state and wire components
    pub async fn build(self) -> Result<AllocationEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let forecast_provider = self
            .forecast_provider
            .ok_or_else(|| ConfigError::new("forecast_provider", "no prediction collaborator configured"))?;
        let control_plane = self
            .control_plane
            .ok_or_else(|| ConfigError::new("control_plane", "no cloud control plane configured"))?;
        let telemetry_source = self
            .telemetry_source
            .ok_or_else(|| ConfigError::new("telemetry_source", "no telemetry collaborator configured"))?;
        let catalog: Arc<dyn PlacementCatalog> = match self.catalog {
            Some(catalog) => catalog,
            None => Arc::new(StaticCatalog::from_config(&config)?),
        };

        let metrics = EngineMetrics::new();
        let logger = StructuredLogger::new(self.engine_id);
        let health = self.health.unwrap_or_default();
        health.register_all().await;

        let (intake, receiver) = Intake::channel(config.queue_capacity, metrics.clone());
        let inventory = Arc::new(Inventory::new());
        let energy = Arc::new(EnergyStore::new(config.monitoring.trend_window));
        let telemetry = TelemetryGateway::new(
            telemetry_source,
            energy.clone(),
            config.monitoring.telemetry_timeout(),
            config.telemetry_stale_after(),
            metrics.clone(),
        );
        let forecast = ForecastAdapter::new(
            forecast_provider,
            config.forecast.clone(),
            metrics.clone(),
            health.clone(),
        );
        let gate = EnergyGate::new(&config, metrics.clone(), logger.clone());
        let optimizer = Optimizer::new(config.optimizer.clone());
        let executor = ProvisioningExecutor::new(
            control_plane,
            catalog.clone(),
            inventory.clone(),
            RetryPolicy::from(&config.retry),
            metrics.clone(),
            logger.clone(),
        );
        let supervisor = Supervisor::new(
            config.monitoring.max_recovery_attempts,
            logger.clone(),
            metrics.clone(),
        );
        let decisions = DecisionLog::open(config.persistence.decision_log_path())?;
        let snapshots = SnapshotStore::new(config.persistence.snapshot_path());
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight));

        Ok(AllocationEngine {
            inner: Arc::new(EngineInner {
                config,
                catalog,
                intake,
                receiver: Mutex::new(Some(receiver)),
                forecast,
                gate,
                optimizer,
                executor,
                supervisor,
                inventory,
                energy,
                telemetry,
                decisions,
                snapshots,
                in_flight,
                persistence_fault: RwLock::new(None),
                metrics,
                logger,
                health,
            }),
        })
    }
}

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) catalog: Arc<dyn PlacementCatalog>,
    pub(crate) intake: Intake,
    receiver: Mutex<Option<mpsc::Receiver<QueuedRequest>>>,
    pub(crate) forecast: ForecastAdapter,
    pub(crate) gate: EnergyGate,
    pub(crate) optimizer: Optimizer,
    pub(crate) executor: ProvisioningExecutor,
    pub(crate) supervisor: Supervisor,
    pub(crate) inventory: Arc<Inventory>,
    pub(crate) energy: Arc<EnergyStore>,
    pub(crate) telemetry: TelemetryGateway,
    pub(crate) decisions: DecisionLog,
    pub(crate) snapshots: SnapshotStore,
    in_flight: Arc<Semaphore>,
    /// Last decision log or snapshot write failure, cleared on success
    persistence_fault: RwLock<Option<String>>,
    pub(crate) metrics: EngineMetrics,
    pub(crate) logger: StructuredLogger,
    pub(crate) health: HealthRegistry,
}

/// Cheap handle to the engine; clones share all state
#[derive(Clone)]
pub struct AllocationEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl std::fmt::Debug for AllocationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationEngine")
            .field("engine_id", &self.inner.logger.engine_id())
            .field("system_state", &self.inner.supervisor.system_state())
            .finish()
    }
}

impl AllocationEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.inner.logger
    }

    /// Validate and enqueue a request; the ticket resolves to its terminal decision
    pub fn submit(&self, payload: AllocationPayload) -> Result<Ticket, IntakeError> {
        self.inner.intake.submit(payload)
    }

    /// Submit and wait for the terminal outcome
    pub async fn allocate(&self, payload: AllocationPayload) -> Result<AllocationResponse, EngineError> {
        let ticket = self.submit(payload)?;
        ticket
            .response()
            .await
            .ok_or(EngineError::Intake(IntakeError::Closed))
    }

    /// Latest reading for an instance
    pub fn energy_snapshot(&self, instance_id: &str) -> Option<EnergySnapshot> {
        self.inner.energy.latest(instance_id)
    }

    /// Aggregated carbon intensity and recent energy trend of a region
    pub fn sustainability(&self, region: &str) -> RegionSustainability {
        let profile = self.inner.config.region_profile(region);
        self.inner
            .energy
            .sustainability(region, profile.carbon_intensity, profile.renewable_percentage)
    }

    pub fn system_state(&self) -> SystemState {
        self.inner.supervisor.system_state()
    }

    pub fn lifecycles(&self) -> Vec<Lifecycle> {
        self.inner.supervisor.lifecycles()
    }

    /// Tracked lifecycles per supervisor state
    pub fn lifecycle_counts(&self) -> HashMap<SystemState, usize> {
        self.inner.supervisor.counts()
    }

    pub fn inventory(&self) -> Vec<Instance> {
        self.inner.inventory.list()
    }

    /// Decision log in append order, optionally filtered by outcome
    pub async fn decisions(&self, outcome: Option<Outcome>) -> Vec<AllocationDecision> {
        self.inner.decisions.decisions(outcome).await
    }

    /// Latest decision recorded for a request
    pub async fn decision(&self, request_id: &Uuid) -> Option<AllocationDecision> {
        self.inner.decisions.latest(request_id).await
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::new(self.inner.inventory.list(), self.inner.supervisor.lifecycles())
    }

    /// Persist inventory and lifecycles for restart recovery
    pub async fn persist_snapshot(&self) -> Result<(), PersistenceError> {
        let result = self.inner.snapshots.save(&self.snapshot());
        self.note_persistence(result.as_ref().err().map(|e| format!("snapshot write failed: {}", e)))
            .await;
        result
    }

    /// Consume the processing queue until shutdown, then drain in-flight
    /// decisions and persist a final snapshot.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut receiver = match self.inner.receiver.lock().await.take() {
            Some(receiver) => receiver,
            None => {
                warn!("Allocation workers already running");
                return;
            }
        };

        info!(
            max_in_flight = self.inner.config.max_in_flight,
            queue_capacity = self.inner.config.queue_capacity,
            "Starting allocation workers"
        );
        self.inner.health.set_ready(true).await;

        loop {
            tokio::select! {
                received = receiver.recv() => {
                    let queued = match received {
                        Some(queued) => queued,
                        None => break,
                    };
                    self.inner.metrics.dec_queue_depth();
                    let permit = match self.inner.in_flight.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    self.publish_in_flight();

                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.process(queued).await;
                        drop(permit);
                        engine.publish_in_flight();
                    });
                }
                _ = shutdown.recv() => {
                    info!("Shutting down allocation workers");
                    break;
                }
            }
        }

        // in-flight decisions run to a terminal state; partial provisioning is never abandoned
        let permits = self.inner.config.max_in_flight as u32;
        if self.inner.in_flight.acquire_many(permits).await.is_err() {
            warn!("In-flight semaphore closed before drain");
        }
        self.inner.health.set_ready(false).await;
        if let Err(e) = self.persist_snapshot().await {
            error!(error = %e, "Failed to persist final snapshot");
        }
        self.inner.logger.log_shutdown("allocation workers stopped");
    }

    fn publish_in_flight(&self) {
        let busy = self.inner.config.max_in_flight - self.inner.in_flight.available_permits();
        self.inner.metrics.set_in_flight(busy as i64);
    }

    async fn process(&self, mut queued: QueuedRequest) {
        let started = Instant::now();
        let request_id = queued.request.id;
        let priority = queued.request.priority;

        let decision = match self
            .inner
            .supervisor
            .transition(request_id, SystemState::Processing)
        {
            Ok(_) => self.decide(&queued).await,
            Err(conflict) => {
                let mut decision =
                    AllocationDecision::unplaced(request_id, Outcome::Failed, conflict.to_string());
                decision.attempt = queued.attempt;
                decision
            }
        };

        let latency = started.elapsed().as_secs_f64();
        self.record(&decision).await;
        self.inner
            .metrics
            .record_decision(decision.outcome.as_str(), latency);
        self.inner.logger.log_decision(&decision, priority, latency);

        if decision.outcome == Outcome::Deferred {
            let delay = self.inner.gate.defer_delay(queued.attempt);
            debug!(
                request_id = %request_id,
                attempt = queued.attempt,
                delay_ms = delay.as_millis() as u64,
                "Request deferred, re-enqueueing"
            );
            self.inner.intake.requeue_after(queued, delay);
        } else {
            queued.deliver(&decision);
        }
        self.sync_health().await;
    }

    async fn decide(&self, queued: &QueuedRequest) -> AllocationDecision {
        let inner = &self.inner;
        let request = &queued.request;
        let attempt = queued.attempt;

        let eligible = inner.optimizer.eligible(request, &self.live_candidates());
        let first = match eligible.first() {
            Some(first) => first,
            None => {
                self.settle_unplaced(request.id);
                let mut decision = AllocationDecision::unplaced(
                    request.id,
                    Outcome::Rejected,
                    "no candidate placement satisfies the cpu and memory request",
                );
                decision.attempt = attempt;
                return decision;
            }
        };

        let key = ForecastKey::new(&first.instance_type, &first.region);
        let window = Duration::from_secs(inner.config.forecast.horizon_secs);
        let (forecast, mut evaluated) = tokio::join!(
            inner.forecast.forecast(&key, window, request.cpu_request),
            self.preliminary_gate(request, &eligible, attempt),
        );

        loop {
            let selection = inner.optimizer.select(
                request,
                &forecast,
                &evaluated,
                attempt,
                inner.gate.max_deferrals(),
            );
            let mut decision = selection.decision;
            let chosen = match selection.chosen {
                Some(chosen) if decision.outcome == Outcome::Accepted => chosen,
                _ => {
                    self.settle_unplaced(request.id);
                    return decision;
                }
            };

            let region = chosen.candidate.region.clone();
            let _region_guard = inner.inventory.lock_region(&region).await;
            let recheck = inner.gate.evaluate(
                request,
                &inner.gate.current_snapshot(&region),
                chosen.candidate.estimated_power_draw,
                attempt,
            );

            if !recheck.is_accepted() {
                debug!(
                    request_id = %request.id,
                    placement = %chosen.candidate.placement(),
                    projected = recheck.projected,
                    "Gate re-check refused the selected placement, reselecting"
                );
                let order = chosen.candidate.discovery_order;
                match evaluated.iter_mut().find(|c| c.candidate.discovery_order == order) {
                    Some(slot) => slot.evaluation = recheck,
                    None => {
                        self.settle_unplaced(request.id);
                        decision.outcome = Outcome::Rejected;
                        decision.placement = None;
                        decision.reason = recheck.reason();
                        return decision;
                    }
                }
                continue;
            }

            decision.projected_energy_cost = Some(recheck.projected);
            decision.critical_override = recheck.critical_override;
            return self
                .provision(request, decision, &chosen.candidate, &recheck)
                .await;
        }
    }

    /// Catalog candidates with live regional carbon intensity overlaid
    fn live_candidates(&self) -> Vec<PlacementCandidate> {
        let mut live_intensity: HashMap<String, Option<f64>> = HashMap::new();
        let mut candidates = self.inner.catalog.candidates();
        for candidate in &mut candidates {
            let intensity = live_intensity
                .entry(candidate.region.clone())
                .or_insert_with(|| {
                    self.inner
                        .energy
                        .region_rollup(&candidate.region)
                        .map(|r| r.carbon_intensity)
                });
            if let Some(intensity) = intensity {
                candidate.carbon_intensity = *intensity;
            }
        }
        candidates
    }

    /// Evaluate every eligible candidate, taking each region's lock once
    async fn preliminary_gate(
        &self,
        request: &AllocationRequest,
        eligible: &[PlacementCandidate],
        attempt: u32,
    ) -> Vec<EvaluatedCandidate> {
        let mut regions: Vec<&str> = Vec::new();
        for candidate in eligible {
            if !regions.contains(&candidate.region.as_str()) {
                regions.push(candidate.region.as_str());
            }
        }

        let mut evaluations: Vec<Option<GateEvaluation>> = vec![None; eligible.len()];
        for region in regions {
            let _region_guard = self.inner.inventory.lock_region(region).await;
            let snapshot = self.inner.gate.current_snapshot(region);
            for (index, candidate) in eligible.iter().enumerate() {
                if candidate.region == region {
                    evaluations[index] = Some(self.inner.gate.evaluate(
                        request,
                        &snapshot,
                        candidate.estimated_power_draw,
                        attempt,
                    ));
                }
            }
        }

        eligible
            .iter()
            .zip(evaluations)
            .filter_map(|(candidate, evaluation)| {
                evaluation.map(|evaluation| EvaluatedCandidate {
                    candidate: candidate.clone(),
                    evaluation,
                })
            })
            .collect()
    }

    /// Apply an accepted decision. Runs with the region lock held.
    async fn provision(
        &self,
        request: &AllocationRequest,
        mut decision: AllocationDecision,
        candidate: &PlacementCandidate,
        evaluation: &GateEvaluation,
    ) -> AllocationDecision {
        let inner = &self.inner;
        let request_id = request.id;

        if let Some(prior) = inner.decisions.terminal(&request_id).await {
            debug!(request_id = %request_id, outcome = %prior.outcome, "Request already decided, returning logged decision");
            return prior;
        }

        if let Err(conflict) = inner
            .supervisor
            .transition(request_id, SystemState::ResourceAllocation)
        {
            decision.outcome = Outcome::Failed;
            decision.reason = Some(conflict.to_string());
            return decision;
        }

        match inner.executor.apply(&decision).await {
            Ok(applied) if applied.outcome == Outcome::Accepted => {
                inner
                    .gate
                    .commit(&candidate.region, candidate.estimated_power_draw);
                if let Some(instance_id) = &applied.instance_id {
                    inner.supervisor.bind_instance(request_id, instance_id.clone());
                }
                decision.instance_id = applied.instance_id;
                // conflicts are logged and routed to Error by the supervisor
                if let Err(conflict) = inner
                    .supervisor
                    .transition(request_id, SystemState::MonitoringPhase)
                {
                    debug!(request_id = %request_id, error = %conflict, "Allocation not handed to monitoring");
                }

                if decision.critical_override {
                    inner.metrics.inc_critical_overrides();
                    inner.logger.log_critical_override(
                        request_id,
                        &candidate.region,
                        evaluation.projected,
                        evaluation.ceiling,
                        evaluation.over_threshold,
                    );
                }
                decision
            }
            Ok(applied) => {
                // nothing left behind: either never created or compensated
                let reason = applied
                    .reason
                    .unwrap_or_else(|| "provisioning failed".to_string());
                inner.supervisor.escalate(request_id, reason.clone());
                if let Err(conflict) = inner.supervisor.recover(request_id, true) {
                    debug!(request_id = %request_id, error = %conflict, "Failed allocation not returned to idle");
                }

                decision.outcome = Outcome::Failed;
                decision.reason = Some(reason);
                decision.instance_id = None;
                decision
            }
            Err(e) => {
                error!(
                    request_id = %request_id,
                    placement = %candidate.placement(),
                    error = %e,
                    "Provisioning left inconsistent state, escalating"
                );
                if let ExecutorError::CompensationFailed { instance_id, .. } = &e {
                    inner.supervisor.bind_instance(request_id, instance_id.clone());
                }
                inner.supervisor.escalate(request_id, e.to_string());
                inner
                    .health
                    .set_degraded(components::EXECUTOR, e.to_string())
                    .await;

                decision.outcome = Outcome::Failed;
                decision.reason = Some(e.to_string());
                decision.instance_id = None;
                decision
            }
        }
    }

    /// Processing -> Idle for requests that touched no resources
    fn settle_unplaced(&self, request_id: Uuid) {
        if let Err(conflict) = self
            .inner
            .supervisor
            .transition(request_id, SystemState::Idle)
        {
            debug!(request_id = %request_id, error = %conflict, "Unplaced request not settled");
        }
    }

    /// Append to the decision log. A durable terminal decision releases
    /// the request's execution.
    pub(crate) async fn record(&self, decision: &AllocationDecision) {
        match self.inner.decisions.append(decision).await {
            Ok(_) => {
                if decision.is_terminal() {
                    self.inner.executor.release(&decision.request_id);
                }
                self.note_persistence(None).await;
            }
            Err(PersistenceError::DuplicateTerminal(request_id)) => {
                self.inner.executor.release(&request_id);
                warn!(request_id = %request_id, outcome = %decision.outcome, "Terminal decision already recorded");
            }
            Err(e) => {
                error!(request_id = %decision.request_id, error = %e, "Failed to record decision");
                self.note_persistence(Some(format!("decision log write failed: {}", e)))
                    .await;
            }
        }
    }

    async fn note_persistence(&self, fault: Option<String>) {
        *self.inner.persistence_fault.write().await = fault;
    }

    /// Reflect lifecycle errors and persistence faults in the supervisor component
    pub(crate) async fn sync_health(&self) {
        let counts = self.inner.supervisor.counts();
        let halted = counts.get(&SystemState::Halted).copied().unwrap_or(0);
        let errored = counts.get(&SystemState::Error).copied().unwrap_or(0);
        let fault = self.inner.persistence_fault.read().await.clone();
        let health = &self.inner.health;

        if halted > 0 {
            health
                .set_unhealthy(
                    components::SUPERVISOR,
                    format!("{} allocation(s) halted, manual intervention required", halted),
                )
                .await;
        } else if errored > 0 {
            health
                .set_degraded(
                    components::SUPERVISOR,
                    format!("{} allocation(s) awaiting recovery", errored),
                )
                .await;
        } else if let Some(fault) = fault {
            health.set_degraded(components::SUPERVISOR, fault).await;
        } else {
            health.set_healthy(components::SUPERVISOR).await;
        }
    }
}

#[cfg(test)]
mod tests;
