//! Monitoring tick
//!
//! Runs on a fixed interval independent of request handling. Each tick
//! refreshes telemetry, feeds regional rollups to the energy gate, evaluates
//! per-instance triggers and re-optimizes triggered allocations, closes
//! allocations whose instance is gone, retries recovery of errored ones,
//! exports per-instance energy and persists a snapshot. Region locks are
//! awaited, never skipped.

use crate::engine::AllocationEngine;
use crate::health::components;
use crate::models::InstanceStatus;
use crate::supervisor::SystemState;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why an allocation entered optimization
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Utilization under the threshold for the configured number of ticks
    Underutilized { utilization: f64, ticks: u32 },
    /// Instance power draw above the per-instance ceiling
    EnergyOverrun { power_draw: f64, ceiling: f64 },
}

impl Trigger {
    pub fn action(&self) -> &'static str {
        match self {
            Trigger::Underutilized { .. } => "drain",
            Trigger::EnergyOverrun { .. } => "scale_out",
        }
    }
}

/// What one tick observed and did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub telemetry_refreshed: bool,
    pub regions_observed: usize,
    pub triggered: Vec<(String, Trigger)>,
    pub retired: usize,
    pub scale_out_recommendations: usize,
    /// Allocations returned to Idle because their instance is gone
    pub closed: usize,
    pub recovered: usize,
    pub halted: usize,
}

pub struct MonitoringLoop {
    engine: AllocationEngine,
    interval: Duration,
    /// Consecutive underutilized ticks per instance
    underutilized: HashMap<String, u32>,
    /// Per-instance energy series currently exported: (instance_type, region)
    published: HashMap<String, (String, String)>,
}

impl MonitoringLoop {
    pub fn new(engine: AllocationEngine) -> Self {
        let interval = engine.config().monitoring_interval();
        Self {
            engine,
            interval,
            underutilized: HashMap::new(),
            published: HashMap::new(),
        }
    }

    /// Tick until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting monitoring loop"
        );

        let mut ticker = interval(self.interval);
        let mut tick_count = 0u64;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let report = self.tick().await;
                    tick_count += 1;
                    debug!(
                        tick = tick_count,
                        telemetry = report.telemetry_refreshed,
                        regions = report.regions_observed,
                        triggered = report.triggered.len(),
                        retired = report.retired,
                        closed = report.closed,
                        recovered = report.recovered,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Monitoring tick complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!("Shutting down monitoring loop");
                    break;
                }
            }
        }
    }

    /// One monitoring pass
    pub async fn tick(&mut self) -> TickReport {
        let engine = self.engine.clone();
        let inner = &engine.inner;
        let mut report = TickReport::default();

        match inner.telemetry.refresh(&inner.inventory).await {
            Ok(summary) => {
                report.telemetry_refreshed = true;
                report.regions_observed = summary.rollups.len();
                for rollup in &summary.rollups {
                    // a rollup resets the region's commitments; wait out in-flight applies
                    let _region_guard = inner.inventory.lock_region(&rollup.region).await;
                    inner.gate.observe(rollup);
                }
                inner.health.set_healthy(components::TELEMETRY).await;
            }
            Err(e) => {
                inner
                    .health
                    .set_degraded(components::TELEMETRY, e.to_string())
                    .await;
            }
        }

        for (request_id, instance_id) in self.monitored() {
            let instance = inner.inventory.get(&instance_id);
            let live = instance
                .as_ref()
                .map(|i| i.status != InstanceStatus::Terminated)
                .unwrap_or(false);
            if !live {
                self.underutilized.remove(&instance_id);
                inner.energy.forget(&instance_id);
                if inner
                    .supervisor
                    .transition(request_id, SystemState::Idle)
                    .is_ok()
                {
                    report.closed += 1;
                }
                continue;
            }
            if let Some(trigger) = self.evaluate(&instance_id) {
                report.triggered.push((instance_id.clone(), trigger.clone()));
                self.optimize(request_id, &instance_id, trigger, &mut report)
                    .await;
            }
        }

        self.recover_errored(&mut report).await;
        self.publish_instance_energy();

        engine.sync_health().await;
        if let Err(e) = engine.persist_snapshot().await {
            warn!(error = %e, "Failed to persist snapshot");
        }
        report
    }

    /// Export draw and footprint for every instance with a reading and
    /// withdraw the series of instances that no longer have one
    fn publish_instance_energy(&mut self) {
        let inner = &self.engine.inner;
        let mut current = HashMap::new();
        for reading in inner.energy.readings() {
            let instance_type = inner
                .inventory
                .get(&reading.instance_id)
                .map(|i| i.instance_type)
                .unwrap_or_else(|| "unknown".to_string());
            inner.metrics.set_instance_energy(
                &reading.instance_id,
                &instance_type,
                &reading.region,
                reading.power_draw,
                reading.carbon_intensity,
            );
            current.insert(reading.instance_id, (instance_type, reading.region));
        }

        for (instance_id, labels) in self.published.drain() {
            if current.get(&instance_id) != Some(&labels) {
                inner
                    .metrics
                    .remove_instance_energy(&instance_id, &labels.0, &labels.1);
            }
        }
        self.published = current;
    }

    /// Allocations under monitoring with their bound instance
    fn monitored(&self) -> Vec<(Uuid, String)> {
        self.engine
            .inner
            .supervisor
            .in_state(SystemState::MonitoringPhase)
            .into_iter()
            .filter_map(|l| l.instance_id.map(|i| (l.request_id, i)))
            .collect()
    }

    fn evaluate(&mut self, instance_id: &str) -> Option<Trigger> {
        let inner = &self.engine.inner;
        let monitoring = &inner.config.monitoring;
        let instance = inner.inventory.get(instance_id)?;
        if instance.status != InstanceStatus::Active {
            return None;
        }

        let streak = if instance.current_utilization < monitoring.underutilization_threshold {
            let streak = self.underutilized.entry(instance_id.to_string()).or_insert(0);
            *streak += 1;
            *streak
        } else {
            self.underutilized.remove(instance_id);
            0
        };

        if streak >= monitoring.underutilization_ticks {
            return Some(Trigger::Underutilized {
                utilization: instance.current_utilization,
                ticks: streak,
            });
        }

        inner
            .energy
            .latest(instance_id)
            .filter(|s| s.power_draw > monitoring.instance_power_ceiling)
            .map(|s| Trigger::EnergyOverrun {
                power_draw: s.power_draw,
                ceiling: monitoring.instance_power_ceiling,
            })
    }

    async fn optimize(&mut self, request_id: Uuid, instance_id: &str, trigger: Trigger, report: &mut TickReport) {
        let inner = &self.engine.inner;
        if inner
            .supervisor
            .transition(request_id, SystemState::Optimization)
            .is_err()
        {
            return;
        }
        inner.metrics.inc_optimization_action(trigger.action());
        let region = inner
            .inventory
            .get(instance_id)
            .map(|i| i.region)
            .unwrap_or_default();

        match trigger {
            Trigger::Underutilized { utilization, ticks } => {
                let retired = {
                    let _region_guard = inner.inventory.lock_region(&region).await;
                    inner.executor.retire(instance_id).await
                };
                match retired {
                    Ok(()) => {
                        self.underutilized.remove(instance_id);
                        inner.energy.forget(instance_id);
                        inner.logger.log_optimization_action(
                            instance_id,
                            &region,
                            "drain",
                            &format!(
                                "utilization {:.2} for {} ticks, instance drained and deprovisioned",
                                utilization, ticks
                            ),
                        );
                        report.retired += 1;
                        if let Err(conflict) = inner
                            .supervisor
                            .transition(request_id, SystemState::MonitoringPhase)
                        {
                            debug!(request_id = %request_id, error = %conflict, "Drained allocation left optimization early");
                        }
                        if inner
                            .supervisor
                            .transition(request_id, SystemState::Idle)
                            .is_ok()
                        {
                            report.closed += 1;
                        }
                    }
                    Err(e) => {
                        inner.supervisor.escalate(request_id, e.to_string());
                    }
                }
            }
            Trigger::EnergyOverrun { power_draw, ceiling } => {
                inner.logger.log_optimization_action(
                    instance_id,
                    &region,
                    "scale_out",
                    &format!(
                        "draw {:.1}W above ceiling {:.1}W, spread load onto additional capacity",
                        power_draw, ceiling
                    ),
                );
                report.scale_out_recommendations += 1;
                if let Err(conflict) = inner
                    .supervisor
                    .transition(request_id, SystemState::MonitoringPhase)
                {
                    debug!(request_id = %request_id, error = %conflict, "Allocation not returned to monitoring");
                }
            }
        }
    }

    /// Retry recovery of errored allocations: deprovision whatever they
    /// still hold, then return them to Idle; repeated failure halts them.
    async fn recover_errored(&mut self, report: &mut TickReport) {
        let inner = &self.engine.inner;
        for lifecycle in inner.supervisor.in_state(SystemState::Error) {
            let held = lifecycle
                .instance_id
                .as_deref()
                .and_then(|id| inner.inventory.get(id))
                .filter(|i| i.status != InstanceStatus::Terminated);

            let reconciled = match held {
                None => true,
                Some(instance) => {
                    let (result, _) = inner.executor.deprovision_with_retry(&instance.id).await;
                    match result {
                        Ok(()) => {
                            inner.energy.forget(&instance.id);
                            inner
                                .inventory
                                .advance(&instance.id, InstanceStatus::Terminated)
                                .is_ok()
                        }
                        Err(e) => {
                            warn!(
                                request_id = %lifecycle.request_id,
                                instance_id = %instance.id,
                                error = %e,
                                "Recovery deprovision failed"
                            );
                            false
                        }
                    }
                }
            };

            match inner.supervisor.recover(lifecycle.request_id, reconciled) {
                Ok(SystemState::Idle) => report.recovered += 1,
                Ok(SystemState::Halted) => report.halted += 1,
                _ => {}
            }
        }
    }
}
