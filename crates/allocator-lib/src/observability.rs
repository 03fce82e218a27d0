//! Observability infrastructure for the allocation engine
//!
//! Provides:
//! - Prometheus metrics (decisions, latency, gate modes, regional and per-instance energy, lifecycles)
//! - Structured JSON logging of domain events with tracing

use crate::models::{AllocationDecision, Priority};
use crate::supervisor::SystemState;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, GaugeVec, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Histogram buckets for decision latency (in seconds)
const DECISION_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    decisions: IntCounterVec,
    decision_latency_seconds: Histogram,
    in_flight: IntGauge,
    queue_depth: IntGauge,
    forecast_requests: IntCounterVec,
    forecast_degraded: IntCounter,
    provisioning_retries: IntCounter,
    compensations: IntCounterVec,
    critical_overrides: IntCounter,
    gate_over_threshold: IntGaugeVec,
    region_power_draw_watts: GaugeVec,
    region_carbon_intensity: GaugeVec,
    instance_power_draw_watts: GaugeVec,
    instance_carbon_footprint: GaugeVec,
    lifecycles: IntGaugeVec,
    state_conflicts: IntCounter,
    telemetry_errors: IntCounter,
    optimization_actions: IntCounterVec,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            decisions: register_int_counter_vec!(
                "eco_allocator_decisions_total",
                "Allocation decisions by outcome",
                &["outcome"]
            )
            .expect("Failed to register decisions_total"),

            decision_latency_seconds: register_histogram!(
                "eco_allocator_decision_latency_seconds",
                "Time from dequeue to decision for an allocation request",
                DECISION_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register decision_latency_seconds"),

            in_flight: register_int_gauge!(
                "eco_allocator_in_flight_decisions",
                "Allocation decisions currently in flight"
            )
            .expect("Failed to register in_flight_decisions"),

            queue_depth: register_int_gauge!(
                "eco_allocator_queue_depth",
                "Requests waiting in the processing queue"
            )
            .expect("Failed to register queue_depth"),

            forecast_requests: register_int_counter_vec!(
                "eco_allocator_forecast_requests_total",
                "Forecast lookups by source",
                &["source"]
            )
            .expect("Failed to register forecast_requests_total"),

            forecast_degraded: register_int_counter!(
                "eco_allocator_forecast_degraded_total",
                "Forecasts served in degraded mode"
            )
            .expect("Failed to register forecast_degraded_total"),

            provisioning_retries: register_int_counter!(
                "eco_allocator_provisioning_retries_total",
                "Retried control plane calls after transient failures"
            )
            .expect("Failed to register provisioning_retries_total"),

            compensations: register_int_counter_vec!(
                "eco_allocator_compensations_total",
                "Compensating deprovisions by result",
                &["result"]
            )
            .expect("Failed to register compensations_total"),

            critical_overrides: register_int_counter!(
                "eco_allocator_critical_overrides_total",
                "Critical requests admitted past the energy ceiling"
            )
            .expect("Failed to register critical_overrides_total"),

            gate_over_threshold: register_int_gauge_vec!(
                "eco_allocator_gate_over_threshold",
                "1 when the region's energy gate is in over-threshold mode",
                &["region"]
            )
            .expect("Failed to register gate_over_threshold"),

            region_power_draw_watts: register_gauge_vec!(
                "eco_allocator_region_power_draw_watts",
                "Latest observed regional power draw",
                &["region"]
            )
            .expect("Failed to register region_power_draw_watts"),

            region_carbon_intensity: register_gauge_vec!(
                "eco_allocator_region_carbon_intensity",
                "Latest regional carbon intensity in gCO2/kWh",
                &["region"]
            )
            .expect("Failed to register region_carbon_intensity"),

            instance_power_draw_watts: register_gauge_vec!(
                "eco_allocator_instance_power_draw_watts",
                "Latest observed power draw per instance",
                &["instance_id", "instance_type"]
            )
            .expect("Failed to register instance_power_draw_watts"),

            instance_carbon_footprint: register_gauge_vec!(
                "eco_allocator_instance_carbon_footprint",
                "Estimated emissions per instance in gCO2/h",
                &["instance_id", "region"]
            )
            .expect("Failed to register instance_carbon_footprint"),

            lifecycles: register_int_gauge_vec!(
                "eco_allocator_lifecycles",
                "Tracked allocation lifecycles by supervisor state",
                &["state"]
            )
            .expect("Failed to register lifecycles"),

            state_conflicts: register_int_counter!(
                "eco_allocator_state_conflicts_total",
                "Rejected supervisor transitions"
            )
            .expect("Failed to register state_conflicts_total"),

            telemetry_errors: register_int_counter!(
                "eco_allocator_telemetry_errors_total",
                "Failed or timed out telemetry refreshes"
            )
            .expect("Failed to register telemetry_errors_total"),

            optimization_actions: register_int_counter_vec!(
                "eco_allocator_optimization_actions_total",
                "Re-optimization actions by kind",
                &["action"]
            )
            .expect("Failed to register optimization_actions_total"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EngineMetrics")
    }
}

impl EngineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn record_decision(&self, outcome: &str, latency_secs: f64) {
        self.inner().decisions.with_label_values(&[outcome]).inc();
        self.inner().decision_latency_seconds.observe(latency_secs);
    }

    pub fn set_in_flight(&self, count: i64) {
        self.inner().in_flight.set(count);
    }

    pub fn inc_queue_depth(&self) {
        self.inner().queue_depth.inc();
    }

    pub fn dec_queue_depth(&self) {
        self.inner().queue_depth.dec();
    }

    /// `source` is one of cache, collaborator, fallback
    pub fn inc_forecast_request(&self, source: &str) {
        self.inner()
            .forecast_requests
            .with_label_values(&[source])
            .inc();
    }

    pub fn inc_forecast_degraded(&self) {
        self.inner().forecast_degraded.inc();
    }

    pub fn inc_provisioning_retries(&self) {
        self.inner().provisioning_retries.inc();
    }

    pub fn inc_compensation(&self, succeeded: bool) {
        let label = if succeeded { "succeeded" } else { "failed" };
        self.inner().compensations.with_label_values(&[label]).inc();
    }

    pub fn inc_critical_overrides(&self) {
        self.inner().critical_overrides.inc();
    }

    pub fn set_gate_mode(&self, region: &str, over_threshold: bool) {
        self.inner()
            .gate_over_threshold
            .with_label_values(&[region])
            .set(i64::from(over_threshold));
    }

    pub fn set_region_energy(&self, region: &str, power_draw: f64, carbon_intensity: f64) {
        self.inner()
            .region_power_draw_watts
            .with_label_values(&[region])
            .set(power_draw);
        self.inner()
            .region_carbon_intensity
            .with_label_values(&[region])
            .set(carbon_intensity);
    }

    /// Per-instance draw and footprint. The footprint is draw in kW times
    /// the region's carbon intensity, in gCO2/h.
    pub fn set_instance_energy(
        &self,
        instance_id: &str,
        instance_type: &str,
        region: &str,
        power_draw: f64,
        carbon_intensity: f64,
    ) {
        self.inner()
            .instance_power_draw_watts
            .with_label_values(&[instance_id, instance_type])
            .set(power_draw);
        self.inner()
            .instance_carbon_footprint
            .with_label_values(&[instance_id, region])
            .set(power_draw / 1000.0 * carbon_intensity);
    }

    /// Drop an instance's series; false if they were not published
    pub fn remove_instance_energy(&self, instance_id: &str, instance_type: &str, region: &str) -> bool {
        let draw = self
            .inner()
            .instance_power_draw_watts
            .remove_label_values(&[instance_id, instance_type])
            .is_ok();
        let footprint = self
            .inner()
            .instance_carbon_footprint
            .remove_label_values(&[instance_id, region])
            .is_ok();
        draw && footprint
    }

    /// Publish lifecycle counts; states missing from `counts` are reported as zero
    pub fn set_lifecycles(&self, counts: &HashMap<SystemState, usize>) {
        for state in SystemState::ALL {
            let count = counts.get(&state).copied().unwrap_or(0);
            self.inner()
                .lifecycles
                .with_label_values(&[state.as_str()])
                .set(count as i64);
        }
    }

    pub fn inc_state_conflicts(&self) {
        self.inner().state_conflicts.inc();
    }

    pub fn inc_telemetry_errors(&self) {
        self.inner().telemetry_errors.inc();
    }

    pub fn inc_optimization_action(&self, action: &str) {
        self.inner()
            .optimization_actions
            .with_label_values(&[action])
            .inc();
    }
}

/// Structured logger for engine events
///
/// Consistent JSON-formatted logging for decisions, overrides, gate modes,
/// compensations and state transitions.
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    engine_id: String,
}

impl StructuredLogger {
    pub fn new(engine_id: impl Into<String>) -> Self {
        Self {
            engine_id: engine_id.into(),
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// Log a decision (terminal or deferred)
    pub fn log_decision(&self, decision: &AllocationDecision, priority: Priority, latency_secs: f64) {
        let placement = decision
            .placement
            .as_ref()
            .map(|p| p.to_string())
            .unwrap_or_default();
        info!(
            event = "allocation_decided",
            engine = %self.engine_id,
            request_id = %decision.request_id,
            outcome = %decision.outcome,
            priority = %priority,
            placement = %placement,
            score = decision.score,
            projected_energy_cost = ?decision.projected_energy_cost,
            attempt = decision.attempt,
            critical_override = decision.critical_override,
            reason = ?decision.reason,
            latency_secs = latency_secs,
            "Allocation decision recorded"
        );
    }

    /// Log a critical request admitted past the energy ceiling
    pub fn log_critical_override(
        &self,
        request_id: Uuid,
        region: &str,
        projected: f64,
        ceiling: f64,
        over_threshold_mode: bool,
    ) {
        warn!(
            event = "critical_override",
            engine = %self.engine_id,
            request_id = %request_id,
            region = %region,
            projected_watts = projected,
            ceiling_watts = ceiling,
            over_threshold_mode = over_threshold_mode,
            "Critical request admitted past the energy ceiling"
        );
    }

    /// Log an energy gate hysteresis mode change
    pub fn log_gate_mode_change(&self, region: &str, over_threshold: bool, power_draw: f64, threshold: f64) {
        if over_threshold {
            warn!(
                event = "gate_mode_changed",
                engine = %self.engine_id,
                region = %region,
                over_threshold = true,
                power_draw_watts = power_draw,
                threshold_watts = threshold,
                "Region entered over-threshold mode"
            );
        } else {
            info!(
                event = "gate_mode_changed",
                engine = %self.engine_id,
                region = %region,
                over_threshold = false,
                power_draw_watts = power_draw,
                threshold_watts = threshold,
                "Region returned under threshold"
            );
        }
    }

    /// Log a compensating deprovision
    pub fn log_compensation(&self, request_id: Uuid, instance_id: &str, succeeded: bool, cause: &str) {
        if succeeded {
            warn!(
                event = "compensation",
                engine = %self.engine_id,
                request_id = %request_id,
                instance_id = %instance_id,
                succeeded = true,
                cause = %cause,
                "Partial provisioning rolled back"
            );
        } else {
            error!(
                event = "compensation",
                engine = %self.engine_id,
                request_id = %request_id,
                instance_id = %instance_id,
                succeeded = false,
                cause = %cause,
                "Compensating deprovision failed, escalating"
            );
        }
    }

    pub fn log_state_transition(&self, request_id: Uuid, from: SystemState, to: SystemState) {
        info!(
            event = "state_transition",
            engine = %self.engine_id,
            request_id = %request_id,
            from = %from,
            to = %to,
            "Lifecycle transition"
        );
    }

    pub fn log_state_conflict(&self, request_id: Uuid, from: SystemState, to: SystemState) {
        error!(
            event = "state_conflict",
            engine = %self.engine_id,
            request_id = %request_id,
            from = %from,
            to = %to,
            "Illegal lifecycle transition, routing to error"
        );
    }

    pub fn log_escalation(&self, request_id: Uuid, from: SystemState, reason: &str) {
        error!(
            event = "escalated",
            engine = %self.engine_id,
            request_id = %request_id,
            from = %from,
            reason = %reason,
            "Lifecycle escalated to error"
        );
    }

    pub fn log_recovery(&self, request_id: Uuid, outcome: SystemState, attempts: u32) {
        if outcome == SystemState::Halted {
            error!(
                event = "recovery_abandoned",
                engine = %self.engine_id,
                request_id = %request_id,
                attempts = attempts,
                "Recovery abandoned, manual intervention required"
            );
        } else {
            info!(
                event = "recovery",
                engine = %self.engine_id,
                request_id = %request_id,
                outcome = %outcome,
                attempts = attempts,
                "Lifecycle recovery attempted"
            );
        }
    }

    /// Log a re-optimization action taken by the monitoring tick
    pub fn log_optimization_action(&self, instance_id: &str, region: &str, action: &str, detail: &str) {
        info!(
            event = "optimization_action",
            engine = %self.engine_id,
            instance_id = %instance_id,
            region = %region,
            action = %action,
            detail = %detail,
            "Re-optimization action"
        );
    }

    pub fn log_startup(&self, version: &str, regions: usize, instance_types: usize) {
        info!(
            event = "engine_started",
            engine = %self.engine_id,
            version = %version,
            regions = regions,
            instance_types = instance_types,
            "Allocation engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            engine = %self.engine_id,
            reason = %reason,
            "Allocation engine shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handle_shares_global_instance() {
        let a = EngineMetrics::new();
        let b = a.clone();
        a.inc_critical_overrides();
        b.inc_critical_overrides();
        assert!(GLOBAL_METRICS.get().unwrap().critical_overrides.get() >= 2);
    }

    #[test]
    fn test_gate_mode_gauge() {
        let metrics = EngineMetrics::new();
        metrics.set_gate_mode("obs-test-region", true);
        let gauge = GLOBAL_METRICS
            .get()
            .unwrap()
            .gate_over_threshold
            .with_label_values(&["obs-test-region"]);
        assert_eq!(gauge.get(), 1);
        metrics.set_gate_mode("obs-test-region", false);
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_instance_energy_series_are_removable() {
        let metrics = EngineMetrics::new();
        metrics.set_instance_energy("obs-i-1", "m5.large", "obs-region", 250.0, 400.0);
        let footprint = GLOBAL_METRICS
            .get()
            .unwrap()
            .instance_carbon_footprint
            .with_label_values(&["obs-i-1", "obs-region"]);
        assert_eq!(footprint.get(), 100.0);

        assert!(metrics.remove_instance_energy("obs-i-1", "m5.large", "obs-region"));
        assert!(!metrics.remove_instance_energy("obs-i-1", "m5.large", "obs-region"));
    }
}
