//! Energy gate
//!
//! Decides whether a request's estimated draw is admissible in a region.
//! Each region runs its own hysteresis so noisy telemetry cannot flap the
//! gate, and tracks draw committed by accepted decisions since the last
//! rollup so concurrent decisions cannot overcommit the region.

mod hysteresis;

pub use hysteresis::Hysteresis;

use crate::config::{EngineConfig, GateConfig};
use crate::error::EnergyThresholdExceeded;
use crate::models::{AllocationRequest, EnergySnapshot};
use crate::observability::{EngineMetrics, StructuredLogger};
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateVerdict {
    Accept,
    Defer,
    Reject,
}

/// Result of evaluating one request against one region snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct GateEvaluation {
    pub verdict: GateVerdict,
    pub region: String,
    /// Snapshot draw plus the request's estimated draw
    pub projected: f64,
    /// max(threshold, request ceiling)
    pub ceiling: f64,
    pub over_threshold: bool,
    /// Critical request admitted past the ceiling or inside over-threshold mode
    pub critical_override: bool,
    pub defer_delay: Option<Duration>,
    pub exceeded: Option<EnergyThresholdExceeded>,
}

impl GateEvaluation {
    pub fn is_accepted(&self) -> bool {
        self.verdict == GateVerdict::Accept
    }

    pub fn reason(&self) -> Option<String> {
        match (&self.exceeded, self.verdict) {
            (_, GateVerdict::Accept) => None,
            (Some(e), _) => Some(e.to_string()),
            (None, _) => Some(format!("region {} over energy threshold", self.region)),
        }
    }
}

#[derive(Debug, Default)]
struct RegionGate {
    hysteresis: Hysteresis,
    latest: Option<EnergySnapshot>,
    committed: f64,
}

#[derive(Debug)]
pub struct EnergyGate {
    regions: DashMap<String, RegionGate>,
    config: GateConfig,
    default_threshold: f64,
    region_thresholds: HashMap<String, f64>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl EnergyGate {
    pub fn new(config: &EngineConfig, metrics: EngineMetrics, logger: StructuredLogger) -> Self {
        Self {
            regions: DashMap::new(),
            config: config.gate.clone(),
            default_threshold: config.energy_threshold,
            region_thresholds: config.region_thresholds.clone(),
            metrics,
            logger,
        }
    }

    pub fn threshold_for(&self, region: &str) -> f64 {
        self.region_thresholds
            .get(region)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn max_deferrals(&self) -> u32 {
        self.config.max_deferrals
    }

    /// `base * 2^attempt`, capped
    pub fn defer_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_defer_delay_ms as f64;
        let delay = base * 2f64.powi(attempt.min(30) as i32);
        Duration::from_millis(delay.min(self.config.max_defer_delay_ms as f64) as u64)
    }

    /// Feed a region rollup: advances hysteresis and clears commitments the
    /// rollup now accounts for.
    pub fn observe(&self, snapshot: &EnergySnapshot) {
        let threshold = self.threshold_for(&snapshot.region);
        let change = {
            let mut region = self.regions.entry(snapshot.region.clone()).or_default();
            let change = region
                .hysteresis
                .observe(snapshot.power_draw, threshold, &self.config);
            region.latest = Some(snapshot.clone());
            region.committed = 0.0;
            change
        };

        if let Some(over) = change {
            self.metrics.set_gate_mode(&snapshot.region, over);
            self.logger
                .log_gate_mode_change(&snapshot.region, over, snapshot.power_draw, threshold);
        }
    }

    pub fn is_over_threshold(&self, region: &str) -> bool {
        self.regions
            .get(region)
            .map(|r| r.hysteresis.is_over_threshold())
            .unwrap_or(false)
    }

    /// Latest rollup for the region with committed draw folded in. A region
    /// with no telemetry yet reads as zero draw.
    pub fn current_snapshot(&self, region: &str) -> EnergySnapshot {
        let (latest, committed) = self
            .regions
            .get(region)
            .map(|r| (r.latest.clone(), r.committed))
            .unwrap_or((None, 0.0));

        let mut snapshot = latest.unwrap_or_else(|| EnergySnapshot {
            instance_id: format!("{}{}", EnergySnapshot::ROLLUP_PREFIX, region),
            region: region.to_string(),
            power_draw: 0.0,
            carbon_intensity: 0.0,
            observed_at: Utc::now(),
        });
        snapshot.power_draw += committed;
        snapshot
    }

    /// Record draw of an applied decision until the next rollup
    pub fn commit(&self, region: &str, draw: f64) {
        self.regions.entry(region.to_string()).or_default().committed += draw;
    }

    /// Evaluate a request against a snapshot of its candidate region.
    ///
    /// `attempt` is the number of prior deferrals of the request.
    pub fn evaluate(
        &self,
        request: &AllocationRequest,
        snapshot: &EnergySnapshot,
        estimated_draw: f64,
        attempt: u32,
    ) -> GateEvaluation {
        let threshold = self.threshold_for(&snapshot.region);
        let over_threshold = self.is_over_threshold(&snapshot.region);
        let projected = snapshot.power_draw + estimated_draw;
        let ceiling = threshold.max(request.max_energy_consumption);
        let exceeds = projected > ceiling;

        let exceeded = (exceeds || over_threshold).then(|| EnergyThresholdExceeded {
            region: snapshot.region.clone(),
            projected,
            ceiling,
            over_threshold_mode: over_threshold,
        });

        let mut evaluation = GateEvaluation {
            verdict: GateVerdict::Accept,
            region: snapshot.region.clone(),
            projected,
            ceiling,
            over_threshold,
            critical_override: false,
            defer_delay: None,
            exceeded,
        };

        if request.priority.is_critical() {
            evaluation.critical_override = exceeds || over_threshold;
        } else if over_threshold {
            if attempt < self.config.max_deferrals {
                evaluation.verdict = GateVerdict::Defer;
                evaluation.defer_delay = Some(self.defer_delay(attempt));
            } else {
                evaluation.verdict = GateVerdict::Reject;
            }
        } else if exceeds {
            evaluation.verdict = GateVerdict::Reject;
        }
        evaluation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Priority;
    use uuid::Uuid;

    fn gate() -> EnergyGate {
        EnergyGate::new(
            &EngineConfig::default(),
            EngineMetrics::new(),
            StructuredLogger::new("test"),
        )
    }

    fn request(priority: Priority, max_energy: f64) -> AllocationRequest {
        AllocationRequest {
            id: Uuid::new_v4(),
            cpu_request: 2.0,
            memory_request: 4 << 30,
            priority,
            max_energy_consumption: max_energy,
            submitted_at: Utc::now(),
        }
    }

    fn rollup(region: &str, power_draw: f64) -> EnergySnapshot {
        EnergySnapshot {
            instance_id: format!("region/{}", region),
            region: region.to_string(),
            power_draw,
            carbon_intensity: 400.0,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_accepts_under_threshold() {
        let gate = gate();
        let eval = gate.evaluate(&request(Priority::High, 100.0), &rollup("us-east-1", 600.0), 45.0, 0);
        assert_eq!(eval.verdict, GateVerdict::Accept);
        assert_eq!(eval.projected, 645.0);
        assert_eq!(eval.ceiling, 1000.0);
        assert!(eval.reason().is_none());
    }

    #[test]
    fn test_rejects_only_when_both_limits_exceeded() {
        let gate = gate();
        let snap = rollup("us-east-1", 980.0);

        let eval = gate.evaluate(&request(Priority::Normal, 100.0), &snap, 45.0, 0);
        assert_eq!(eval.verdict, GateVerdict::Reject);
        assert!(eval.reason().unwrap().contains("energy threshold exceeded"));

        // a request ceiling above the projection admits it
        let eval = gate.evaluate(&request(Priority::Normal, 2000.0), &snap, 45.0, 0);
        assert_eq!(eval.verdict, GateVerdict::Accept);
    }

    #[test]
    fn test_critical_overrides_ceiling() {
        let gate = gate();
        let eval = gate.evaluate(
            &request(Priority::Critical, 100.0),
            &rollup("us-east-1", 1500.0),
            45.0,
            0,
        );
        assert_eq!(eval.verdict, GateVerdict::Accept);
        assert!(eval.critical_override);
    }

    #[test]
    fn test_over_threshold_defers_then_rejects() {
        let gate = gate();
        for _ in 0..3 {
            gate.observe(&rollup("us-east-1", 1200.0));
        }
        assert!(gate.is_over_threshold("us-east-1"));

        let snap = gate.current_snapshot("us-east-1");
        let req = request(Priority::Normal, 5000.0);
        for attempt in 0..3 {
            let eval = gate.evaluate(&req, &snap, 45.0, attempt);
            assert_eq!(eval.verdict, GateVerdict::Defer);
            assert!(eval.defer_delay.is_some());
        }
        assert_eq!(gate.evaluate(&req, &snap, 45.0, 3).verdict, GateVerdict::Reject);

        // other regions are unaffected
        assert!(!gate.is_over_threshold("eu-west-1"));
    }

    #[test]
    fn test_commitments_fold_into_snapshot_until_next_rollup() {
        let gate = gate();
        gate.observe(&rollup("us-east-1", 900.0));
        gate.commit("us-east-1", 80.0);
        assert_eq!(gate.current_snapshot("us-east-1").power_draw, 980.0);

        let eval = gate.evaluate(
            &request(Priority::Normal, 100.0),
            &gate.current_snapshot("us-east-1"),
            45.0,
            0,
        );
        assert_eq!(eval.verdict, GateVerdict::Reject);

        gate.observe(&rollup("us-east-1", 900.0));
        assert_eq!(gate.current_snapshot("us-east-1").power_draw, 900.0);
    }

    #[test]
    fn test_region_threshold_override() {
        let mut config = EngineConfig::default();
        config.region_thresholds.insert("eu-west-1".into(), 200.0);
        let gate = EnergyGate::new(&config, EngineMetrics::new(), StructuredLogger::new("test"));

        let eval = gate.evaluate(&request(Priority::Low, 100.0), &rollup("eu-west-1", 180.0), 45.0, 0);
        assert_eq!(eval.verdict, GateVerdict::Reject);
        assert_eq!(eval.ceiling, 200.0);
    }

    #[test]
    fn test_defer_delay_is_capped() {
        let gate = gate();
        assert_eq!(gate.defer_delay(0), Duration::from_secs(1));
        assert_eq!(gate.defer_delay(2), Duration::from_secs(4));
        assert_eq!(gate.defer_delay(20), Duration::from_secs(60));
    }
}
