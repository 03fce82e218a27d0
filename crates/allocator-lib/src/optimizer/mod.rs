//! Allocation optimizer
//!
//! Scores gate-admitted candidate placements and selects one:
//!
//! `score = w1*(1 - carbon) + w2*(1 - cost) + w3*priority + w4*forecast_fit`
//!
//! with carbon and cost min-max normalized over the admitted set. Scores
//! within epsilon are tied and resolved by lower carbon intensity, lower
//! projected energy cost, then earlier discovery.

mod scoring;

pub use scoring::{bounds, forecast_fit, normalize, tie_break};

use crate::config::OptimizerConfig;
use crate::gate::{GateEvaluation, GateVerdict};
use crate::models::{
    AllocationDecision, AllocationRequest, ForecastResult, Outcome, PlacementCandidate,
};
use chrono::Utc;
use tracing::debug;

/// A candidate together with its gate evaluation
#[derive(Debug, Clone)]
pub struct EvaluatedCandidate {
    pub candidate: PlacementCandidate,
    pub evaluation: GateEvaluation,
}

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: PlacementCandidate,
    pub evaluation: GateEvaluation,
    pub score: f64,
    pub forecast_fit: f64,
}

/// Decision plus the winning candidate when one was placed
#[derive(Debug, Clone)]
pub struct Selection {
    pub decision: AllocationDecision,
    pub chosen: Option<ScoredCandidate>,
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Candidates with enough cpu and memory for the request, in discovery order
    pub fn eligible(&self, request: &AllocationRequest, candidates: &[PlacementCandidate]) -> Vec<PlacementCandidate> {
        let mut eligible: Vec<PlacementCandidate> =
            candidates.iter().filter(|c| c.fits(request)).cloned().collect();
        eligible.sort_by_key(|c| c.discovery_order);
        eligible
    }

    /// Score gate-admitted candidates
    pub fn score(
        &self,
        request: &AllocationRequest,
        forecast: &ForecastResult,
        admitted: &[EvaluatedCandidate],
    ) -> Vec<ScoredCandidate> {
        let (carbon_min, carbon_max) = bounds(admitted.iter().map(|c| c.candidate.carbon_intensity));
        let (cost_min, cost_max) = bounds(admitted.iter().map(|c| c.candidate.hourly_cost));
        let weights = &self.config.weights;
        let priority_weight = request.priority.weight();

        admitted
            .iter()
            .map(|c| {
                let carbon = normalize(c.candidate.carbon_intensity, carbon_min, carbon_max);
                let cost = normalize(c.candidate.hourly_cost, cost_min, cost_max);
                let fit = forecast_fit(
                    c.candidate.cpu_capacity,
                    request.cpu_request,
                    forecast.predicted_demand,
                    self.config.fit_tolerance,
                );
                let score = weights.carbon * (1.0 - carbon)
                    + weights.cost * (1.0 - cost)
                    + weights.priority * priority_weight
                    + weights.forecast_fit * fit;
                ScoredCandidate {
                    candidate: c.candidate.clone(),
                    evaluation: c.evaluation.clone(),
                    score,
                    forecast_fit: fit,
                }
            })
            .collect()
    }

    /// Select a placement for the request.
    ///
    /// `attempt` is the request's deferral count; with no admitted candidate
    /// the request is deferred while `attempt < max_deferrals`, else rejected.
    pub fn select(
        &self,
        request: &AllocationRequest,
        forecast: &ForecastResult,
        evaluated: &[EvaluatedCandidate],
        attempt: u32,
        max_deferrals: u32,
    ) -> Selection {
        if evaluated.is_empty() {
            let mut decision = AllocationDecision::unplaced(
                request.id,
                Outcome::Rejected,
                "no candidate placement satisfies the cpu and memory request",
            );
            decision.attempt = attempt;
            return Selection {
                decision,
                chosen: None,
            };
        }

        let admitted: Vec<EvaluatedCandidate> = evaluated
            .iter()
            .filter(|c| c.evaluation.verdict == GateVerdict::Accept)
            .cloned()
            .collect();

        if admitted.is_empty() {
            let outcome = if attempt < max_deferrals {
                Outcome::Deferred
            } else {
                Outcome::Rejected
            };
            let reason = evaluated
                .iter()
                .find_map(|c| c.evaluation.reason())
                .unwrap_or_else(|| "no candidate passed the energy gate".to_string());
            let mut decision = AllocationDecision::unplaced(request.id, outcome, reason);
            decision.attempt = attempt;
            return Selection {
                decision,
                chosen: None,
            };
        }

        let scored = self.score(request, forecast, &admitted);
        let best = scored
            .iter()
            .map(|s| s.score)
            .fold(f64::NEG_INFINITY, f64::max);
        let winner = scored
            .into_iter()
            .filter(|s| best - s.score <= self.config.tie_epsilon)
            .min_by(|a, b| {
                tie_break(
                    (
                        a.candidate.carbon_intensity,
                        a.evaluation.projected,
                        a.candidate.discovery_order,
                    ),
                    (
                        b.candidate.carbon_intensity,
                        b.evaluation.projected,
                        b.candidate.discovery_order,
                    ),
                )
            });

        match winner {
            Some(chosen) => {
                debug!(
                    request_id = %request.id,
                    placement = %chosen.candidate.placement(),
                    score = chosen.score,
                    forecast_fit = chosen.forecast_fit,
                    "Placement selected"
                );
                let decision = AllocationDecision {
                    request_id: request.id,
                    placement: Some(chosen.candidate.placement()),
                    outcome: Outcome::Accepted,
                    score: chosen.score,
                    projected_energy_cost: Some(chosen.evaluation.projected),
                    decided_at: Utc::now(),
                    reason: None,
                    attempt,
                    critical_override: chosen.evaluation.critical_override,
                    instance_id: None,
                };
                Selection {
                    decision,
                    chosen: Some(chosen),
                }
            }
            None => {
                let mut decision = AllocationDecision::unplaced(
                    request.id,
                    Outcome::Rejected,
                    "no candidate produced a finite score",
                );
                decision.attempt = attempt;
                Selection {
                    decision,
                    chosen: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreWeights;
    use crate::error::EnergyThresholdExceeded;
    use crate::models::{ForecastKey, Priority};
    use uuid::Uuid;

    fn request(cpu: f64) -> AllocationRequest {
        AllocationRequest {
            id: Uuid::new_v4(),
            cpu_request: cpu,
            memory_request: 4 << 30,
            priority: Priority::High,
            max_energy_consumption: 100.0,
            submitted_at: Utc::now(),
        }
    }

    fn forecast(demand: f64) -> ForecastResult {
        ForecastResult {
            key: ForecastKey::new("m5.large", "us-east-1"),
            predicted_demand: demand,
            horizon_secs: 3600,
            confidence: 0.9,
            generated_at: Utc::now(),
            degraded: false,
        }
    }

    fn candidate(region: &str, carbon: f64, cost: f64, cpu: f64, order: usize) -> PlacementCandidate {
        PlacementCandidate {
            instance_type: format!("type-{}", order),
            region: region.to_string(),
            cpu_capacity: cpu,
            memory_capacity: 16 << 30,
            hourly_cost: cost,
            estimated_power_draw: 50.0,
            carbon_intensity: carbon,
            discovery_order: order,
        }
    }

    fn accepted(c: PlacementCandidate, projected: f64) -> EvaluatedCandidate {
        EvaluatedCandidate {
            evaluation: GateEvaluation {
                verdict: GateVerdict::Accept,
                region: c.region.clone(),
                projected,
                ceiling: 1000.0,
                over_threshold: false,
                critical_override: false,
                defer_delay: None,
                exceeded: None,
            },
            candidate: c,
        }
    }

    fn refused(c: PlacementCandidate, verdict: GateVerdict) -> EvaluatedCandidate {
        EvaluatedCandidate {
            evaluation: GateEvaluation {
                verdict,
                region: c.region.clone(),
                projected: 1200.0,
                ceiling: 1000.0,
                over_threshold: verdict == GateVerdict::Defer,
                critical_override: false,
                defer_delay: None,
                exceeded: Some(EnergyThresholdExceeded {
                    region: c.region.clone(),
                    projected: 1200.0,
                    ceiling: 1000.0,
                    over_threshold_mode: verdict == GateVerdict::Defer,
                }),
            },
            candidate: c,
        }
    }

    #[test]
    fn test_prefers_low_carbon_low_cost() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let evaluated = vec![
            accepted(candidate("ap-southeast-1", 600.0, 0.20, 2.0, 0), 500.0),
            accepted(candidate("eu-west-1", 200.0, 0.10, 2.0, 1), 500.0),
        ];
        let selection = optimizer.select(&request(2.0), &forecast(2.0), &evaluated, 0, 3);

        assert_eq!(selection.decision.outcome, Outcome::Accepted);
        assert_eq!(selection.decision.placement.unwrap().region, "eu-west-1");
        assert_eq!(selection.decision.projected_energy_cost, Some(500.0));
    }

    #[test]
    fn test_forecast_fit_avoids_over_provisioning() {
        let config = OptimizerConfig {
            weights: ScoreWeights {
                carbon: 0.0,
                cost: 0.0,
                priority: 0.0,
                forecast_fit: 1.0,
            },
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(config);
        let evaluated = vec![
            accepted(candidate("us-east-1", 400.0, 0.1, 16.0, 0), 500.0),
            accepted(candidate("us-east-1", 400.0, 0.1, 4.0, 1), 500.0),
        ];
        let selection = optimizer.select(&request(2.0), &forecast(4.0), &evaluated, 0, 3);
        let chosen = selection.chosen.unwrap();
        assert_eq!(chosen.candidate.cpu_capacity, 4.0);
        assert_eq!(chosen.forecast_fit, 1.0);
    }

    #[test]
    fn test_tie_break_carbon_then_cost_then_order() {
        // zero weights make every score equal
        let config = OptimizerConfig {
            weights: ScoreWeights {
                carbon: 0.0,
                cost: 0.0,
                priority: 1.0,
                forecast_fit: 0.0,
            },
            ..OptimizerConfig::default()
        };
        let optimizer = Optimizer::new(config);
        let req = request(2.0);
        let fc = forecast(2.0);

        let by_carbon = vec![
            accepted(candidate("a", 400.0, 0.1, 2.0, 0), 100.0),
            accepted(candidate("b", 300.0, 0.1, 2.0, 1), 900.0),
        ];
        let s = optimizer.select(&req, &fc, &by_carbon, 0, 3);
        assert_eq!(s.decision.placement.unwrap().region, "b");

        let by_cost = vec![
            accepted(candidate("a", 300.0, 0.1, 2.0, 0), 700.0),
            accepted(candidate("b", 300.0, 0.1, 2.0, 1), 600.0),
        ];
        let s = optimizer.select(&req, &fc, &by_cost, 0, 3);
        assert_eq!(s.decision.placement.unwrap().region, "b");

        let by_order = vec![
            accepted(candidate("b", 300.0, 0.1, 2.0, 4), 600.0),
            accepted(candidate("a", 300.0, 0.1, 2.0, 2), 600.0),
        ];
        let s = optimizer.select(&req, &fc, &by_order, 0, 3);
        assert_eq!(s.decision.placement.unwrap().region, "a");
    }

    #[test]
    fn test_no_admitted_candidate_defers_then_rejects() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let evaluated = vec![
            refused(candidate("us-east-1", 400.0, 0.1, 2.0, 0), GateVerdict::Defer),
            refused(candidate("eu-west-1", 200.0, 0.1, 2.0, 1), GateVerdict::Reject),
        ];
        let req = request(2.0);

        let deferred = optimizer.select(&req, &forecast(2.0), &evaluated, 1, 3);
        assert_eq!(deferred.decision.outcome, Outcome::Deferred);
        assert!(deferred.decision.placement.is_none());
        assert!(deferred.decision.reason.unwrap().contains("us-east-1"));

        let rejected = optimizer.select(&req, &forecast(2.0), &evaluated, 3, 3);
        assert_eq!(rejected.decision.outcome, Outcome::Rejected);
        assert_eq!(rejected.decision.attempt, 3);
    }

    #[test]
    fn test_no_fitting_candidate_rejects_immediately() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let small = vec![candidate("us-east-1", 400.0, 0.1, 1.0, 0)];
        let req = request(2.0);
        assert!(optimizer.eligible(&req, &small).is_empty());

        let selection = optimizer.select(&req, &forecast(2.0), &[], 0, 3);
        assert_eq!(selection.decision.outcome, Outcome::Rejected);
    }

    #[test]
    fn test_critical_override_carried_to_decision() {
        let optimizer = Optimizer::new(OptimizerConfig::default());
        let mut c = accepted(candidate("us-east-1", 400.0, 0.1, 2.0, 0), 1500.0);
        c.evaluation.critical_override = true;
        let selection = optimizer.select(&request(2.0), &forecast(2.0), &[c], 0, 3);
        assert!(selection.decision.critical_override);
    }
}
