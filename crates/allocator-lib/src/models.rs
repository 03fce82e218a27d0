//! Core data models for the allocation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Request priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Weight used by the optimizer's priority term
    pub fn weight(&self) -> f64 {
        match self {
            Priority::Low => 0.25,
            Priority::Normal => 0.5,
            Priority::High => 0.75,
            Priority::Critical => 1.0,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Priority::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(format!(
                "unknown priority '{}', expected low|normal|high|critical",
                other
            )),
        }
    }
}

/// Inbound allocation body as received from the request surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPayload {
    pub cpu_request: f64,
    pub memory_request: String,
    pub priority: String,
    pub max_energy_consumption: f64,
}

/// A validated allocation request. Immutable once accepted into processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub id: Uuid,
    pub cpu_request: f64,
    /// Normalized byte count
    pub memory_request: u64,
    pub priority: Priority,
    /// Watts-equivalent ceiling
    pub max_energy_consumption: f64,
    pub submitted_at: DateTime<Utc>,
}

/// Key a forecast is produced and cached for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForecastKey {
    pub instance_type: String,
    pub region: String,
}

impl ForecastKey {
    pub fn new(instance_type: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            instance_type: instance_type.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for ForecastKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance_type, self.region)
    }
}

/// Demand forecast consumed once per decision cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastResult {
    pub key: ForecastKey,
    /// Predicted demand in cpu cores
    pub predicted_demand: f64,
    pub horizon_secs: u64,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
    /// Set when the result is a fallback estimate or fell under the confidence floor
    #[serde(default)]
    pub degraded: bool,
}

impl ForecastResult {
    /// Age of the result relative to `now`, in whole seconds
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.generated_at).num_seconds()
    }
}

/// Energy reading for one instance (or a region rollup)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergySnapshot {
    pub instance_id: String,
    pub region: String,
    /// Watts
    pub power_draw: f64,
    /// Grams CO2 per kWh for the region
    pub carbon_intensity: f64,
    pub observed_at: DateTime<Utc>,
}

impl EnergySnapshot {
    /// Instance id prefix used for region rollups
    pub const ROLLUP_PREFIX: &'static str = "region/";

    /// Aggregate the latest per-instance readings of one region into a rollup
    pub fn region_rollup(region: &str, readings: &[EnergySnapshot]) -> Option<Self> {
        let in_region: Vec<&EnergySnapshot> =
            readings.iter().filter(|s| s.region == region).collect();
        if in_region.is_empty() {
            return None;
        }

        let power_draw = in_region.iter().map(|s| s.power_draw).sum();
        let carbon_intensity =
            in_region.iter().map(|s| s.carbon_intensity).sum::<f64>() / in_region.len() as f64;
        let observed_at = in_region.iter().map(|s| s.observed_at).max()?;

        Some(Self {
            instance_id: format!("{}{}", Self::ROLLUP_PREFIX, region),
            region: region.to_string(),
            power_draw,
            carbon_intensity,
            observed_at,
        })
    }

    pub fn is_rollup(&self) -> bool {
        self.instance_id.starts_with(Self::ROLLUP_PREFIX)
    }
}

/// Instance lifecycle status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Active,
    Draining,
    Terminated,
}

impl InstanceStatus {
    fn rank(&self) -> u8 {
        match self {
            InstanceStatus::Pending => 0,
            InstanceStatus::Active => 1,
            InstanceStatus::Draining => 2,
            InstanceStatus::Terminated => 3,
        }
    }

    /// Forward-only check; skipping ahead (e.g. pending -> terminated) is allowed
    pub fn can_advance_to(&self, next: InstanceStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Active => "active",
            InstanceStatus::Draining => "draining",
            InstanceStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compute instance in the shared inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub instance_type: String,
    pub region: String,
    pub status: InstanceStatus,
    /// 0.0 - 1.0
    pub current_utilization: f64,
    /// Allocation this instance is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    /// Projected draw reserved by the binding decision (watts)
    #[serde(default)]
    pub reserved_draw: f64,
}

/// Chosen instance type and region
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Placement {
    pub instance_type: String,
    pub region: String,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.instance_type, self.region)
    }
}

/// Decision outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Accepted,
    Deferred,
    Rejected,
    Failed,
}

impl Outcome {
    /// Deferred is the only non-terminal outcome
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Deferred)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted => "accepted",
            Outcome::Deferred => "deferred",
            Outcome::Rejected => "rejected",
            Outcome::Failed => "failed",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accepted" => Ok(Outcome::Accepted),
            "deferred" => Ok(Outcome::Deferred),
            "rejected" => Ok(Outcome::Rejected),
            "failed" => Ok(Outcome::Failed),
            other => Err(format!("unknown outcome '{}'", other)),
        }
    }
}

/// Placement decision for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationDecision {
    pub request_id: Uuid,
    /// None when rejected or deferred
    pub placement: Option<Placement>,
    pub outcome: Outcome,
    pub score: f64,
    pub projected_energy_cost: Option<f64>,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of prior deferrals
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub critical_override: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl AllocationDecision {
    /// A decision without a placement (deferred, rejected or failed before placement)
    pub fn unplaced(request_id: Uuid, outcome: Outcome, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            placement: None,
            outcome,
            score: 0.0,
            projected_energy_cost: None,
            decided_at: Utc::now(),
            reason: Some(reason.into()),
            attempt: 0,
            critical_override: false,
            instance_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }
}

/// Response body of the allocation contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub request_id: Uuid,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub projected_energy_cost: Option<f64>,
}

impl From<&AllocationDecision> for AllocationResponse {
    fn from(decision: &AllocationDecision) -> Self {
        Self {
            request_id: decision.request_id,
            outcome: decision.outcome,
            chosen_instance: decision.instance_id.clone(),
            projected_energy_cost: decision.projected_energy_cost,
        }
    }
}

/// Candidate placement (instance type x region) offered to the optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementCandidate {
    pub instance_type: String,
    pub region: String,
    pub cpu_capacity: f64,
    pub memory_capacity: u64,
    pub hourly_cost: f64,
    /// Opaque catalog figure (watts)
    pub estimated_power_draw: f64,
    /// Latest regional figure (gCO2/kWh)
    pub carbon_intensity: f64,
    pub discovery_order: usize,
}

impl PlacementCandidate {
    pub fn placement(&self) -> Placement {
        Placement {
            instance_type: self.instance_type.clone(),
            region: self.region.clone(),
        }
    }

    pub fn fits(&self, request: &AllocationRequest) -> bool {
        self.cpu_capacity >= request.cpu_request && self.memory_capacity >= request.memory_request
    }
}

/// Aggregated sustainability view of one region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSustainability {
    pub region: String,
    pub carbon_intensity: f64,
    pub renewable_percentage: f64,
    /// Sum of the latest per-instance draws (watts)
    pub power_draw: f64,
    /// Least-squares slope of recent regional draw, watts per tick
    pub energy_trend: f64,
    pub samples: usize,
}
