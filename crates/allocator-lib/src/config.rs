//! Engine configuration
//!
//! Every field carries a default so a partial file (or no file at all) yields a
//! usable configuration. `validate` runs once at startup and rejects anything the
//! engine cannot operate with.

use crate::error::ConfigError;
use crate::intake::parse_memory;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default regional energy threshold in watts
    pub energy_threshold: f64,
    /// Per-region threshold overrides
    pub region_thresholds: HashMap<String, f64>,
    /// Monitoring tick interval in seconds
    pub monitoring_interval: u64,
    /// Maximum concurrent in-flight decisions
    pub max_in_flight: usize,
    /// Capacity of the processing queue
    pub queue_capacity: usize,
    pub gate: GateConfig,
    pub optimizer: OptimizerConfig,
    pub retry: RetryConfig,
    pub forecast: ForecastConfig,
    pub monitoring: MonitoringConfig,
    /// Regional sustainability factors
    pub regions: HashMap<String, RegionProfile>,
    /// Factor used for regions missing from `regions`
    pub default_region: RegionProfile,
    /// Instance types offered as placement candidates
    pub catalog: Vec<InstanceTypeSpec>,
    pub persistence: PersistenceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 1000.0,
            region_thresholds: HashMap::new(),
            monitoring_interval: 300,
            max_in_flight: 64,
            queue_capacity: 1024,
            gate: GateConfig::default(),
            optimizer: OptimizerConfig::default(),
            retry: RetryConfig::default(),
            forecast: ForecastConfig::default(),
            monitoring: MonitoringConfig::default(),
            regions: default_regions(),
            default_region: RegionProfile {
                carbon_intensity: 500.0,
                renewable_percentage: 30.0,
            },
            catalog: default_catalog(),
            persistence: PersistenceConfig::default(),
        }
    }
}

/// Energy gate hysteresis and deferral parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// K: consecutive over-threshold snapshots to enter "over threshold"
    #[serde(alias = "k")]
    pub enter_count: u32,
    /// M: consecutive under-reset snapshots to leave "over threshold"
    #[serde(alias = "m")]
    pub exit_count: u32,
    /// Reset limit as a fraction of the threshold
    pub reset_ratio: f64,
    /// Deferrals allowed before a request is rejected
    pub max_deferrals: u32,
    pub base_defer_delay_ms: u64,
    pub max_defer_delay_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enter_count: 3,
            exit_count: 2,
            reset_ratio: 0.9,
            max_deferrals: 3,
            base_defer_delay_ms: 1_000,
            max_defer_delay_ms: 60_000,
        }
    }
}

/// Scoring weights w1..w4
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    #[serde(alias = "w1")]
    pub carbon: f64,
    #[serde(alias = "w2")]
    pub cost: f64,
    #[serde(alias = "w3")]
    pub priority: f64,
    #[serde(alias = "w4")]
    pub forecast_fit: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            carbon: 0.4,
            cost: 0.3,
            priority: 0.1,
            forecast_fit: 0.2,
        }
    }
}

impl ScoreWeights {
    fn as_array(&self) -> [(&'static str, f64); 4] {
        [
            ("optimizer.weights.carbon", self.carbon),
            ("optimizer.weights.cost", self.cost),
            ("optimizer.weights.priority", self.priority),
            ("optimizer.weights.forecast_fit", self.forecast_fit),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub weights: ScoreWeights,
    /// Scores within epsilon are tied
    pub tie_epsilon: f64,
    /// Relative tolerance around predicted demand for forecast_fit
    pub fit_tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            tie_epsilon: 1e-9,
            fit_tolerance: 0.2,
        }
    }
}

/// Provisioning retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
    /// Timeout applied to every control plane call
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            jitter_ms: 100,
            call_timeout_ms: 10_000,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Forecast adapter parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub validity_window_secs: u64,
    pub confidence_floor: f64,
    /// Multiplier over last observed demand for the fallback estimate
    pub fallback_multiplier: f64,
    pub timeout_ms: u64,
    pub horizon_secs: u64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            validity_window_secs: 900,
            confidence_floor: 0.5,
            fallback_multiplier: 1.5,
            timeout_ms: 2_000,
            horizon_secs: 3_600,
        }
    }
}

impl ForecastConfig {
    pub fn validity_window(&self) -> Duration {
        Duration::from_secs(self.validity_window_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Monitoring tick triggers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Utilization below this counts as underutilized
    pub underutilization_threshold: f64,
    /// Consecutive underutilized ticks before optimization triggers
    pub underutilization_ticks: u32,
    /// Per-instance power draw considered an overrun (watts)
    pub instance_power_ceiling: f64,
    pub telemetry_timeout_ms: u64,
    /// Recovery attempts before an errored lifecycle is halted
    pub max_recovery_attempts: u32,
    /// Regional rollups kept for the energy trend
    pub trend_window: usize,
    /// Ticks without a fresh reading before an instance stops counting
    pub stale_after_ticks: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            underutilization_threshold: 0.1,
            underutilization_ticks: 3,
            instance_power_ceiling: 400.0,
            telemetry_timeout_ms: 10_000,
            max_recovery_attempts: 3,
            trend_window: 12,
            stale_after_ticks: 3,
        }
    }
}

impl MonitoringConfig {
    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }
}

/// Sustainability factors of a region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionProfile {
    /// gCO2/kWh
    pub carbon_intensity: f64,
    pub renewable_percentage: f64,
}

/// One instance type offered in a set of regions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTypeSpec {
    pub instance_type: String,
    pub cpu_capacity: f64,
    /// Quantity string, e.g. "16Gi"
    pub memory_capacity: String,
    pub hourly_cost: f64,
    /// Watts
    pub estimated_power_draw: f64,
    pub regions: Vec<String>,
}

/// Locations of persisted state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub state_dir: PathBuf,
    pub decision_log_file: String,
    pub snapshot_file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/eco-allocator"),
            decision_log_file: "decisions.jsonl".to_string(),
            snapshot_file: "inventory.json".to_string(),
        }
    }
}

impl PersistenceConfig {
    pub fn decision_log_path(&self) -> PathBuf {
        self.state_dir.join(&self.decision_log_file)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir.join(&self.snapshot_file)
    }
}

fn default_regions() -> HashMap<String, RegionProfile> {
    [
        ("us-east-1", 400.0, 35.0),
        ("eu-west-1", 200.0, 60.0),
        ("ap-southeast-1", 600.0, 25.0),
    ]
    .into_iter()
    .map(|(name, carbon_intensity, renewable_percentage)| {
        (
            name.to_string(),
            RegionProfile {
                carbon_intensity,
                renewable_percentage,
            },
        )
    })
    .collect()
}

fn default_catalog() -> Vec<InstanceTypeSpec> {
    let regions = vec![
        "us-east-1".to_string(),
        "eu-west-1".to_string(),
        "ap-southeast-1".to_string(),
    ];
    vec![
        InstanceTypeSpec {
            instance_type: "m5.large".to_string(),
            cpu_capacity: 2.0,
            memory_capacity: "8Gi".to_string(),
            hourly_cost: 0.096,
            estimated_power_draw: 45.0,
            regions: regions.clone(),
        },
        InstanceTypeSpec {
            instance_type: "m5.xlarge".to_string(),
            cpu_capacity: 4.0,
            memory_capacity: "16Gi".to_string(),
            hourly_cost: 0.192,
            estimated_power_draw: 80.0,
            regions: regions.clone(),
        },
        InstanceTypeSpec {
            instance_type: "c5.2xlarge".to_string(),
            cpu_capacity: 8.0,
            memory_capacity: "16Gi".to_string(),
            hourly_cost: 0.34,
            estimated_power_draw: 140.0,
            regions,
        },
    ]
}

impl EngineConfig {
    /// Threshold for a region, honoring overrides
    pub fn threshold_for(&self, region: &str) -> f64 {
        self.region_thresholds
            .get(region)
            .copied()
            .unwrap_or(self.energy_threshold)
    }

    /// Sustainability factors for a region, falling back to the default profile
    pub fn region_profile(&self, region: &str) -> &RegionProfile {
        self.regions.get(region).unwrap_or(&self.default_region)
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_secs(self.monitoring_interval)
    }

    /// Age at which an instance's energy reading is dropped
    pub fn telemetry_stale_after(&self) -> Duration {
        self.monitoring_interval() * self.monitoring.stale_after_ticks
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("energy_threshold", self.energy_threshold)?;
        for (region, threshold) in &self.region_thresholds {
            positive(&format!("region_thresholds.{}", region), *threshold)?;
        }
        if self.monitoring_interval == 0 {
            return Err(ConfigError::new("monitoring_interval", "must be > 0"));
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::new("max_in_flight", "must be >= 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::new("queue_capacity", "must be >= 1"));
        }

        let gate = &self.gate;
        if gate.enter_count == 0 {
            return Err(ConfigError::new("gate.enter_count", "K must be >= 1"));
        }
        if gate.exit_count == 0 {
            return Err(ConfigError::new("gate.exit_count", "M must be >= 1"));
        }
        if !(gate.reset_ratio > 0.0 && gate.reset_ratio < 1.0) {
            return Err(ConfigError::new("gate.reset_ratio", "must be in (0, 1)"));
        }
        if gate.base_defer_delay_ms > gate.max_defer_delay_ms {
            return Err(ConfigError::new(
                "gate.base_defer_delay_ms",
                "must not exceed gate.max_defer_delay_ms",
            ));
        }

        let weights = self.optimizer.weights.as_array();
        for (key, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::new(key, "must be a finite value >= 0"));
            }
        }
        if weights.iter().map(|(_, v)| v).sum::<f64>() <= 0.0 {
            return Err(ConfigError::new(
                "optimizer.weights",
                "at least one weight must be positive",
            ));
        }
        if !(self.optimizer.tie_epsilon >= 0.0) {
            return Err(ConfigError::new("optimizer.tie_epsilon", "must be >= 0"));
        }
        if !(self.optimizer.fit_tolerance >= 0.0 && self.optimizer.fit_tolerance < 1.0) {
            return Err(ConfigError::new("optimizer.fit_tolerance", "must be in [0, 1)"));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::new("retry.max_attempts", "must be >= 1"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::new(
                "retry.initial_backoff_ms",
                "must not exceed retry.max_backoff_ms",
            ));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(ConfigError::new("retry.call_timeout_ms", "must be > 0"));
        }

        let forecast = &self.forecast;
        if forecast.validity_window_secs == 0 {
            return Err(ConfigError::new("forecast.validity_window_secs", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&forecast.confidence_floor) {
            return Err(ConfigError::new("forecast.confidence_floor", "must be in [0, 1]"));
        }
        if !(forecast.fallback_multiplier >= 1.0) {
            return Err(ConfigError::new("forecast.fallback_multiplier", "must be >= 1"));
        }
        if forecast.timeout_ms == 0 {
            return Err(ConfigError::new("forecast.timeout_ms", "must be > 0"));
        }

        if !(0.0..=1.0).contains(&self.monitoring.underutilization_threshold) {
            return Err(ConfigError::new(
                "monitoring.underutilization_threshold",
                "must be in [0, 1]",
            ));
        }
        if self.monitoring.underutilization_ticks == 0 {
            return Err(ConfigError::new("monitoring.underutilization_ticks", "must be >= 1"));
        }
        if self.monitoring.stale_after_ticks == 0 {
            return Err(ConfigError::new("monitoring.stale_after_ticks", "must be >= 1"));
        }
        positive(
            "monitoring.instance_power_ceiling",
            self.monitoring.instance_power_ceiling,
        )?;

        if self.catalog.is_empty() {
            return Err(ConfigError::new("catalog", "at least one instance type is required"));
        }
        for (index, spec) in self.catalog.iter().enumerate() {
            let key = |field: &str| format!("catalog[{}].{}", index, field);
            if spec.instance_type.trim().is_empty() {
                return Err(ConfigError::new(key("instance_type"), "must not be empty"));
            }
            positive(&key("cpu_capacity"), spec.cpu_capacity)?;
            parse_memory(&spec.memory_capacity)
                .map_err(|reason| ConfigError::new(key("memory_capacity"), reason))?;
            if !(spec.hourly_cost >= 0.0) {
                return Err(ConfigError::new(key("hourly_cost"), "must be >= 0"));
            }
            if !(spec.estimated_power_draw >= 0.0) {
                return Err(ConfigError::new(key("estimated_power_draw"), "must be >= 0"));
            }
            if spec.regions.is_empty() {
                return Err(ConfigError::new(key("regions"), "must list at least one region"));
            }
        }

        Ok(())
    }
}

fn positive(key: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::new(key, "must be a finite value > 0"))
    }
}
