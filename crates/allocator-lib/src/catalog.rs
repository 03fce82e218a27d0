//! Candidate placement source
//!
//! Capacity, hourly cost and estimated power draw are opaque catalog inputs;
//! the engine never derives them.

use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::intake::parse_memory;
use crate::models::{PlacementCandidate, Placement};

/// Source of candidate placements (instance type x region)
pub trait PlacementCatalog: Send + Sync {
    /// All candidates in discovery order. `carbon_intensity` carries the
    /// configured regional factor; the engine overlays live telemetry.
    fn candidates(&self) -> Vec<PlacementCandidate>;

    /// Look up one candidate by placement
    fn find(&self, placement: &Placement) -> Option<PlacementCandidate> {
        self.candidates()
            .into_iter()
            .find(|c| c.instance_type == placement.instance_type && c.region == placement.region)
    }
}

/// Catalog built once from configuration
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    candidates: Vec<PlacementCandidate>,
}

impl StaticCatalog {
    pub fn new(candidates: Vec<PlacementCandidate>) -> Self {
        let candidates = candidates
            .into_iter()
            .enumerate()
            .map(|(i, mut c)| {
                c.discovery_order = i;
                c
            })
            .collect();
        Self { candidates }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let mut candidates = Vec::new();
        for (index, spec) in config.catalog.iter().enumerate() {
            let memory_capacity = parse_memory(&spec.memory_capacity).map_err(|reason| {
                ConfigError::new(format!("catalog[{}].memory_capacity", index), reason)
            })?;
            for region in &spec.regions {
                candidates.push(PlacementCandidate {
                    instance_type: spec.instance_type.clone(),
                    region: region.clone(),
                    cpu_capacity: spec.cpu_capacity,
                    memory_capacity,
                    hourly_cost: spec.hourly_cost,
                    estimated_power_draw: spec.estimated_power_draw,
                    carbon_intensity: config.region_profile(region).carbon_intensity,
                    discovery_order: 0,
                });
            }
        }
        Ok(Self::new(candidates))
    }

    /// Distinct regions in discovery order
    pub fn regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = Vec::new();
        for candidate in &self.candidates {
            if !regions.contains(&candidate.region) {
                regions.push(candidate.region.clone());
            }
        }
        regions
    }
}

impl PlacementCatalog for StaticCatalog {
    fn candidates(&self) -> Vec<PlacementCandidate> {
        self.candidates.clone()
    }
}
