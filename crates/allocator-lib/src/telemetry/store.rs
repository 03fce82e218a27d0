//! Latest energy readings and regional rollup history

use crate::models::{EnergySnapshot, RegionSustainability};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Least-squares slope over evenly spaced samples
pub fn linear_regression_slope(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let sum_x: f64 = (0..values.len()).map(|i| i as f64).sum();
    let sum_y: f64 = values.iter().sum();
    let sum_xy: f64 = values.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
    let sum_x2: f64 = (0..values.len()).map(|i| (i as f64).powi(2)).sum();
    let denom = n * sum_x2 - sum_x.powi(2);
    if denom.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denom
}

/// Newest reading of one instance with its local receive time
#[derive(Debug, Clone)]
struct Reading {
    snapshot: EnergySnapshot,
    received_at: Instant,
}

/// Rollup history of one region
#[derive(Debug, Default)]
struct RegionHistory {
    draws: VecDeque<f64>,
    carbon_intensity: f64,
}

/// Snapshot store shared by the gateway, the monitoring tick and the query interfaces
#[derive(Debug)]
pub struct EnergyStore {
    latest: DashMap<String, Reading>,
    rollups: DashMap<String, RegionHistory>,
    trend_window: usize,
}

impl EnergyStore {
    pub fn new(trend_window: usize) -> Self {
        Self {
            latest: DashMap::new(),
            rollups: DashMap::new(),
            trend_window: trend_window.max(2),
        }
    }

    /// Keep the newest reading per instance; older readings are ignored
    pub fn record(&self, snapshot: EnergySnapshot) -> bool {
        let received_at = Instant::now();
        match self.latest.get_mut(&snapshot.instance_id) {
            Some(mut current) => {
                if snapshot.observed_at >= current.snapshot.observed_at {
                    *current = Reading {
                        snapshot,
                        received_at,
                    };
                    true
                } else {
                    false
                }
            }
            None => {
                self.latest.insert(
                    snapshot.instance_id.clone(),
                    Reading {
                        snapshot,
                        received_at,
                    },
                );
                true
            }
        }
    }

    pub fn latest(&self, instance_id: &str) -> Option<EnergySnapshot> {
        self.latest.get(instance_id).map(|r| r.snapshot.clone())
    }

    /// All current per-instance readings, ordered by instance id
    pub fn readings(&self) -> Vec<EnergySnapshot> {
        let mut readings: Vec<EnergySnapshot> =
            self.latest.iter().map(|r| r.snapshot.clone()).collect();
        readings.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        readings
    }

    /// Drop an instance's reading once it no longer draws power
    pub fn forget(&self, instance_id: &str) -> bool {
        self.latest.remove(instance_id).is_some()
    }

    /// Drop readings not refreshed within `max_age`, returning their instance ids
    pub fn expire(&self, max_age: Duration) -> Vec<String> {
        let now = Instant::now();
        let mut expired: Vec<String> = self
            .latest
            .iter()
            .filter(|r| now.duration_since(r.received_at) > max_age)
            .map(|r| r.key().clone())
            .collect();
        expired.sort();
        for instance_id in &expired {
            self.latest.remove(instance_id);
        }
        expired
    }

    pub fn in_region(&self, region: &str) -> Vec<EnergySnapshot> {
        self.latest
            .iter()
            .filter(|r| r.snapshot.region == region)
            .map(|r| r.snapshot.clone())
            .collect()
    }

    /// Regions with at least one reading, sorted
    pub fn regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self
            .latest
            .iter()
            .map(|r| r.snapshot.region.clone())
            .collect();
        regions.sort();
        regions.dedup();
        regions
    }

    /// Regions with readings or with rollup history, sorted
    pub fn known_regions(&self) -> Vec<String> {
        let mut regions = self.regions();
        regions.extend(self.rollups.iter().map(|h| h.key().clone()));
        regions.sort();
        regions.dedup();
        regions
    }

    pub fn region_rollup(&self, region: &str) -> Option<EnergySnapshot> {
        EnergySnapshot::region_rollup(region, &self.in_region(region))
    }

    /// Rollup for the next gate observation. A region whose readings have
    /// all gone reads as zero draw at its last known carbon intensity.
    pub fn current_rollup(&self, region: &str) -> Option<EnergySnapshot> {
        if let Some(rollup) = self.region_rollup(region) {
            return Some(rollup);
        }
        let history = self.rollups.get(region)?;
        Some(EnergySnapshot {
            instance_id: format!("{}{}", EnergySnapshot::ROLLUP_PREFIX, region),
            region: region.to_string(),
            power_draw: 0.0,
            carbon_intensity: history.carbon_intensity,
            observed_at: Utc::now(),
        })
    }

    /// Append a rollup to the region's bounded trend history
    pub fn push_rollup(&self, rollup: &EnergySnapshot) {
        let mut history = self.rollups.entry(rollup.region.clone()).or_default();
        history.draws.push_back(rollup.power_draw);
        history.carbon_intensity = rollup.carbon_intensity;
        while history.draws.len() > self.trend_window {
            history.draws.pop_front();
        }
    }

    /// Watts per tick over the recent rollups
    pub fn trend(&self, region: &str) -> f64 {
        self.rollups
            .get(region)
            .map(|h| linear_regression_slope(&h.draws.iter().copied().collect::<Vec<_>>()))
            .unwrap_or(0.0)
    }

    /// Aggregated sustainability view; the configured intensity is used
    /// when the region has no readings
    pub fn sustainability(
        &self,
        region: &str,
        configured_carbon_intensity: f64,
        renewable_percentage: f64,
    ) -> RegionSustainability {
        let readings = self.in_region(region);
        let samples = readings.len();
        let power_draw = readings.iter().map(|s| s.power_draw).sum();
        let carbon_intensity = if samples == 0 {
            configured_carbon_intensity
        } else {
            readings.iter().map(|s| s.carbon_intensity).sum::<f64>() / samples as f64
        };

        RegionSustainability {
            region: region.to_string(),
            carbon_intensity,
            renewable_percentage,
            power_draw,
            energy_trend: self.trend(region),
            samples,
        }
    }
}
