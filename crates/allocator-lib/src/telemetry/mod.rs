//! Telemetry gateway
//!
//! Pulls energy readings and instance observations from the monitoring
//! collaborator, normalizes them into engine types and maintains the
//! snapshot store. A failed or timed-out refresh keeps the previous view.

mod source;
mod store;

pub use source::{parse_energy_log, JsonLinesTelemetrySource, TelemetrySource};
pub use store::{linear_regression_slope, EnergyStore};

use crate::error::TelemetryError;
use crate::inventory::Inventory;
use crate::models::{EnergySnapshot, InstanceStatus};
use crate::observability::EngineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one refresh
#[derive(Debug, Clone, Default)]
pub struct RefreshSummary {
    pub accepted: usize,
    pub discarded: usize,
    pub observed_instances: usize,
    /// Readings dropped because the instance terminated or went silent
    pub dropped: Vec<String>,
    /// One rollup per region with readings or rollup history
    pub rollups: Vec<EnergySnapshot>,
}

pub struct TelemetryGateway {
    source: Arc<dyn TelemetrySource>,
    store: Arc<EnergyStore>,
    timeout: Duration,
    /// Readings not refreshed within this window stop counting
    stale_after: Duration,
    metrics: EngineMetrics,
}

impl TelemetryGateway {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        store: Arc<EnergyStore>,
        timeout: Duration,
        stale_after: Duration,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            source,
            store,
            timeout,
            stale_after,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<EnergyStore> {
        &self.store
    }

    /// Readings the engine cannot reason about are dropped
    fn normalize(snapshot: EnergySnapshot) -> Option<EnergySnapshot> {
        if snapshot.is_rollup()
            || snapshot.instance_id.trim().is_empty()
            || snapshot.region.trim().is_empty()
            || !snapshot.power_draw.is_finite()
            || snapshot.power_draw < 0.0
            || !snapshot.carbon_intensity.is_finite()
            || snapshot.carbon_intensity < 0.0
        {
            return None;
        }
        Some(EnergySnapshot {
            instance_id: snapshot.instance_id.trim().to_string(),
            region: snapshot.region.trim().to_string(),
            ..snapshot
        })
    }

    /// Pull new readings and observations, update the store and inventory,
    /// and compute fresh regional rollups.
    pub async fn refresh(&self, inventory: &Inventory) -> Result<RefreshSummary, TelemetryError> {
        let fetched = tokio::time::timeout(self.timeout, self.source.fetch_snapshots())
            .await
            .map_err(|_| TelemetryError::Timeout(self.timeout))
            .and_then(|r| r);
        let snapshots = match fetched {
            Ok(snapshots) => snapshots,
            Err(e) => {
                self.metrics.inc_telemetry_errors();
                warn!(error = %e, "Energy telemetry refresh failed, keeping previous view");
                return Err(e);
            }
        };

        let mut summary = RefreshSummary::default();
        for snapshot in snapshots {
            match Self::normalize(snapshot) {
                Some(s) => {
                    if self.store.record(s) {
                        summary.accepted += 1;
                    }
                }
                None => summary.discarded += 1,
            }
        }

        match tokio::time::timeout(self.timeout, self.source.fetch_inventory()).await {
            Ok(Ok(observed)) => {
                summary.observed_instances = observed.len();
                for instance in observed {
                    inventory.reconcile_observed(instance);
                }
            }
            Ok(Err(e)) => {
                self.metrics.inc_telemetry_errors();
                warn!(error = %e, "Inventory observation failed");
            }
            Err(_) => {
                self.metrics.inc_telemetry_errors();
                warn!(timeout = ?self.timeout, "Inventory observation timed out");
            }
        }

        // a terminated instance draws nothing, whatever the exporter still says
        for reading in self.store.readings() {
            let terminated = inventory
                .get(&reading.instance_id)
                .map(|i| i.status == InstanceStatus::Terminated)
                .unwrap_or(false);
            if terminated && self.store.forget(&reading.instance_id) {
                summary.dropped.push(reading.instance_id);
            }
        }
        for instance_id in self.store.expire(self.stale_after) {
            debug!(instance_id = %instance_id, stale_after = ?self.stale_after, "Energy reading expired");
            summary.dropped.push(instance_id);
        }

        for region in self.store.known_regions() {
            if let Some(rollup) = self.store.current_rollup(&region) {
                self.store.push_rollup(&rollup);
                self.metrics
                    .set_region_energy(&region, rollup.power_draw, rollup.carbon_intensity);
                summary.rollups.push(rollup);
            }
        }

        debug!(
            accepted = summary.accepted,
            discarded = summary.discarded,
            dropped = summary.dropped.len(),
            regions = summary.rollups.len(),
            "Telemetry refreshed"
        );
        Ok(summary)
    }
}
