//! Shared instance inventory
//!
//! Instances only move forward through their status graph. Region locks
//! serialize energy gate evaluation and provisioning within a region while
//! leaving other regions free to proceed.

use crate::error::InventoryError;
use crate::models::{Instance, InstanceStatus};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
pub struct Inventory {
    instances: DashMap<String, Instance>,
    region_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialization lock for a region. Held across gate re-check and apply.
    pub async fn lock_region(&self, region: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .region_locks
            .entry(region.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn insert(&self, instance: Instance) -> Result<(), InventoryError> {
        match self.instances.entry(instance.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(InventoryError::Duplicate(instance.id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(instance_id = %instance.id, status = %instance.status, "Instance added to inventory");
                slot.insert(instance);
                Ok(())
            }
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<Instance> {
        self.instances.get(instance_id).map(|i| i.clone())
    }

    /// Move an instance forward, returning its previous status
    pub fn advance(&self, instance_id: &str, to: InstanceStatus) -> Result<InstanceStatus, InventoryError> {
        let mut instance = self
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| InventoryError::UnknownInstance(instance_id.to_string()))?;
        let from = instance.status;
        if !from.can_advance_to(to) {
            return Err(InventoryError::IllegalStatusTransition {
                instance_id: instance_id.to_string(),
                from,
                to,
            });
        }
        instance.status = to;
        debug!(instance_id = %instance_id, from = %from, to = %to, "Instance status advanced");
        Ok(from)
    }

    /// Merge an externally observed instance: utilization is taken as-is,
    /// status only if it moves forward. Unknown instances are added.
    pub fn reconcile_observed(&self, observed: Instance) {
        match self.instances.get_mut(&observed.id) {
            Some(mut known) => {
                known.current_utilization = observed.current_utilization.clamp(0.0, 1.0);
                if known.status.can_advance_to(observed.status) {
                    known.status = observed.status;
                }
            }
            None => {
                self.instances.insert(observed.id.clone(), observed);
            }
        }
    }

    /// All instances ordered by id
    pub fn list(&self) -> Vec<Instance> {
        let mut all: Vec<Instance> = self.instances.iter().map(|i| i.clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn in_status(&self, status: InstanceStatus) -> Vec<Instance> {
        self.list()
            .into_iter()
            .filter(|i| i.status == status)
            .collect()
    }

    /// Instances in a region that still hold capacity (not terminated)
    pub fn live_in_region(&self, region: &str) -> Vec<Instance> {
        self.list()
            .into_iter()
            .filter(|i| i.region == region && i.status != InstanceStatus::Terminated)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Replace contents with a persisted set (restart path)
    pub fn restore(&self, instances: Vec<Instance>) {
        self.instances.clear();
        for instance in instances {
            self.instances.insert(instance.id.clone(), instance);
        }
    }
}
