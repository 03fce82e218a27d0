//! Dry-run cloud control plane
//!
//! Records provisioning in memory and logs what a real backend would do.
//! Provisioning is idempotent per request: a retried call returns the
//! instance already created for it.

use allocator_lib::error::ProvisionError;
use allocator_lib::executor::CloudControlPlane;
use allocator_lib::models::Placement;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct DryRunControlPlane {
    /// request id -> instance id
    instances: Mutex<HashMap<Uuid, String>>,
    registered: Mutex<HashSet<String>>,
}

impl DryRunControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn live_instances(&self) -> usize {
        self.instances.lock().await.len()
    }
}

#[async_trait]
impl CloudControlPlane for DryRunControlPlane {
    async fn provision(&self, request_id: Uuid, placement: &Placement) -> Result<String, ProvisionError> {
        let mut instances = self.instances.lock().await;
        let instance_id = instances
            .entry(request_id)
            .or_insert_with(|| {
                let suffix = request_id.simple().to_string();
                format!("dry-{}-{}", placement.region, &suffix[..12])
            })
            .clone();
        info!(
            request_id = %request_id,
            instance_id = %instance_id,
            placement = %placement,
            "Dry run: instance provisioned"
        );
        Ok(instance_id)
    }

    async fn verify(&self, instance_id: &str) -> Result<(), ProvisionError> {
        let known = self
            .instances
            .lock()
            .await
            .values()
            .any(|id| id == instance_id);
        if known {
            Ok(())
        } else {
            Err(ProvisionError::permanent(format!(
                "instance {} does not exist",
                instance_id
            )))
        }
    }

    async fn register_monitoring(&self, instance_id: &str) -> Result<(), ProvisionError> {
        self.registered.lock().await.insert(instance_id.to_string());
        info!(instance_id = %instance_id, "Dry run: monitoring hooks registered");
        Ok(())
    }

    async fn deprovision(&self, instance_id: &str) -> Result<(), ProvisionError> {
        self.instances.lock().await.retain(|_, id| id != instance_id);
        self.registered.lock().await.remove(instance_id);
        info!(instance_id = %instance_id, "Dry run: instance deprovisioned");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placement() -> Placement {
        Placement {
            instance_type: "m5.large".into(),
            region: "us-east-1".into(),
        }
    }

    #[tokio::test]
    async fn test_provision_is_idempotent_per_request() {
        let control_plane = DryRunControlPlane::new();
        let request_id = Uuid::new_v4();

        let first = control_plane.provision(request_id, &placement()).await.unwrap();
        let second = control_plane.provision(request_id, &placement()).await.unwrap();

        assert_eq!(first, second);
        assert!(first.starts_with("dry-us-east-1-"));
        assert_eq!(control_plane.live_instances().await, 1);
    }

    #[tokio::test]
    async fn test_deprovisioned_instance_fails_verification() {
        let control_plane = DryRunControlPlane::new();
        let instance_id = control_plane
            .provision(Uuid::new_v4(), &placement())
            .await
            .unwrap();
        control_plane.verify(&instance_id).await.unwrap();

        control_plane.deprovision(&instance_id).await.unwrap();
        // deprovision is idempotent
        control_plane.deprovision(&instance_id).await.unwrap();

        let err = control_plane.verify(&instance_id).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(control_plane.live_instances().await, 0);
    }
}
