//! Provisioning executor
//!
//! Drives an accepted decision to completion against the cloud control
//! plane. Execution is idempotent per request id; transient failures are
//! retried; a partially provisioned instance is compensated and the decision
//! reported `failed`. An instance only becomes `active` after verification
//! and monitoring registration both succeed.

mod retry;

pub use retry::RetryPolicy;

use crate::catalog::PlacementCatalog;
use crate::error::{ExecutorError, InventoryError, ProvisionError};
use crate::inventory::Inventory;
use crate::models::{AllocationDecision, Instance, InstanceStatus, Outcome, Placement};
use crate::observability::{EngineMetrics, StructuredLogger};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cloud control plane collaborator
#[async_trait]
pub trait CloudControlPlane: Send + Sync {
    /// Create (or bind) an instance for the request; the request id is the
    /// idempotency token. Returns the instance id.
    async fn provision(&self, request_id: Uuid, placement: &Placement) -> Result<String, ProvisionError>;

    /// Post-provision health verification
    async fn verify(&self, instance_id: &str) -> Result<(), ProvisionError>;

    /// Attach the instance to energy and utilization monitoring
    async fn register_monitoring(&self, instance_id: &str) -> Result<(), ProvisionError>;

    async fn deprovision(&self, instance_id: &str) -> Result<(), ProvisionError>;
}

/// Terminal result of applying a decision
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub outcome: Outcome,
    pub instance_id: Option<String>,
    pub reason: Option<String>,
    /// Control plane attempts across all calls
    pub attempts: u32,
    pub compensated: bool,
}

/// Outcome already carried by a decision (non-accepted passthrough, or a
/// decision recorded before a restart)
impl From<&AllocationDecision> for ApplyOutcome {
    fn from(decision: &AllocationDecision) -> Self {
        Self {
            outcome: decision.outcome,
            instance_id: decision.instance_id.clone(),
            reason: decision.reason.clone(),
            attempts: 0,
            compensated: false,
        }
    }
}

impl ApplyOutcome {
    fn failed(reason: String, instance_id: Option<String>, attempts: u32, compensated: bool) -> Self {
        Self {
            outcome: Outcome::Failed,
            instance_id,
            reason: Some(reason),
            attempts,
            compensated,
        }
    }
}

type Execution = Arc<OnceCell<Result<ApplyOutcome, ExecutorError>>>;

pub struct ProvisioningExecutor {
    control_plane: Arc<dyn CloudControlPlane>,
    catalog: Arc<dyn PlacementCatalog>,
    inventory: Arc<Inventory>,
    policy: RetryPolicy,
    executions: DashMap<Uuid, Execution>,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl ProvisioningExecutor {
    pub fn new(
        control_plane: Arc<dyn CloudControlPlane>,
        catalog: Arc<dyn PlacementCatalog>,
        inventory: Arc<Inventory>,
        policy: RetryPolicy,
        metrics: EngineMetrics,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            control_plane,
            catalog,
            inventory,
            policy,
            executions: DashMap::new(),
            metrics,
            logger,
        }
    }

    /// Apply a decision. Concurrent and repeated applies for the same request
    /// id share one execution and return its outcome until it is released.
    pub async fn apply(&self, decision: &AllocationDecision) -> Result<ApplyOutcome, ExecutorError> {
        if decision.outcome != Outcome::Accepted {
            return Ok(ApplyOutcome::from(decision));
        }

        let cell = self
            .executions
            .entry(decision.request_id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        if cell.initialized() {
            debug!(request_id = %decision.request_id, "Decision already applied, returning prior outcome");
        }
        cell.get_or_init(|| self.execute(decision)).await.clone()
    }

    /// Drop a finished execution once its terminal decision is durable.
    /// Later applies for the request are answered from the decision log.
    pub fn release(&self, request_id: &Uuid) -> bool {
        self.executions
            .remove_if(request_id, |_, cell| cell.initialized())
            .is_some()
    }

    /// Executions still held, in flight or awaiting release
    pub fn tracked(&self) -> usize {
        self.executions.len()
    }

    async fn execute(&self, decision: &AllocationDecision) -> Result<ApplyOutcome, ExecutorError> {
        let request_id = decision.request_id;
        let placement = decision
            .placement
            .clone()
            .ok_or(ExecutorError::MissingPlacement(request_id))?;
        let reserved_draw = self
            .catalog
            .find(&placement)
            .map(|c| c.estimated_power_draw)
            .unwrap_or(0.0);

        let control_plane = self.control_plane.clone();
        let (provisioned, mut attempts) = self
            .policy
            .run("provision", &self.metrics, || {
                let control_plane = control_plane.clone();
                let placement = placement.clone();
                async move { control_plane.provision(request_id, &placement).await }
            })
            .await;

        let instance_id = match provisioned {
            Ok(id) => id,
            Err(e) => {
                warn!(request_id = %request_id, placement = %placement, error = %e, "Provisioning failed");
                return Ok(ApplyOutcome::failed(e.to_string(), None, attempts, false));
            }
        };

        let pending = Instance {
            id: instance_id.clone(),
            instance_type: placement.instance_type.clone(),
            region: placement.region.clone(),
            status: InstanceStatus::Pending,
            current_utilization: 0.0,
            request_id: Some(request_id),
            reserved_draw,
        };
        match self.inventory.insert(pending) {
            Ok(()) => {}
            // control plane handed back the instance it already bound to this request
            Err(InventoryError::Duplicate(_))
                if self
                    .inventory
                    .get(&instance_id)
                    .map(|i| i.request_id == Some(request_id))
                    .unwrap_or(false) => {}
            Err(e) => return Err(e.into()),
        }

        let (verified, verify_attempts) = self
            .policy
            .run("verify", &self.metrics, || {
                let control_plane = control_plane.clone();
                let instance_id = instance_id.clone();
                async move { control_plane.verify(&instance_id).await }
            })
            .await;
        attempts += verify_attempts;

        let hooked = match verified {
            Ok(()) => {
                let (registered, register_attempts) = self
                    .policy
                    .run("register_monitoring", &self.metrics, || {
                        let control_plane = control_plane.clone();
                        let instance_id = instance_id.clone();
                        async move { control_plane.register_monitoring(&instance_id).await }
                    })
                    .await;
                attempts += register_attempts;
                registered
            }
            Err(e) => Err(e),
        };

        if let Err(cause) = hooked {
            let compensate_attempts = self.compensate(request_id, &instance_id, &cause).await?;
            attempts += compensate_attempts;
            return Ok(ApplyOutcome::failed(
                format!("post-provision step failed: {}", cause),
                Some(instance_id),
                attempts,
                true,
            ));
        }

        self.inventory.advance(&instance_id, InstanceStatus::Active)?;
        info!(
            request_id = %request_id,
            instance_id = %instance_id,
            placement = %placement,
            attempts = attempts,
            "Instance provisioned and active"
        );
        Ok(ApplyOutcome {
            outcome: Outcome::Accepted,
            instance_id: Some(instance_id),
            reason: None,
            attempts,
            compensated: false,
        })
    }

    /// Roll back a partially provisioned instance: pending -> terminated
    async fn compensate(&self, request_id: Uuid, instance_id: &str, cause: &ProvisionError) -> Result<u32, ExecutorError> {
        let (result, attempts) = self.deprovision_with_retry(instance_id).await;
        match result {
            Ok(()) => {
                self.inventory
                    .advance(instance_id, InstanceStatus::Terminated)?;
                self.metrics.inc_compensation(true);
                self.logger
                    .log_compensation(request_id, instance_id, true, &cause.to_string());
                Ok(attempts)
            }
            Err(source) => {
                self.metrics.inc_compensation(false);
                self.logger
                    .log_compensation(request_id, instance_id, false, &source.to_string());
                Err(ExecutorError::CompensationFailed {
                    instance_id: instance_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Deprovision under the retry policy
    pub async fn deprovision_with_retry(&self, instance_id: &str) -> (Result<(), ProvisionError>, u32) {
        let control_plane = self.control_plane.clone();
        self.policy
            .run("deprovision", &self.metrics, || {
                let control_plane = control_plane.clone();
                let instance_id = instance_id.to_string();
                async move { control_plane.deprovision(&instance_id).await }
            })
            .await
    }

    /// Drain and remove an instance (re-optimization path)
    pub async fn retire(&self, instance_id: &str) -> Result<(), ExecutorError> {
        let instance = self
            .inventory
            .get(instance_id)
            .ok_or_else(|| InventoryError::UnknownInstance(instance_id.to_string()))?;
        if instance.status == InstanceStatus::Active {
            self.inventory.advance(instance_id, InstanceStatus::Draining)?;
        }

        let (result, _) = self.deprovision_with_retry(instance_id).await;
        match result {
            Ok(()) => {
                self.inventory
                    .advance(instance_id, InstanceStatus::Terminated)?;
                Ok(())
            }
            Err(source) => Err(ExecutorError::DeprovisionFailed {
                instance_id: instance_id.to_string(),
                source,
            }),
        }
    }
}
