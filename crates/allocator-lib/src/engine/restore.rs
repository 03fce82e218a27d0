//! Restart recovery
//!
//! Rebuilds inventory and supervisor state from the last snapshot and the
//! decision log, then settles allocations that were in flight at the crash.

use super::AllocationEngine;
use crate::error::{EngineError, StateConflict};
use crate::models::{AllocationDecision, InstanceStatus, Outcome, Placement};
use crate::supervisor::{Lifecycle, SystemState};
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What restart recovery found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub instances: usize,
    pub lifecycles: usize,
    /// Allocations put back under monitoring
    pub resumed: usize,
    /// In-flight allocations settled against the inventory
    pub reconciled: usize,
    /// Pending instances deprovisioned
    pub compensated: usize,
    /// Requests closed with a failed decision because the restart lost them
    pub interrupted: usize,
    /// Allocations left in Error for the monitoring tick to recover
    pub errored: usize,
}

const INTERRUPTED: &str = "interrupted by restart before a terminal decision";

/// The supervisor has already logged and counted any conflict
fn settle(request_id: Uuid, moved: Result<SystemState, StateConflict>) {
    if let Err(conflict) = moved {
        debug!(request_id = %request_id, error = %conflict, "Restored lifecycle not settled");
    }
}

impl AllocationEngine {
    /// Restore persisted state. Call once, before `run`.
    pub async fn restore(&self) -> Result<RestoreReport, EngineError> {
        let inner = &self.inner;
        let mut report = RestoreReport::default();

        if let Some(snapshot) = inner.snapshots.load()? {
            report.instances = snapshot.instances.len();
            inner.inventory.restore(snapshot.instances);
            inner.supervisor.restore(snapshot.lifecycles);
            report.lifecycles = inner.supervisor.lifecycles().len();

            for lifecycle in inner.supervisor.lifecycles() {
                let request_id = lifecycle.request_id;
                match lifecycle.state {
                    SystemState::Processing => {
                        self.close_if_open(request_id, &mut report).await;
                        settle(request_id, inner.supervisor.transition(request_id, SystemState::Idle));
                        report.reconciled += 1;
                    }
                    SystemState::ResourceAllocation => {
                        self.reconcile_allocation(&lifecycle, &mut report).await;
                    }
                    SystemState::MonitoringPhase => report.resumed += 1,
                    SystemState::Optimization => {
                        settle(
                            request_id,
                            inner
                                .supervisor
                                .transition(request_id, SystemState::MonitoringPhase),
                        );
                        report.resumed += 1;
                    }
                    SystemState::Error => report.errored += 1,
                    SystemState::Idle | SystemState::Halted => {}
                }
            }
        }

        // deferred requests were waiting in the in-memory queue
        for deferred in inner.decisions.pending_deferrals().await {
            self.close_if_open(deferred.request_id, &mut report).await;
        }

        self.sync_health().await;
        info!(
            instances = report.instances,
            lifecycles = report.lifecycles,
            resumed = report.resumed,
            reconciled = report.reconciled,
            compensated = report.compensated,
            interrupted = report.interrupted,
            errored = report.errored,
            "Engine state restored"
        );
        Ok(report)
    }

    /// Settle an allocation that was provisioning when the process stopped
    async fn reconcile_allocation(&self, lifecycle: &Lifecycle, report: &mut RestoreReport) {
        let inner = &self.inner;
        let request_id = lifecycle.request_id;
        let bound = inner
            .inventory
            .list()
            .into_iter()
            .find(|i| i.request_id == Some(request_id));

        match bound {
            Some(instance) if instance.status == InstanceStatus::Active => {
                inner.supervisor.bind_instance(request_id, instance.id.clone());
                settle(
                    request_id,
                    inner
                        .supervisor
                        .transition(request_id, SystemState::MonitoringPhase),
                );
                if inner.decisions.terminal(&request_id).await.is_none() {
                    let decision = AllocationDecision {
                        request_id,
                        placement: Some(Placement {
                            instance_type: instance.instance_type.clone(),
                            region: instance.region.clone(),
                        }),
                        outcome: Outcome::Accepted,
                        score: 0.0,
                        projected_energy_cost: None,
                        decided_at: Utc::now(),
                        reason: Some("provisioning completed before restart".into()),
                        attempt: 0,
                        critical_override: false,
                        instance_id: Some(instance.id.clone()),
                    };
                    self.record(&decision).await;
                }
                report.reconciled += 1;
            }
            Some(instance) if instance.status == InstanceStatus::Pending => {
                inner.supervisor.escalate(
                    request_id,
                    format!("instance {} left pending by restart", instance.id),
                );
                let (result, _) = inner.executor.deprovision_with_retry(&instance.id).await;
                match result {
                    Ok(()) => {
                        if let Err(e) = inner.inventory.advance(&instance.id, InstanceStatus::Terminated) {
                            warn!(instance_id = %instance.id, error = %e, "Could not mark instance terminated");
                        }
                        settle(request_id, inner.supervisor.recover(request_id, true));
                        report.compensated += 1;
                    }
                    Err(e) => {
                        warn!(
                            request_id = %request_id,
                            instance_id = %instance.id,
                            error = %e,
                            "Deprovision of pending instance failed, leaving allocation in error"
                        );
                        inner.supervisor.bind_instance(request_id, instance.id.clone());
                        settle(request_id, inner.supervisor.recover(request_id, false));
                        report.errored += 1;
                    }
                }
                self.close_if_open(request_id, report).await;
            }
            _ => {
                // nothing was created, or it is already gone
                inner
                    .supervisor
                    .escalate(request_id, "allocation interrupted by restart");
                settle(request_id, inner.supervisor.recover(request_id, true));
                self.close_if_open(request_id, report).await;
                report.reconciled += 1;
            }
        }
    }

    /// Record a failed decision for a request that never reached a terminal one
    async fn close_if_open(&self, request_id: Uuid, report: &mut RestoreReport) {
        if self.inner.decisions.terminal(&request_id).await.is_some() {
            return;
        }
        let decision = AllocationDecision::unplaced(request_id, Outcome::Failed, INTERRUPTED);
        self.record(&decision).await;
        self.inner.metrics.record_decision(decision.outcome.as_str(), 0.0);
        warn!(request_id = %request_id, "Request lost by restart, recorded as failed");
        report.interrupted += 1;
    }
}
