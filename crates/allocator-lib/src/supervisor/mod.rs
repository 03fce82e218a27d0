//! Lifecycle supervision
//!
//! Every allocation carries its own lifecycle keyed by request id. Transitions
//! are validated against a fixed edge set; the process-wide [`SystemState`] is
//! the summary over all tracked lifecycles. The supervisor is the only place
//! that moves a lifecycle into or out of `Error`.

use crate::error::StateConflict;
use crate::observability::{EngineMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of an allocation (and, summarized, of the process)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Idle,
    Processing,
    ResourceAllocation,
    MonitoringPhase,
    Optimization,
    Error,
    /// Terminal exit of `Error`: recovery abandoned, manual intervention required
    Halted,
}

impl SystemState {
    pub const ALL: [SystemState; 7] = [
        SystemState::Idle,
        SystemState::Processing,
        SystemState::ResourceAllocation,
        SystemState::MonitoringPhase,
        SystemState::Optimization,
        SystemState::Error,
        SystemState::Halted,
    ];

    /// Whether `self -> to` is an edge of the lifecycle graph
    pub fn can_transition_to(self, to: SystemState) -> bool {
        use SystemState::*;
        match (self, to) {
            (Halted, _) => false,
            (Error, Error) => false,
            (_, Error) => true,
            (Idle, Processing) => true,
            (Processing, ResourceAllocation) | (Processing, Idle) => true,
            (ResourceAllocation, MonitoringPhase) => true,
            (MonitoringPhase, Optimization) | (MonitoringPhase, Idle) => true,
            (Optimization, MonitoringPhase) => true,
            (Error, Idle) | (Error, Halted) => true,
            _ => false,
        }
    }

    /// Rank used to summarize lifecycles into one process-wide state
    fn precedence(self) -> u8 {
        match self {
            SystemState::Idle | SystemState::Halted => 0,
            SystemState::MonitoringPhase => 1,
            SystemState::Processing => 2,
            SystemState::ResourceAllocation => 3,
            SystemState::Optimization => 4,
            SystemState::Error => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Idle => "idle",
            SystemState::Processing => "processing",
            SystemState::ResourceAllocation => "resource_allocation",
            SystemState::MonitoringPhase => "monitoring_phase",
            SystemState::Optimization => "optimization",
            SystemState::Error => "error",
            SystemState::Halted => "halted",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracked lifecycle of one allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub request_id: Uuid,
    pub state: SystemState,
    pub entered_at: DateTime<Utc>,
    /// Instance bound once provisioning succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub recovery_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Lifecycle {
    fn idle(request_id: Uuid) -> Self {
        Self {
            request_id,
            state: SystemState::Idle,
            entered_at: Utc::now(),
            instance_id: None,
            recovery_attempts: 0,
            last_error: None,
        }
    }

    fn enter(&mut self, state: SystemState) {
        self.state = state;
        self.entered_at = Utc::now();
    }
}

/// Owner of all allocation lifecycles
#[derive(Debug)]
pub struct Supervisor {
    lifecycles: DashMap<Uuid, Lifecycle>,
    max_recovery_attempts: u32,
    logger: StructuredLogger,
    metrics: EngineMetrics,
}

impl Supervisor {
    pub fn new(max_recovery_attempts: u32, logger: StructuredLogger, metrics: EngineMetrics) -> Self {
        Self {
            lifecycles: DashMap::new(),
            max_recovery_attempts,
            logger,
            metrics,
        }
    }

    /// Current state of one lifecycle; untracked ids are idle
    pub fn state(&self, request_id: &Uuid) -> SystemState {
        self.lifecycles
            .get(request_id)
            .map(|l| l.state)
            .unwrap_or(SystemState::Idle)
    }

    pub fn lifecycle(&self, request_id: &Uuid) -> Option<Lifecycle> {
        self.lifecycles.get(request_id).map(|l| l.clone())
    }

    /// Process-wide state: highest-precedence state over all lifecycles
    pub fn system_state(&self) -> SystemState {
        self.lifecycles
            .iter()
            .map(|l| l.state)
            .max_by_key(|s| s.precedence())
            .filter(|s| s.precedence() > 0)
            .unwrap_or(SystemState::Idle)
    }

    /// Move a lifecycle along one edge, returning the state it left.
    ///
    /// An illegal edge is logged, routes the lifecycle to `Error` and is
    /// reported as [`StateConflict`].
    pub fn transition(&self, request_id: Uuid, to: SystemState) -> Result<SystemState, StateConflict> {
        let result = {
            let mut lifecycle = self
                .lifecycles
                .entry(request_id)
                .or_insert_with(|| Lifecycle::idle(request_id));
            let from = lifecycle.state;
            if from.can_transition_to(to) {
                lifecycle.enter(to);
                if to == SystemState::Idle {
                    lifecycle.recovery_attempts = 0;
                }
                Ok(from)
            } else {
                let conflict = StateConflict { from, to };
                if from.can_transition_to(SystemState::Error) {
                    lifecycle.enter(SystemState::Error);
                    lifecycle.last_error = Some(conflict.to_string());
                }
                Err(conflict)
            }
        };
        self.release_idle(&request_id);

        match result {
            Ok(from) => self.logger.log_state_transition(request_id, from, to),
            Err(conflict) => {
                self.metrics.inc_state_conflicts();
                self.logger
                    .log_state_conflict(request_id, conflict.from, conflict.to);
            }
        }
        self.publish();
        result
    }

    /// Route a lifecycle to `Error` because a component could not keep
    /// inventory or energy accounting consistent
    pub fn escalate(&self, request_id: Uuid, reason: impl Into<String>) -> SystemState {
        let reason = reason.into();
        let from = {
            let mut lifecycle = self
                .lifecycles
                .entry(request_id)
                .or_insert_with(|| Lifecycle::idle(request_id));
            let from = lifecycle.state;
            if from.can_transition_to(SystemState::Error) {
                lifecycle.enter(SystemState::Error);
            }
            lifecycle.last_error = Some(reason.clone());
            from
        };
        self.logger.log_escalation(request_id, from, &reason);
        self.publish();
        self.state(&request_id)
    }

    /// Attempt recovery of an errored lifecycle.
    ///
    /// `reconciled` reports whether inventory was reconciled for it. Failed
    /// attempts are counted; after `max_recovery_attempts` the lifecycle is halted.
    pub fn recover(&self, request_id: Uuid, reconciled: bool) -> Result<SystemState, StateConflict> {
        let (outcome, attempts) = {
            let mut lifecycle = match self.lifecycles.get_mut(&request_id) {
                Some(l) => l,
                None => {
                    return Err(StateConflict {
                        from: SystemState::Idle,
                        to: SystemState::Idle,
                    })
                }
            };
            if lifecycle.state != SystemState::Error {
                return Err(StateConflict {
                    from: lifecycle.state,
                    to: SystemState::Idle,
                });
            }
            if reconciled {
                lifecycle.enter(SystemState::Idle);
            } else {
                lifecycle.recovery_attempts += 1;
                if lifecycle.recovery_attempts >= self.max_recovery_attempts {
                    lifecycle.enter(SystemState::Halted);
                }
            }
            (lifecycle.state, lifecycle.recovery_attempts)
        };
        self.release_idle(&request_id);

        self.logger.log_recovery(request_id, outcome, attempts);
        self.publish();
        Ok(outcome)
    }

    /// Bind the provisioned instance to a lifecycle
    pub fn bind_instance(&self, request_id: Uuid, instance_id: impl Into<String>) {
        if let Some(mut lifecycle) = self.lifecycles.get_mut(&request_id) {
            lifecycle.instance_id = Some(instance_id.into());
        }
    }

    /// Lifecycle owning a given instance
    pub fn owner_of(&self, instance_id: &str) -> Option<Uuid> {
        self.lifecycles
            .iter()
            .find(|l| l.instance_id.as_deref() == Some(instance_id))
            .map(|l| l.request_id)
    }

    /// All tracked lifecycles, oldest first
    pub fn lifecycles(&self) -> Vec<Lifecycle> {
        let mut all: Vec<Lifecycle> = self.lifecycles.iter().map(|l| l.clone()).collect();
        all.sort_by_key(|l| l.entered_at);
        all
    }

    pub fn in_state(&self, state: SystemState) -> Vec<Lifecycle> {
        self.lifecycles()
            .into_iter()
            .filter(|l| l.state == state)
            .collect()
    }

    pub fn counts(&self) -> HashMap<SystemState, usize> {
        let mut counts = HashMap::new();
        for lifecycle in self.lifecycles.iter() {
            *counts.entry(lifecycle.state).or_insert(0) += 1;
        }
        counts
    }

    /// Replace tracked lifecycles with persisted ones (restart path)
    pub fn restore(&self, lifecycles: Vec<Lifecycle>) {
        self.lifecycles.clear();
        for lifecycle in lifecycles {
            if lifecycle.state != SystemState::Idle {
                self.lifecycles.insert(lifecycle.request_id, lifecycle);
            }
        }
        self.publish();
    }

    /// Idle lifecycles carry no work and are not tracked
    fn release_idle(&self, request_id: &Uuid) {
        self.lifecycles
            .remove_if(request_id, |_, l| l.state == SystemState::Idle);
    }

    fn publish(&self) {
        self.metrics.set_lifecycles(&self.counts());
    }
}
