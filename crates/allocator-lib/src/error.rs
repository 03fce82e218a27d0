//! Error taxonomy for the allocation engine

use crate::models::InstanceStatus;
use crate::supervisor::SystemState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Single field violation of an inbound request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Malformed request; the request never enters processing
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("invalid allocation request: {}", join_fields(.errors))]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

fn join_fields(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced synchronously by the intake call
#[derive(Debug, Clone, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("allocation queue is full")]
    QueueFull,
    #[error("allocation queue is closed")]
    Closed,
}

/// Why the prediction collaborator could not supply a usable forecast
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForecastError {
    #[error("forecast collaborator timed out after {0:?}")]
    Timeout(Duration),
    #[error("forecast collaborator failed: {0}")]
    Collaborator(String),
    #[error("forecast is stale ({age_secs}s old, validity {validity_secs}s)")]
    Stale { age_secs: i64, validity_secs: u64 },
}

/// Telemetry collaborator could not be read
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    #[error("telemetry fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("telemetry source failed: {0}")]
    Source(String),
}

/// Projected regional draw is over the admissible ceiling
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("energy threshold exceeded in {region}: projected {projected:.1}W, ceiling {ceiling:.1}W{}", mode_suffix(.over_threshold_mode))]
pub struct EnergyThresholdExceeded {
    pub region: String,
    pub projected: f64,
    pub ceiling: f64,
    pub over_threshold_mode: bool,
}

fn mode_suffix(over_threshold_mode: &bool) -> &'static str {
    if *over_threshold_mode {
        " (region over threshold)"
    } else {
        ""
    }
}

/// Provisioning failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Timeouts, throttling; retried with backoff
    Transient,
    /// Authorization, quota; never retried
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure reported by the cloud control plane
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} provisioning failure: {message}")]
pub struct ProvisionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ProvisionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Attempted transition violates the state graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal state transition {from} -> {to}")]
pub struct StateConflict {
    pub from: SystemState,
    pub to: SystemState,
}

/// Inventory consistency violations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InventoryError {
    #[error("unknown instance {0}")]
    UnknownInstance(String),
    #[error("instance {0} already exists")]
    Duplicate(String),
    #[error("instance {instance_id} cannot move {from} -> {to}")]
    IllegalStatusTransition {
        instance_id: String,
        from: InstanceStatus,
        to: InstanceStatus,
    },
}

/// Errors the provisioning executor escalates instead of absorbing
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    #[error("accepted decision {0} carries no placement")]
    MissingPlacement(Uuid),
    #[error("compensating deprovision of {instance_id} failed: {source}")]
    CompensationFailed {
        instance_id: String,
        #[source]
        source: ProvisionError,
    },
    #[error("deprovision of {instance_id} failed: {source}")]
    DeprovisionFailed {
        instance_id: String,
        #[source]
        source: ProvisionError,
    },
    #[error(transparent)]
    Inventory(#[from] InventoryError),
}

/// Decision log and snapshot persistence failures
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode or decode persisted state: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("decision log chain broken at line {line}: {reason}")]
    ChainBroken { line: usize, reason: String },
    #[error("request {0} already has a terminal decision")]
    DuplicateTerminal(Uuid),
}

impl PersistenceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Invalid engine configuration, rejected at startup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration '{key}': {reason}")]
pub struct ConfigError {
    pub key: String,
    pub reason: String,
}

impl ConfigError {
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Umbrella error for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error("forecast unavailable: {0}")]
    ForecastUnavailable(#[from] ForecastError),
    #[error(transparent)]
    EnergyThresholdExceeded(#[from] EnergyThresholdExceeded),
    #[error("provisioning failure: {0}")]
    Provisioning(#[from] ProvisionError),
    #[error(transparent)]
    StateConflict(#[from] StateConflict),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
