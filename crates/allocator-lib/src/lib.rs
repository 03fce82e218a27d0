//! Energy-aware allocation engine
//!
//! This crate provides the core functionality for:
//! - Request intake and validation
//! - Demand forecasting behind a prediction collaborator
//! - Regional energy gating with hysteresis
//! - Carbon and cost aware placement scoring
//! - Idempotent provisioning with compensation
//! - Lifecycle supervision, monitoring and restart recovery
//! - Health checks and observability

pub mod catalog;
pub mod config;
pub mod decision_log;
pub mod engine;
pub mod error;
pub mod executor;
pub mod forecast;
pub mod gate;
pub mod health;
pub mod intake;
pub mod inventory;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod optimizer;
pub mod snapshot;
pub mod supervisor;
pub mod telemetry;

pub use config::EngineConfig;
pub use engine::{AllocationEngine, EngineBuilder, RestoreReport};
pub use error::{EngineError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{MonitoringLoop, TickReport};
pub use observability::{EngineMetrics, StructuredLogger};
pub use supervisor::SystemState;
