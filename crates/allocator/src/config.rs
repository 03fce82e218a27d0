//! Service configuration

use allocator_lib::EngineConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable naming an optional configuration file
pub const CONFIG_PATH_ENV: &str = "ECO_CONFIG";

/// Service configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Engine identity carried by every structured log event
    pub engine_id: String,

    /// API server port for health/metrics
    pub api_port: u16,

    /// Prediction service base URL
    pub forecast_endpoint: String,

    /// Append-only JSON-lines energy log read on every monitoring tick
    pub energy_log: PathBuf,

    /// Optional JSON array of externally observed instances
    pub inventory_file: Option<PathBuf>,

    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            engine_id: default_engine_id(),
            api_port: 8080,
            forecast_endpoint: "http://forecast-service:9090".to_string(),
            energy_log: PathBuf::from("/var/lib/eco-allocator/energy.jsonl"),
            inventory_file: None,
            engine: EngineConfig::default(),
        }
    }
}

fn default_engine_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "eco-allocator".to_string())
}

impl ServiceConfig {
    /// Load configuration from the `ECO_CONFIG` file (if set) and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from an optional file, with `ECO_*` environment variables layered
    /// on top. Nested keys use `__`, e.g. `ECO_ENGINE__ENERGY_THRESHOLD`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("ECO")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let service: ServiceConfig = config
            .try_deserialize()
            .context("Failed to parse configuration")?;
        service
            .engine
            .validate()
            .context("Invalid engine configuration")?;
        Ok(service)
    }
}
