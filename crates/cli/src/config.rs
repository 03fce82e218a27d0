//! Engine configuration and state paths for the CLI

use allocator_lib::EngineConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Only the `engine` table of a service configuration file matters here
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ServiceFile {
    engine: EngineConfig,
}

/// Load the engine configuration from a service configuration file
/// (TOML, YAML or JSON, picked by extension) without validating it
pub fn load_engine_config(path: &Path) -> Result<EngineConfig> {
    let file: ServiceFile = ::config::Config::builder()
        .add_source(::config::File::from(path).required(true))
        .build()
        .with_context(|| format!("Failed to read {}", path.display()))?
        .try_deserialize()
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(file.engine)
}

/// Where the engine keeps its decision log and snapshot
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub decision_log: PathBuf,
    pub snapshot: PathBuf,
}

impl StatePaths {
    /// File names come from the configuration if one is given; an explicit
    /// state directory always wins over the configured one
    pub fn resolve(state_dir: Option<&Path>, config_path: Option<&Path>) -> Result<Self> {
        let mut persistence = match config_path {
            Some(path) => load_engine_config(path)?.persistence,
            None => Default::default(),
        };
        if let Some(dir) = state_dir {
            persistence.state_dir = dir.to_path_buf();
        }
        Ok(Self {
            decision_log: persistence.decision_log_path(),
            snapshot: persistence.snapshot_path(),
        })
    }
}
