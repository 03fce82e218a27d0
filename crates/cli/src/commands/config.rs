//! Configuration validation command

use crate::config::load_engine_config;
use crate::output::{self, OutputFormat};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct CheckReport {
    path: String,
    valid: bool,
    catalog_entries: usize,
    regions: usize,
    energy_threshold: f64,
}

/// Load and validate the engine configuration held in a service config file
pub fn check(file: Option<&Path>, format: OutputFormat) -> Result<()> {
    let Some(path) = file else {
        bail!("No configuration file given (pass FILE, --config or ECO_CONFIG)");
    };

    let config = load_engine_config(path)?;
    config
        .validate()
        .with_context(|| format!("{} is invalid", path.display()))?;

    match format {
        OutputFormat::Json => output::print_json(&CheckReport {
            path: path.display().to_string(),
            valid: true,
            catalog_entries: config.catalog.len(),
            regions: config.regions.len(),
            energy_threshold: config.energy_threshold,
        })?,
        OutputFormat::Table => {
            output::print_success(&format!("{} is valid", path.display()));
            output::print_info(&format!(
                "{} instance types, {} regions, default threshold {}",
                config.catalog.len(),
                config.regions.len(),
                output::format_watts(config.energy_threshold)
            ));
        }
    }

    Ok(())
}
