//! Energy and sustainability queries over a telemetry log

use crate::output::{self, OutputFormat};
use allocator_lib::models::EnergySnapshot;
use allocator_lib::telemetry::{parse_energy_log, EnergyStore};
use allocator_lib::EngineConfig;
use anyhow::{bail, Context, Result};
use std::path::Path;

fn read_log(path: &Path) -> Result<Vec<EnergySnapshot>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read telemetry log {}", path.display()))?;
    Ok(parse_energy_log(&String::from_utf8_lossy(&bytes)))
}

/// Latest reading of one instance
pub fn instance(telemetry: &Path, instance_id: &str, format: OutputFormat) -> Result<()> {
    let store = EnergyStore::new(2);
    for snapshot in read_log(telemetry)? {
        store.record(snapshot);
    }

    let Some(snapshot) = store.latest(instance_id) else {
        bail!("No energy readings for instance {}", instance_id);
    };

    match format {
        OutputFormat::Json => output::print_json(&snapshot)?,
        OutputFormat::Table => {
            println!("Instance:          {}", snapshot.instance_id);
            println!("Region:            {}", snapshot.region);
            println!("Power draw:        {}", output::format_watts(snapshot.power_draw));
            println!("Carbon intensity:  {:.1} gCO2/kWh", snapshot.carbon_intensity);
            println!(
                "Observed at:       {}",
                snapshot.observed_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    }

    Ok(())
}

/// Regional aggregate. Readings are replayed in time order and a rollup is
/// taken after each distinct observation time, which yields the draw trend.
pub fn sustainability(
    telemetry: &Path,
    region: &str,
    config: &EngineConfig,
    format: OutputFormat,
) -> Result<()> {
    let mut readings = read_log(telemetry)?;
    readings.sort_by_key(|s| s.observed_at);

    let store = EnergyStore::new(config.monitoring.trend_window);
    let mut index = 0;
    while index < readings.len() {
        let observed_at = readings[index].observed_at;
        while index < readings.len() && readings[index].observed_at == observed_at {
            store.record(readings[index].clone());
            index += 1;
        }
        if let Some(rollup) = store.region_rollup(region) {
            store.push_rollup(&rollup);
        }
    }

    let profile = config.region_profile(region);
    let view = store.sustainability(region, profile.carbon_intensity, profile.renewable_percentage);
    let threshold = config.threshold_for(region);

    match format {
        OutputFormat::Json => output::print_json(&view)?,
        OutputFormat::Table => {
            println!("Region:            {}", view.region);
            println!("Carbon intensity:  {:.1} gCO2/kWh", view.carbon_intensity);
            println!("Renewable share:   {:.1}%", view.renewable_percentage);
            println!(
                "Power draw:        {} of {} threshold",
                output::format_watts(view.power_draw),
                output::format_watts(threshold)
            );
            println!("Energy trend:      {:+.1} W/tick", view.energy_trend);
            println!("Instances:         {}", view.samples);
            if view.samples == 0 {
                output::print_warning("No readings for this region; carbon intensity is the configured figure");
            } else if view.power_draw > threshold {
                output::print_warning("Region is over its energy threshold");
            }
        }
    }

    Ok(())
}
