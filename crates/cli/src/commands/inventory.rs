//! Inventory snapshot command

use crate::config::StatePaths;
use crate::output::{self, OutputFormat};
use allocator_lib::models::Instance;
use allocator_lib::snapshot::SnapshotStore;
use allocator_lib::supervisor::Lifecycle;
use anyhow::{Context, Result};
use tabled::Tabled;

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "Instance")]
    id: String,
    #[tabled(rename = "Type")]
    instance_type: String,
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Utilization")]
    utilization: String,
    #[tabled(rename = "Reserved")]
    reserved: String,
    #[tabled(rename = "Request")]
    request: String,
}

impl From<&Instance> for InstanceRow {
    fn from(instance: &Instance) -> Self {
        Self {
            id: instance.id.clone(),
            instance_type: instance.instance_type.clone(),
            region: instance.region.clone(),
            status: output::color_status(instance.status.as_str()),
            utilization: output::format_ratio(instance.current_utilization),
            reserved: output::format_watts(instance.reserved_draw),
            request: instance
                .request_id
                .map(|id| output::short(&id.to_string(), 8))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[derive(Tabled)]
struct LifecycleRow {
    #[tabled(rename = "Request")]
    request: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Since")]
    since: String,
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "Recoveries")]
    recoveries: u32,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

impl From<&Lifecycle> for LifecycleRow {
    fn from(lifecycle: &Lifecycle) -> Self {
        Self {
            request: lifecycle.request_id.to_string(),
            state: output::color_status(lifecycle.state.as_str()),
            since: lifecycle.entered_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            instance: lifecycle.instance_id.clone().unwrap_or_else(|| "-".to_string()),
            recoveries: lifecycle.recovery_attempts,
            last_error: lifecycle.last_error.clone().unwrap_or_default(),
        }
    }
}

/// Show the instances and lifecycles of the last persisted snapshot
pub fn show(paths: &StatePaths, format: OutputFormat) -> Result<()> {
    let snapshot = SnapshotStore::new(&paths.snapshot)
        .load()
        .with_context(|| format!("Failed to load snapshot {}", paths.snapshot.display()))?;

    let Some(snapshot) = snapshot else {
        output::print_warning(&format!(
            "No snapshot at {}; the engine has not persisted state yet",
            paths.snapshot.display()
        ));
        return Ok(());
    };

    match format {
        OutputFormat::Json => output::print_json(&snapshot)?,
        OutputFormat::Table => {
            println!(
                "Snapshot taken at {}",
                snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("\nInstances:");
            let rows: Vec<InstanceRow> = snapshot.instances.iter().map(InstanceRow::from).collect();
            output::print_table(&rows);
            println!("\nLifecycles:");
            let rows: Vec<LifecycleRow> = snapshot.lifecycles.iter().map(LifecycleRow::from).collect();
            output::print_table(&rows);
        }
    }

    Ok(())
}
