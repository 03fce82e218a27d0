//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of rows
pub fn print_table<T: Tabled>(rows: &[T]) {
    if rows.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

/// Print any serializable value as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format watts
pub fn format_watts(watts: f64) -> String {
    if watts >= 1000.0 {
        format!("{:.2}kW", watts / 1000.0)
    } else {
        format!("{:.1}W", watts)
    }
}

/// Format a 0.0 - 1.0 ratio as percentage
pub fn format_ratio(ratio: f64) -> String {
    format!("{:.0}%", ratio * 100.0)
}

/// Shorten a hash or id for table display
pub fn short(value: &str, len: usize) -> String {
    value.chars().take(len).collect()
}

/// Color outcome, status or state names
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "accepted" | "active" | "healthy" | "monitoring_phase" => status.green().to_string(),
        "deferred" | "pending" | "draining" | "processing" | "resource_allocation"
        | "optimization" | "degraded" => status.yellow().to_string(),
        "rejected" | "terminated" | "idle" => status.blue().to_string(),
        "failed" | "error" | "halted" | "unhealthy" => status.red().to_string(),
        _ => status.to_string(),
    }
}
