//! Decision log commands

use crate::config::StatePaths;
use crate::output::{self, OutputFormat};
use allocator_lib::decision_log::{read_chain, DecisionRecord};
use allocator_lib::error::PersistenceError;
use allocator_lib::models::Outcome;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use tabled::Tabled;

#[derive(Tabled)]
struct DecisionRow {
    #[tabled(rename = "Seq")]
    seq: u64,
    #[tabled(rename = "Request")]
    request_id: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Placement")]
    placement: String,
    #[tabled(rename = "Instance")]
    instance: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Projected")]
    projected: String,
    #[tabled(rename = "Attempt")]
    attempt: u32,
    #[tabled(rename = "Reason")]
    reason: String,
}

impl From<&DecisionRecord> for DecisionRow {
    fn from(record: &DecisionRecord) -> Self {
        let decision = &record.decision;
        let mut outcome = output::color_status(decision.outcome.as_str());
        if decision.critical_override {
            outcome.push_str(" (override)");
        }
        Self {
            seq: record.seq,
            request_id: output::short(&decision.request_id.to_string(), 8),
            outcome,
            placement: decision
                .placement
                .as_ref()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
            instance: decision.instance_id.clone().unwrap_or_else(|| "-".to_string()),
            score: format!("{:.3}", decision.score),
            projected: decision
                .projected_energy_cost
                .map(output::format_watts)
                .unwrap_or_else(|| "-".to_string()),
            attempt: decision.attempt,
            reason: decision.reason.clone().unwrap_or_default(),
        }
    }
}

#[derive(Serialize)]
struct VerifyReport {
    path: String,
    valid: bool,
    records: usize,
    head_hash: String,
    torn_tail: bool,
}

/// List decisions, optionally filtered by outcome and request id
pub fn list(
    paths: &StatePaths,
    outcome: Option<&str>,
    request: Option<&str>,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let outcome: Option<Outcome> = outcome
        .map(|s| s.parse::<Outcome>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let report = read_chain(&paths.decision_log).with_context(|| {
        format!(
            "Failed to read decision log {}",
            paths.decision_log.display()
        )
    })?;

    let mut records: Vec<&DecisionRecord> = report
        .records
        .iter()
        .filter(|r| outcome.map_or(true, |o| r.decision.outcome == o))
        .filter(|r| request.map_or(true, |id| r.decision.request_id.to_string().starts_with(id)))
        .collect();
    if let Some(limit) = limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }

    match format {
        OutputFormat::Json => {
            let decisions: Vec<_> = records.iter().map(|r| &r.decision).collect();
            output::print_json(&decisions)?;
        }
        OutputFormat::Table => {
            let rows: Vec<DecisionRow> = records.iter().map(|r| DecisionRow::from(*r)).collect();
            output::print_table(&rows);
            if report.torn_tail {
                output::print_warning("Torn final line ignored (interrupted append)");
            }
        }
    }

    Ok(())
}

/// Verify the hash chain; a broken chain is an error
pub fn verify(paths: &StatePaths, format: OutputFormat) -> Result<()> {
    let path = &paths.decision_log;
    if !path.exists() {
        bail!("Decision log {} does not exist", path.display());
    }

    let report = match read_chain(path) {
        Ok(report) => report,
        Err(e @ PersistenceError::ChainBroken { .. }) => {
            return Err(anyhow!(e).context(format!("Verification of {} failed", path.display())))
        }
        Err(e) => return Err(e).context("Failed to read decision log"),
    };

    match format {
        OutputFormat::Json => output::print_json(&VerifyReport {
            path: path.display().to_string(),
            valid: true,
            records: report.records.len(),
            head_hash: report.head_hash.clone(),
            torn_tail: report.torn_tail,
        })?,
        OutputFormat::Table => {
            output::print_success(&format!(
                "Decision log verified: {} records",
                report.records.len()
            ));
            output::print_info(&format!("Head hash: {}", report.head_hash));
            if report.torn_tail {
                output::print_warning(
                    "Torn final line ignored; the engine truncates it on next start",
                );
            }
        }
    }

    Ok(())
}
