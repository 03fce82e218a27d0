//! Telemetry collaborators

use crate::error::TelemetryError;
use crate::models::{EnergySnapshot, Instance};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Monitoring collaborator the gateway pulls from
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Energy readings observed since the previous fetch
    async fn fetch_snapshots(&self) -> Result<Vec<EnergySnapshot>, TelemetryError>;

    /// Externally observed instances (utilization, status)
    async fn fetch_inventory(&self) -> Result<Vec<Instance>, TelemetryError> {
        Ok(Vec::new())
    }
}

/// One line of an energy log: a single reading or a batch
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnergyLogLine {
    One(EnergySnapshot),
    Batch(Vec<EnergySnapshot>),
}

/// Parse energy log text, skipping lines that are not readings
pub fn parse_energy_log(text: &str) -> Vec<EnergySnapshot> {
    let mut snapshots = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<EnergyLogLine>(line) {
            Ok(EnergyLogLine::One(s)) => snapshots.push(s),
            Ok(EnergyLogLine::Batch(batch)) => snapshots.extend(batch),
            Err(e) => warn!(line = index + 1, error = %e, "Skipping malformed energy log line"),
        }
    }
    snapshots
}

/// Reads an append-only JSON-lines energy log, resuming where the last fetch
/// stopped. An optional inventory file holds a JSON array of instances.
#[derive(Debug)]
pub struct JsonLinesTelemetrySource {
    energy_log: PathBuf,
    inventory_file: Option<PathBuf>,
    offset: Mutex<u64>,
}

impl JsonLinesTelemetrySource {
    pub fn new(energy_log: impl Into<PathBuf>) -> Self {
        Self {
            energy_log: energy_log.into(),
            inventory_file: None,
            offset: Mutex::new(0),
        }
    }

    pub fn with_inventory_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.inventory_file = Some(path.into());
        self
    }

    pub fn energy_log(&self) -> &Path {
        &self.energy_log
    }
}

#[async_trait]
impl TelemetrySource for JsonLinesTelemetrySource {
    async fn fetch_snapshots(&self) -> Result<Vec<EnergySnapshot>, TelemetryError> {
        let mut offset = self.offset.lock().await;

        let mut file = match tokio::fs::File::open(&self.energy_log).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.energy_log, "Energy log not present yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(TelemetryError::Source(format!("{:?}: {}", self.energy_log, e))),
        };

        let len = file
            .metadata()
            .await
            .map_err(|e| TelemetryError::Source(e.to_string()))?
            .len();
        if len < *offset {
            // truncated or rotated
            *offset = 0;
        }

        file.seek(SeekFrom::Start(*offset))
            .await
            .map_err(|e| TelemetryError::Source(e.to_string()))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .await
            .map_err(|e| TelemetryError::Source(e.to_string()))?;

        // a trailing partial line is left for the next fetch
        let complete = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(end) => &bytes[..=end],
            None => &bytes[..0],
        };
        *offset += complete.len() as u64;

        // invalid UTF-8 only spoils its own line, which then fails to parse
        Ok(parse_energy_log(&String::from_utf8_lossy(complete)))
    }

    async fn fetch_inventory(&self) -> Result<Vec<Instance>, TelemetryError> {
        let Some(path) = &self.inventory_file else {
            return Ok(Vec::new());
        };
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| TelemetryError::Source(format!("{:?}: {}", path, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(TelemetryError::Source(format!("{:?}: {}", path, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    const LINE_A: &str = r#"{"instance_id":"i-1","region":"us-east-1","power_draw":120.0,"carbon_intensity":400.0,"observed_at":"2024-05-01T10:00:00Z"}"#;
    const LINE_B: &str = r#"[{"instance_id":"i-2","region":"eu-west-1","power_draw":60.0,"carbon_intensity":200.0,"observed_at":"2024-05-01T10:00:00Z"},{"instance_id":"i-3","region":"eu-west-1","power_draw":40.0,"carbon_intensity":210.0,"observed_at":"2024-05-01T10:00:00Z"}]"#;

    #[test]
    fn test_parse_single_and_batch_lines() {
        let text = format!("{}\n{}\nnot json\n\n", LINE_A, LINE_B);
        let snapshots = parse_energy_log(&text);
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].instance_id, "i-1");
        assert_eq!(snapshots[2].carbon_intensity, 210.0);
    }

    #[tokio::test]
    async fn test_fetch_resumes_after_previous_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("energy.jsonl");
        let source = JsonLinesTelemetrySource::new(&path);

        // missing log is not an error
        assert!(source.fetch_snapshots().await.unwrap().is_empty());

        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", LINE_A).unwrap();
        assert_eq!(source.fetch_snapshots().await.unwrap().len(), 1);
        assert!(source.fetch_snapshots().await.unwrap().is_empty());

        // partial line waits for its newline
        write!(file, "{}", LINE_B).unwrap();
        assert!(source.fetch_snapshots().await.unwrap().is_empty());
        writeln!(file).unwrap();
        assert_eq!(source.fetch_snapshots().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_bytes_do_not_stall_the_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("energy.jsonl");
        let source = JsonLinesTelemetrySource::new(&path);

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"garbage \xff\xfe line\n").unwrap();
        writeln!(file, "{}", LINE_A).unwrap();
        let snapshots = tokio_test::assert_ok!(source.fetch_snapshots().await);
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].instance_id, "i-1");

        // writer stopped inside a multibyte character
        file.write_all("{\"note\":\"\u{00e9}".as_bytes().split_last().unwrap().1)
            .unwrap();
        assert!(tokio_test::assert_ok!(source.fetch_snapshots().await).is_empty());
        writeln!(file).unwrap();
        writeln!(file, "{}", LINE_A).unwrap();
        assert_eq!(tokio_test::assert_ok!(source.fetch_snapshots().await).len(), 1);
    }

    #[tokio::test]
    async fn test_inventory_file() {
        let dir = tempdir().unwrap();
        let inventory = dir.path().join("inventory.json");
        std::fs::write(
            &inventory,
            r#"[{"id":"i-1","instance_type":"m5.large","region":"us-east-1","status":"active","current_utilization":0.4}]"#,
        )
        .unwrap();
        let source =
            JsonLinesTelemetrySource::new(dir.path().join("energy.jsonl")).with_inventory_file(&inventory);
        let instances = source.fetch_inventory().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].current_utilization, 0.4);
    }
}
