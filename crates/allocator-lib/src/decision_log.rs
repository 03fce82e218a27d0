//! Append-only decision log
//!
//! One JSON record per line. Records are hash-chained: each carries the hash
//! of its predecessor and its own SHA-256 over a domain-separated encoding, so
//! an edited or removed record breaks verification of everything after it.
//! At most one terminal decision is recorded per request id.

use crate::error::PersistenceError;
use crate::models::{AllocationDecision, Outcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const RECORD_DOMAIN_V1: &[u8] = b"ECO_ALLOCATOR_DECISION_RECORD_V1";

/// prev_hash of the first record
pub fn genesis_hash() -> String {
    hex::encode([0u8; 32])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub decision: AllocationDecision,
    pub prev_hash: String,
    pub record_hash: String,
}

pub fn record_hash_v1(
    seq: u64,
    recorded_at: DateTime<Utc>,
    prev_hash: &str,
    decision: &AllocationDecision,
) -> Result<String, PersistenceError> {
    let body = serde_json::to_vec(decision)?;

    let mut hasher = Sha256::new();
    hasher.update(RECORD_DOMAIN_V1);
    hasher.update(seq.to_le_bytes());
    hasher.update(recorded_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update((body.len() as u64).to_le_bytes());
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome of reading and verifying a log file
#[derive(Debug, Clone, Default)]
pub struct ChainReport {
    pub records: Vec<DecisionRecord>,
    pub head_hash: String,
    /// A torn final line (crash mid-append) was ignored
    pub torn_tail: bool,
    /// The final record lacks its trailing newline
    pub unterminated: bool,
    /// Byte length of the verified prefix
    pub valid_len: u64,
}

/// Parse and verify a decision log. A missing file is an empty chain.
pub fn read_chain(path: &Path) -> Result<ChainReport, PersistenceError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ChainReport {
                head_hash: genesis_hash(),
                ..Default::default()
            })
        }
        Err(e) => return Err(PersistenceError::io(path, e)),
    };
    verify_chain(&text)
}

/// Verify the chain held in `text`
pub fn verify_chain(text: &str) -> Result<ChainReport, PersistenceError> {
    let mut report = ChainReport {
        head_hash: genesis_hash(),
        ..Default::default()
    };
    let mut terminal: HashMap<Uuid, usize> = HashMap::new();
    let mut offset = 0u64;

    let mut lines = text.split_inclusive('\n').enumerate().peekable();
    while let Some((index, raw)) = lines.next() {
        let line_no = index + 1;
        let complete = raw.ends_with('\n');
        let line = raw.trim_end();
        if line.is_empty() {
            offset += raw.len() as u64;
            continue;
        }

        let record: DecisionRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(e) if !complete && lines.peek().is_none() => {
                warn!(line = line_no, error = %e, "Ignoring torn final decision log line");
                report.torn_tail = true;
                break;
            }
            Err(e) => {
                return Err(PersistenceError::ChainBroken {
                    line: line_no,
                    reason: format!("unparseable record: {}", e),
                })
            }
        };

        let expected_seq = report.records.len() as u64;
        if record.seq != expected_seq {
            return Err(PersistenceError::ChainBroken {
                line: line_no,
                reason: format!("sequence {} where {} was expected", record.seq, expected_seq),
            });
        }
        if record.prev_hash != report.head_hash {
            return Err(PersistenceError::ChainBroken {
                line: line_no,
                reason: "prev_hash does not match the preceding record".into(),
            });
        }
        let recomputed = record_hash_v1(record.seq, record.recorded_at, &record.prev_hash, &record.decision)?;
        if recomputed != record.record_hash {
            return Err(PersistenceError::ChainBroken {
                line: line_no,
                reason: "record_hash does not match record contents".into(),
            });
        }
        if record.decision.is_terminal() {
            if let Some(first) = terminal.insert(record.decision.request_id, line_no) {
                return Err(PersistenceError::ChainBroken {
                    line: line_no,
                    reason: format!(
                        "second terminal decision for {} (first on line {})",
                        record.decision.request_id, first
                    ),
                });
            }
        }

        report.head_hash = record.record_hash.clone();
        report.records.push(record);
        report.unterminated = !complete;
        offset += raw.len() as u64;
    }

    report.valid_len = offset;
    Ok(report)
}

#[derive(Debug)]
struct LogState {
    head_hash: String,
    next_seq: u64,
    records: Vec<DecisionRecord>,
    /// request id -> index of its latest record
    latest: HashMap<Uuid, usize>,
}

impl LogState {
    fn from_report(report: ChainReport) -> Self {
        let latest = report
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.decision.request_id, i))
            .collect();
        Self {
            head_hash: report.head_hash,
            next_seq: report.records.len() as u64,
            records: report.records,
            latest,
        }
    }

    fn terminal(&self, request_id: &Uuid) -> Option<&AllocationDecision> {
        self.latest
            .get(request_id)
            .map(|&i| &self.records[i].decision)
            .filter(|d| d.is_terminal())
    }
}

/// File-backed decision log with an in-memory index for queries
#[derive(Debug)]
pub struct DecisionLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl DecisionLog {
    /// Open (or create) the log at `path`, verifying the existing chain.
    /// A torn final line is cut off so new appends continue a valid chain.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
            }
        }

        let report = read_chain(&path)?;
        if report.torn_tail {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| PersistenceError::io(&path, e))?;
            file.set_len(report.valid_len)
                .map_err(|e| PersistenceError::io(&path, e))?;
        }
        if report.unterminated {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| PersistenceError::io(&path, e))?;
            file.write_all(b"\n")
                .map_err(|e| PersistenceError::io(&path, e))?;
        }

        info!(
            path = %path.display(),
            records = report.records.len(),
            head = %report.head_hash,
            "Decision log opened"
        );
        Ok(Self {
            path,
            state: Mutex::new(LogState::from_report(report)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a decision. A second terminal decision for the same request is
    /// refused with `DuplicateTerminal`.
    pub async fn append(&self, decision: &AllocationDecision) -> Result<DecisionRecord, PersistenceError> {
        let mut state = self.state.lock().await;
        if state.terminal(&decision.request_id).is_some() {
            return Err(PersistenceError::DuplicateTerminal(decision.request_id));
        }

        let seq = state.next_seq;
        let recorded_at = Utc::now();
        let record_hash = record_hash_v1(seq, recorded_at, &state.head_hash, decision)?;
        let record = DecisionRecord {
            seq,
            recorded_at,
            decision: decision.clone(),
            prev_hash: state.head_hash.clone(),
            record_hash,
        };

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;
        file.sync_all()
            .await
            .map_err(|e| PersistenceError::io(&self.path, e))?;

        state.head_hash = record.record_hash.clone();
        state.next_seq += 1;
        let index = state.records.len();
        state.latest.insert(decision.request_id, index);
        state.records.push(record.clone());

        debug!(
            request_id = %decision.request_id,
            outcome = %decision.outcome,
            seq = seq,
            "Decision recorded"
        );
        Ok(record)
    }

    pub async fn head_hash(&self) -> String {
        self.state.lock().await.head_hash.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Latest decision recorded for a request
    pub async fn latest(&self, request_id: &Uuid) -> Option<AllocationDecision> {
        let state = self.state.lock().await;
        state
            .latest
            .get(request_id)
            .map(|&i| state.records[i].decision.clone())
    }

    /// Terminal decision recorded for a request, if any
    pub async fn terminal(&self, request_id: &Uuid) -> Option<AllocationDecision> {
        self.state.lock().await.terminal(request_id).cloned()
    }

    /// Every recorded decision in log order, optionally filtered by outcome
    pub async fn decisions(&self, outcome: Option<Outcome>) -> Vec<AllocationDecision> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .map(|r| &r.decision)
            .filter(|d| outcome.map_or(true, |o| d.outcome == o))
            .cloned()
            .collect()
    }

    /// Requests whose latest record is a deferral, i.e. still owed a terminal decision
    pub async fn pending_deferrals(&self) -> Vec<AllocationDecision> {
        let state = self.state.lock().await;
        let mut pending: Vec<(usize, AllocationDecision)> = state
            .latest
            .values()
            .map(|&i| (i, state.records[i].decision.clone()))
            .filter(|(_, d)| !d.is_terminal())
            .collect();
        pending.sort_by_key(|(i, _)| *i);
        pending.into_iter().map(|(_, d)| d).collect()
    }
}
