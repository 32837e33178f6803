use crate::corpus::entry_file_name;
use crate::executor::{Failure, RunResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Cause recorded for runs abandoned at their deadline.
pub const HANG_CAUSE: &str = "Run exceeded its time limit";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failure archive I/O error: {0}")]
    Io(String),
    #[error("Failure archive serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for ArchiveError {
    fn from(err: std::io::Error) -> Self {
        ArchiveError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for ArchiveError {
    fn from(err: serde_json::Error) -> Self {
        ArchiveError::Serialization(format!("JSON operation error: {}", err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BugKind {
    /// The target failed an assertion or panicked.
    Failure,
    /// The run overran its time limit.
    Hang,
}

/// Represents a bug identified by an `Oracle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    pub kind: BugKind,
    /// The bytes the generator consumed in the failing run.
    pub bytes: Vec<u8>,
    pub cause: String,
    pub location: Option<String>,
    /// Reports sharing this key are the same bug.
    pub dedup_key: String,
    /// MD5 of `bytes`.
    pub input_hash: String,
}

/// An `Oracle` examines the outcome of a run to determine whether a bug occurred.
pub trait Oracle {
    fn examine(&self, bytes: &[u8], result: &RunResult) -> Option<BugReport>;
}

/// Reports target failures and timeouts. Timeouts are flagged as hangs and all share one
/// dedup key, since they carry no location.
#[derive(Debug, Default)]
pub struct CrashOracle;

impl CrashOracle {
    pub fn new() -> Self {
        CrashOracle
    }
}

impl Oracle for CrashOracle {
    fn examine(&self, bytes: &[u8], result: &RunResult) -> Option<BugReport> {
        let (kind, failure) = match result {
            RunResult::Failure(failure) => (BugKind::Failure, failure.clone()),
            RunResult::Timeout => (BugKind::Hang, Failure::new(HANG_CAUSE)),
            RunResult::Success | RunResult::Invalid(_) => return None,
        };
        let dedup_key = match kind {
            BugKind::Failure => failure.dedup_key(),
            BugKind::Hang => format!("{:x}", md5::compute(b"hang")),
        };
        Some(BugReport {
            kind,
            bytes: bytes.to_vec(),
            cause: failure.cause,
            location: failure.location,
            dedup_key,
            input_hash: format!("{:x}", md5::compute(bytes)),
        })
    }
}

/// Companion file written next to each crash artifact.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub id: usize,
    pub kind: BugKind,
    pub cause: String,
    pub location: Option<String>,
    pub dedup_key: String,
    pub input_hash: String,
    pub elapsed_ms: u64,
}

/// Keeps one artifact per distinct bug.
///
/// With a directory, each new bug is written as `failures/id_NNNNNN` (raw bytes) plus
/// `failures/id_NNNNNN.json` ([`FailureRecord`]).
#[derive(Debug, Default)]
pub struct FailureArchive {
    dir: Option<PathBuf>,
    seen: HashSet<String>,
    records: Vec<FailureRecord>,
}

impl FailureArchive {
    /// Archive that only deduplicates, without writing anything.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Archive under `<output_dir>/failures`, replacing artifacts from an earlier session.
    pub fn create(output_dir: &Path) -> Result<Self, ArchiveError> {
        let dir = output_dir.join("failures");
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| {
                ArchiveError::Io(format!("Failed to clear stale directory {:?}: {}", dir, e))
            })?;
        }
        fs::create_dir_all(&dir).map_err(|e| {
            ArchiveError::Io(format!("Failed to create failures directory {:?}: {}", dir, e))
        })?;
        Ok(Self {
            dir: Some(dir),
            ..Self::default()
        })
    }

    /// Stores `report` unless its bug is already archived. Returns whether it was new.
    pub fn record(&mut self, report: &BugReport, elapsed: Duration) -> Result<bool, ArchiveError> {
        if self.seen.contains(&report.dedup_key) {
            return Ok(false);
        }
        let record = FailureRecord {
            id: self.records.len(),
            kind: report.kind,
            cause: report.cause.clone(),
            location: report.location.clone(),
            dedup_key: report.dedup_key.clone(),
            input_hash: report.input_hash.clone(),
            elapsed_ms: elapsed.as_millis() as u64,
        };
        if let Some(dir) = &self.dir {
            let path = dir.join(entry_file_name(record.id));
            fs::write(&path, &report.bytes).map_err(|e| {
                ArchiveError::Io(format!("Failed to write crash artifact {:?}: {}", path, e))
            })?;
            let json_path = path.with_extension("json");
            fs::write(&json_path, serde_json::to_vec_pretty(&record)?).map_err(|e| {
                ArchiveError::Io(format!("Failed to write failure record {:?}: {}", json_path, e))
            })?;
            debug!(path = ?path, "wrote crash artifact");
        }
        self.seen.insert(report.dedup_key.clone());
        self.records.push(record);
        Ok(true)
    }

    pub fn unique(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn artifact_path(&self, id: usize) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(entry_file_name(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn crash_oracle_reports_failures_and_hangs_only() {
        let oracle = CrashOracle::new();
        assert!(oracle.examine(b"ok", &RunResult::Success).is_none());
        assert!(
            oracle
                .examine(b"bad", &RunResult::Invalid("short".into()))
                .is_none()
        );

        let report = oracle
            .examine(b"boom", &RunResult::Failure(Failure::at("Boom!", "lib.rs:3")))
            .unwrap();
        assert_eq!(report.kind, BugKind::Failure);
        assert_eq!(report.bytes, b"boom");
        assert_eq!(report.dedup_key, Failure::at("other", "lib.rs:3").dedup_key());
        assert_eq!(report.input_hash, format!("{:x}", md5::compute(b"boom")));

        let hang = oracle.examine(b"slow", &RunResult::Timeout).unwrap();
        assert_eq!(hang.kind, BugKind::Hang);
        assert_eq!(hang.cause, HANG_CAUSE);
    }

    #[test]
    fn archive_keeps_one_artifact_per_dedup_key() {
        let dir = tempdir().unwrap();
        let oracle = CrashOracle::new();
        let mut archive = FailureArchive::create(dir.path()).unwrap();

        let first = oracle
            .examine(&[1], &RunResult::Failure(Failure::at("x = 1", "check:10")))
            .unwrap();
        let same_bug = oracle
            .examine(&[2], &RunResult::Failure(Failure::at("x = 2", "check:10")))
            .unwrap();
        let other_bug = oracle
            .examine(&[3], &RunResult::Failure(Failure::new("divide by zero")))
            .unwrap();

        assert!(archive.record(&first, Duration::from_millis(7)).unwrap());
        assert!(!archive.record(&same_bug, Duration::from_millis(8)).unwrap());
        assert!(archive.record(&other_bug, Duration::from_millis(9)).unwrap());
        assert_eq!(archive.unique(), 2);

        let failures = dir.path().join("failures");
        let mut names: Vec<String> = fs::read_dir(&failures)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec!["id_000000", "id_000000.json", "id_000001", "id_000001.json"]
        );
        assert_eq!(fs::read(failures.join("id_000000")).unwrap(), vec![1]);
        let record: FailureRecord =
            serde_json::from_slice(&fs::read(failures.join("id_000000.json")).unwrap()).unwrap();
        assert_eq!(record.kind, BugKind::Failure);
        assert_eq!(record.location.as_deref(), Some("check:10"));
        assert_eq!(record.elapsed_ms, 7);
    }

    #[test]
    fn in_memory_archive_still_deduplicates() {
        let mut archive = FailureArchive::in_memory();
        let hang = CrashOracle::new().examine(&[0], &RunResult::Timeout).unwrap();
        assert!(archive.record(&hang, Duration::ZERO).unwrap());
        assert!(!archive.record(&hang, Duration::ZERO).unwrap());
        assert!(archive.artifact_path(0).is_none());
    }
}
