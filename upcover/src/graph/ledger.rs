//! Persistent completion ledger.
//!
//! The ledger remembers which arguments produced each set of targets, so a
//! change in task arguments invalidates outputs that are otherwise newer than
//! their inputs. It is stored as JSON in the graph workspace and rewritten
//! atomically (temporary file + rename).
//!
//! Records are keyed by a SHA-256 of the task's sorted target paths; the
//! arguments are stored as a SHA-256 of their JSON encoding.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// File name of the ledger inside the workspace.
pub const LEDGER_FILE_NAME: &str = "taskgraph_ledger.json";

/// Errors reading or writing the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger file could not be read or written.
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The ledger file is not valid JSON.
    #[error("ledger at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One completed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Name the task was registered under.
    pub task_name: String,
    /// SHA-256 of the task arguments.
    pub fingerprint: String,
    /// Completion time, RFC 3339.
    pub completed_at: String,
}

/// Result of comparing a task against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerMatch {
    /// No record for these targets.
    Absent,
    /// Recorded with the same arguments.
    Same,
    /// Recorded with different arguments.
    Changed,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    records: BTreeMap<String, LedgerRecord>,
}

/// Thread-safe ledger of task completions.
#[derive(Debug)]
pub struct Ledger {
    /// Backing file, or `None` for an in-memory ledger.
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, LedgerRecord>>,
}

impl Ledger {
    /// Creates a ledger that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens the ledger at `path`, loading existing records if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => {
                let file: LedgerFile =
                    serde_json::from_slice(&bytes).map_err(|source| LedgerError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                debug!(path = %path.display(), records = file.records.len(), "Loaded task ledger");
                file.records
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(LedgerError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// Returns the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Computes the record key for a task's targets.
    pub fn task_key(targets: &[PathBuf]) -> String {
        let mut sorted: Vec<&PathBuf> = targets.iter().collect();
        sorted.sort();
        let mut hasher = Sha256::new();
        for target in sorted {
            hasher.update(target.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    /// Computes the fingerprint of a task's arguments.
    pub fn fingerprint(args: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(args.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Compares a task against its recorded completion.
    pub fn lookup(&self, key: &str, fingerprint: &str) -> LedgerMatch {
        match self.records.lock().get(key) {
            None => LedgerMatch::Absent,
            Some(record) if record.fingerprint == fingerprint => LedgerMatch::Same,
            Some(_) => LedgerMatch::Changed,
        }
    }

    /// Returns a copy of the record for `key`.
    pub fn get(&self, key: &str) -> Option<LedgerRecord> {
        self.records.lock().get(key).cloned()
    }

    /// Records a successful completion.
    pub fn record(&self, key: &str, task_name: &str, fingerprint: &str) {
        let record = LedgerRecord {
            task_name: task_name.to_string(),
            fingerprint: fingerprint.to_string(),
            completed_at: chrono::Local::now().to_rfc3339(),
        };
        self.records.lock().insert(key.to_string(), record);
    }

    /// Forgets a completion (used when a task fails or is abandoned).
    pub fn forget(&self, key: &str) {
        self.records.lock().remove(key);
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Writes the ledger to disk. No-op for in-memory ledgers.
    ///
    /// The record lock is held for the whole write so concurrent flushes
    /// from different workers serialize.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let records = self.records.lock();
        let file = LedgerFile {
            records: records.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| LedgerError::Corrupt {
            path: path.clone(),
            source,
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).map_err(|source| LedgerError::Io {
            path: tmp.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&tmp, path) {
            warn!(path = %path.display(), error = %source, "Failed to replace task ledger");
            return Err(LedgerError::Io {
                path: path.clone(),
                source,
            });
        }
        Ok(())
    }
}
