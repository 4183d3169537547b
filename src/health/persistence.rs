//! Symbol Health State File
//!
//! A single JSON object keyed by symbol:
//!
//! ```json
//! {
//!   "ETHUSDT": {
//!     "state": "DEGRADED",
//!     "consecutive_failures": 4,
//!     "consecutive_successes": 0,
//!     "first_failure_ts_ns": 1706140800000000000,
//!     "last_probe_ts_ns": null,
//!     "degraded_cycle": 2,
//!     "trust_history": [{ "ts": 1706140800000000000, "passed": false }]
//!   }
//! }
//! ```
//!
//! Writes go to a temporary sibling and are renamed into place, so a crash
//! mid-write leaves the previous file intact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::clock::Nanos;
use super::tracker::{HealthState, TrustObservation};

/// Persisted form of one symbol's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSymbolState {
    pub state: HealthState,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub consecutive_successes: u32,
    pub first_failure_ts_ns: Option<Nanos>,
    pub last_probe_ts_ns: Option<Nanos>,
    #[serde(default)]
    pub degraded_cycle: u64,
    #[serde(default)]
    pub trust_history: Vec<TrustObservation>,
}

/// Whole state file, sorted by symbol.
pub type PersistedStateFile = BTreeMap<String, PersistedSymbolState>;

/// What a persist call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// No state path configured.
    Disabled,
    /// Last write was too recent.
    RateLimited,
    Written { symbols: usize },
}

/// State-file failures. Callers log these; they never reach the check path.
#[derive(Debug)]
pub enum PersistError {
    Io { path: PathBuf, source: io::Error },
    Serialize(serde_json::Error),
    Corrupt { path: PathBuf, source: serde_json::Error },
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "state file I/O error at {}: {}", path.display(), source)
            }
            Self::Serialize(e) => write!(f, "failed to serialize health state: {}", e),
            Self::Corrupt { path, source } => {
                write!(f, "corrupt state file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize(e) => Some(e),
            Self::Corrupt { source, .. } => Some(source),
        }
    }
}

/// Write `content` to `path` atomically: temp file, flush, fsync, rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let temp_path = temp_path_for(path);
    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(content)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&temp_path, path)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "state".into());
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn save_state_file(path: &Path, file: &PersistedStateFile) -> Result<(), PersistError> {
    let json = serde_json::to_vec_pretty(file).map_err(PersistError::Serialize)?;
    write_atomic(path, &json).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read a state file. `Ok(None)` when the file does not exist.
pub fn load_state_file(path: &Path) -> Result<Option<PersistedStateFile>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| PersistError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}
