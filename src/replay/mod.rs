//! Deterministic Gate Replay
//!
//! Runs the production gate logic over recorded market snapshots on a simulated
//! clock and measures what it would have done: coverage per symbol, state
//! transitions, and analysis work saved relative to running without a gate.
//!
//! Replay never talks to an exchange. [`guard`] refuses to start while any live
//! client is registered in the process.

pub mod accumulator;
pub mod guard;
pub mod orchestrator;
pub mod providers;
pub mod report;
pub mod snapshot_store;


use chrono::NaiveDate;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::config::ConfigError;

pub use accumulator::CoverageAccumulator;
pub use guard::{ensure_no_live_client, live_client_count, register_live_client, LiveClientRegistration};
pub use orchestrator::{
    build_tick_timeline, run_pass_disabled, run_pass_enabled, run_replay, verify_determinism,
    verify_resume_equivalence, Accumulators, PassState, ReplayDataset, ReplayInputs,
    ReplayOutcome, ReplayWindow, VerificationReport,
};
pub use providers::{ReplayCandleProvider, ReplayTickerProvider};
pub use report::{report_digest, CoverageReport, DeltaReport, DisabledCounts, ReportPaths, WindowInfo};
pub use snapshot_store::{MarketSnapshot, SnapshotStore};

#[derive(Debug)]
pub enum ReplayError {
    /// A live exchange client exists in this process.
    LiveClientPresent { count: usize },
    InvalidWindow { start: NaiveDate, end: NaiveDate },
    /// The window contains no recorded symbols.
    NoSymbols { start: NaiveDate, end: NaiveDate },
    Config(ConfigError),
    Storage(anyhow::Error),
    Report { path: PathBuf, source: io::Error },
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LiveClientPresent { count } => write!(
                f,
                "replay refused: {} live exchange client(s) registered in this process",
                count
            ),
            Self::InvalidWindow { start, end } => {
                write!(f, "end date {} is before start date {}", end, start)
            }
            Self::NoSymbols { start, end } => {
                write!(f, "no recorded symbols between {} and {}", start, end)
            }
            Self::Config(e) => write!(f, "{}", e),
            Self::Storage(e) => write!(f, "snapshot storage error: {:#}", e),
            Self::Report { path, source } => {
                write!(f, "failed to write reports to {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ReplayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Storage(e) => Some(&**e),
            Self::Report { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for ReplayError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
