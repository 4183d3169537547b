//! Replay Orchestrator
//!
//! Drives the gate over a recorded window twice:
//!
//! 1. **Enabled pass**: a fresh in-memory tracker bound to a [`SimClock`]; at every
//!    synthetic tick each symbol goes through [`run_gated_check`] against
//!    providers frozen at that tick.
//! 2. **Disabled pass**: the counterfactual where every symbol is analyzed on
//!    every tick.
//!
//! The enabled pass is a fold over `(tracker, accumulators)` and can be split at
//! any tick boundary and resumed with identical results.

use chrono::{Duration, NaiveDate, NaiveTime};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, GateConfig};
use crate::health::clock::{datetime_to_nanos, format_nanos, secs_to_nanos, Nanos, SimClock};
use crate::health::gate::run_gated_check;
use crate::health::sanity::SanityThresholds;
use crate::health::tracker::{HealthConfig, SymbolHealthTracker};

use super::accumulator::CoverageAccumulator;
use super::guard::ensure_no_live_client;
use super::providers::{ReplayCandleProvider, ReplayTickerProvider};
use super::report::{
    report_digest, write_reports, CoverageReport, DeltaReport, DisabledCounts, ReportPaths,
    WindowInfo,
};
use super::snapshot_store::SnapshotStore;
use super::ReplayError;

/// Rows recorded this long before the window start are preloaded so the first
/// ticks see the last value recorded before midnight.
pub const PRELOAD_LOOKBACK_SECS: u64 = 3_600;

pub type Accumulators = BTreeMap<String, CoverageAccumulator>;

// =============================================================================
// WINDOW / TIMELINE
// =============================================================================

/// Inclusive UTC date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayWindow {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ReplayWindow {
    pub fn new(start_date: NaiveDate, end_date: NaiveDate) -> Result<Self, ReplayError> {
        if end_date < start_date {
            return Err(ReplayError::InvalidWindow {
                start: start_date,
                end: end_date,
            });
        }
        Ok(Self {
            start_date,
            end_date,
        })
    }

    /// `[start_date 00:00 UTC, end_date + 1 day 00:00 UTC)`.
    pub fn bounds(&self) -> (Nanos, Nanos) {
        let start = self.start_date.and_time(NaiveTime::MIN).and_utc();
        let end = (self.end_date + Duration::days(1))
            .and_time(NaiveTime::MIN)
            .and_utc();
        (datetime_to_nanos(&start), datetime_to_nanos(&end))
    }

    pub fn info(&self, tick_interval_secs: u64, tick_count: usize) -> WindowInfo {
        let (start, end) = self.bounds();
        WindowInfo {
            start_date: self.start_date.format("%Y-%m-%d").to_string(),
            end_date: self.end_date.format("%Y-%m-%d").to_string(),
            start_utc: format_nanos(start),
            end_utc: format_nanos(end),
            tick_interval_secs,
            tick_count,
        }
    }
}

/// Ticks at `start, start + interval, ...` strictly before `end`.
pub fn build_tick_timeline(start: Nanos, end: Nanos, interval: Nanos) -> Vec<Nanos> {
    if interval <= 0 || end <= start {
        return Vec::new();
    }
    let count = ((end - start - 1) / interval + 1) as usize;
    (0..count).map(|i| start + i as Nanos * interval).collect()
}

// =============================================================================
// PASSES
// =============================================================================

/// Everything the enabled pass reads. Borrowed so split passes share one load.
#[derive(Clone, Copy)]
pub struct ReplayInputs<'a> {
    pub symbols: &'a [String],
    pub ticks: &'a [Nanos],
    pub tickers: &'a ReplayTickerProvider,
    pub candles: &'a ReplayCandleProvider,
    pub thresholds: &'a SanityThresholds,
}

impl<'a> ReplayInputs<'a> {
    /// Same inputs restricted to a sub-range of ticks.
    pub fn with_ticks(&self, ticks: &'a [Nanos]) -> Self {
        Self { ticks, ..*self }
    }
}

/// Carry-over state of the enabled pass.
#[derive(Debug)]
pub struct PassState {
    pub tracker: SymbolHealthTracker,
    pub accumulators: Accumulators,
}

/// Enabled pass over `inputs.ticks`.
///
/// With `tracker`/`accumulators` from an earlier call over the preceding ticks,
/// continues exactly where that call stopped. The tracker is rebound to this
/// pass's simulated clock; its state path is ignored.
pub fn run_pass_enabled(
    inputs: &ReplayInputs<'_>,
    health: &HealthConfig,
    tracker: Option<SymbolHealthTracker>,
    accumulators: Option<Accumulators>,
) -> Result<PassState, ConfigError> {
    let clock = SimClock::new(inputs.ticks.first().copied().unwrap_or(0));
    let mut tracker = match tracker {
        Some(mut t) => {
            t.set_time_source(Arc::new(clock.clone()));
            t
        }
        None => SymbolHealthTracker::with_time_source(
            health.clone().in_memory(),
            Arc::new(clock.clone()),
        )?,
    };

    let mut accumulators = accumulators.unwrap_or_default();
    for symbol in inputs.symbols {
        accumulators
            .entry(symbol.clone())
            .or_insert_with(|| CoverageAccumulator::new(symbol.as_str()));
    }

    for &tick in inputs.ticks {
        clock.advance_to(tick);
        let tickers = inputs.tickers.view_at(tick);
        let candles = inputs.candles.view_at(tick);

        for symbol in inputs.symbols {
            let outcome =
                run_gated_check(&mut tracker, symbol, &tickers, &candles, inputs.thresholds);
            if let Some(acc) = accumulators.get_mut(symbol) {
                acc.record(tick, &outcome);
            }
        }
    }

    Ok(PassState {
        tracker,
        accumulators,
    })
}

/// Gate-disabled counterfactual: every symbol analyzed on every tick.
pub fn run_pass_disabled(symbols: &[String], ticks: &[Nanos]) -> BTreeMap<String, DisabledCounts> {
    let mut counts: BTreeMap<String, DisabledCounts> = symbols
        .iter()
        .map(|s| (s.clone(), DisabledCounts::default()))
        .collect();
    for _tick in ticks {
        for c in counts.values_mut() {
            c.cycles_total += 1;
            c.analyze_calls += 1;
        }
    }
    counts
}

// =============================================================================
// VERIFICATION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub deterministic: bool,
    pub resume_equivalent: bool,
    pub split_index: usize,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.deterministic && self.resume_equivalent
    }
}

/// Two independent enabled passes produce identical accumulators and trackers.
pub fn verify_determinism(inputs: &ReplayInputs<'_>, health: &HealthConfig) -> Result<bool, ConfigError> {
    let a = run_pass_enabled(inputs, health, None, None)?;
    let b = run_pass_enabled(inputs, health, None, None)?;
    let same = a.accumulators == b.accumulators
        && a.tracker.to_state_file() == b.tracker.to_state_file()
        && digest_of(&a.accumulators) == digest_of(&b.accumulators);
    if !same {
        warn!("replay is not deterministic");
    }
    Ok(same)
}

/// A full pass equals a pass split at `split_index` and resumed.
pub fn verify_resume_equivalence(
    inputs: &ReplayInputs<'_>,
    health: &HealthConfig,
    split_index: usize,
) -> Result<bool, ConfigError> {
    let split_index = split_index.min(inputs.ticks.len());
    let full = run_pass_enabled(inputs, health, None, None)?;

    let (head, tail) = inputs.ticks.split_at(split_index);
    let first = run_pass_enabled(&inputs.with_ticks(head), health, None, None)?;
    let resumed = run_pass_enabled(
        &inputs.with_ticks(tail),
        health,
        Some(first.tracker),
        Some(first.accumulators),
    )?;

    let same = full.accumulators == resumed.accumulators
        && full.tracker.to_state_file() == resumed.tracker.to_state_file();
    if !same {
        warn!(split_index, "split/resume replay diverged from full replay");
    }
    Ok(same)
}

fn digest_of(accumulators: &Accumulators) -> Option<String> {
    report_digest(accumulators).ok()
}

// =============================================================================
// END-TO-END
// =============================================================================

/// Snapshot data for one window, loaded once.
#[derive(Debug)]
pub struct ReplayDataset {
    pub symbols: Vec<String>,
    pub ticks: Vec<Nanos>,
    pub tickers: ReplayTickerProvider,
    pub candles: ReplayCandleProvider,
    pub skipped_rows: usize,
}

impl ReplayDataset {
    pub fn load(
        store: &SnapshotStore,
        window: &ReplayWindow,
        tick_interval_secs: u64,
    ) -> Result<Self, ReplayError> {
        let (start, end) = window.bounds();
        let symbols = store
            .discover_symbols(start, end)
            .map_err(ReplayError::Storage)?;
        if symbols.is_empty() {
            return Err(ReplayError::NoSymbols {
                start: window.start_date,
                end: window.end_date,
            });
        }

        let preload_from = start - secs_to_nanos(PRELOAD_LOOKBACK_SECS);
        let loaded = store
            .load_window(&symbols, preload_from, end)
            .map_err(ReplayError::Storage)?;
        info!(
            symbols = symbols.len(),
            rows = loaded.rows.len(),
            skipped = loaded.skipped_rows,
            "loaded replay dataset"
        );

        Ok(Self {
            ticks: build_tick_timeline(start, end, secs_to_nanos(tick_interval_secs)),
            tickers: ReplayTickerProvider::from_snapshots(&loaded.rows),
            candles: ReplayCandleProvider::from_snapshots(&loaded.rows),
            skipped_rows: loaded.skipped_rows,
            symbols,
        })
    }

    pub fn inputs<'a>(&'a self, thresholds: &'a SanityThresholds) -> ReplayInputs<'a> {
        ReplayInputs {
            symbols: &self.symbols,
            ticks: &self.ticks,
            tickers: &self.tickers,
            candles: &self.candles,
            thresholds,
        }
    }
}

/// Result of [`run_replay`].
#[derive(Debug)]
pub struct ReplayOutcome {
    pub symbols: Vec<String>,
    pub tick_count: usize,
    pub coverage: CoverageReport,
    pub delta: DeltaReport,
    pub paths: ReportPaths,
    /// SHA-256 of the coverage report JSON.
    pub coverage_digest: String,
    /// SHA-256 of the delta report JSON.
    pub delta_digest: String,
    pub verification: Option<VerificationReport>,
}

/// Replay `window` from `store` and write the reports to `output_dir`.
pub fn run_replay(
    store: &SnapshotStore,
    window: &ReplayWindow,
    config: &GateConfig,
    output_dir: &Path,
    verify: bool,
) -> Result<ReplayOutcome, ReplayError> {
    ensure_no_live_client()?;
    config.validate()?;

    let interval_secs = config.replay.tick_interval_secs;
    let dataset = ReplayDataset::load(store, window, interval_secs)?;
    let inputs = dataset.inputs(&config.thresholds);
    info!(
        start = %window.start_date,
        end = %window.end_date,
        ticks = dataset.ticks.len(),
        symbols = dataset.symbols.len(),
        "starting replay"
    );

    let enabled = run_pass_enabled(&inputs, &config.health, None, None)?;
    let disabled = run_pass_disabled(&dataset.symbols, &dataset.ticks);
    debug!(summary = ?enabled.tracker.health_summary(), "enabled pass finished");

    let info = window.info(interval_secs, dataset.ticks.len());
    let coverage = CoverageReport::build(info.clone(), &enabled.accumulators);
    let delta = DeltaReport::build(info, &enabled.accumulators, &disabled);
    for violation in &coverage.global.invariant_violations {
        warn!(%violation, "coverage invariant violated");
    }

    let paths = write_reports(output_dir, &coverage, &delta).map_err(|source| {
        ReplayError::Report {
            path: output_dir.to_path_buf(),
            source,
        }
    })?;
    info!(
        wasted_work_prevented = delta.totals.wasted_work_prevented,
        pct = delta.totals.wasted_work_prevented_pct,
        coverage = %paths.coverage_json.display(),
        "replay reports written"
    );

    let verification = if verify {
        let split_index = dataset.ticks.len() / 2;
        let report = VerificationReport {
            deterministic: verify_determinism(&inputs, &config.health)?,
            resume_equivalent: verify_resume_equivalence(&inputs, &config.health, split_index)?,
            split_index,
        };
        info!(?report, "replay verification finished");
        Some(report)
    } else {
        None
    };

    Ok(ReplayOutcome {
        tick_count: dataset.ticks.len(),
        symbols: dataset.symbols,
        coverage_digest: report_digest(&coverage).unwrap_or_default(),
        delta_digest: report_digest(&delta).unwrap_or_default(),
        coverage,
        delta,
        paths,
        verification,
    })
}
