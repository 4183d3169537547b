//! Coverage and Delta Reports
//!
//! Both reports are pure functions of the replay inputs: every map is ordered,
//! every ranking has a total tie-break, and no wall-clock value is embedded.
//! Two runs over the same window therefore produce byte-identical files.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use crate::health::persistence::write_atomic;
use crate::health::sanity::ReasonBucket;
use crate::health::tracker::HealthState;

use super::accumulator::CoverageAccumulator;

/// Ranked lists are truncated to this many entries.
pub const TOP_N: usize = 10;

// =============================================================================
// SHARED
// =============================================================================

/// Replayed window as recorded in both reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowInfo {
    pub start_date: String,
    pub end_date: String,
    pub start_utc: String,
    pub end_utc: String,
    pub tick_interval_secs: u64,
    pub tick_count: usize,
}

/// Per-symbol call counts from the gate-disabled pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisabledCounts {
    pub cycles_total: u64,
    pub analyze_calls: u64,
}

// =============================================================================
// COVERAGE REPORT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolCoverage {
    pub cycles_total: u64,
    pub cycles_sanity_pass: u64,
    pub sanity_fail_count: u64,
    pub skipped_count: u64,
    pub coverage_pct: f64,
    pub fail_reasons: BTreeMap<ReasonBucket, u64>,
    pub seconds_in_state: BTreeMap<HealthState, f64>,
    pub transitions: BTreeMap<String, u64>,
    pub suspension_count: u64,
    pub suspended_seconds: f64,
    pub probe_checks: u64,
    pub analyze_calls: u64,
    pub ticker_present: u64,
    pub ticker_absent: u64,
    pub final_state: HealthState,
}

impl SymbolCoverage {
    fn from_accumulator(acc: &CoverageAccumulator) -> Self {
        Self {
            cycles_total: acc.cycles_total,
            cycles_sanity_pass: acc.cycles_sanity_pass,
            sanity_fail_count: acc.sanity_fail_count,
            skipped_count: acc.skipped_count,
            coverage_pct: acc.coverage_pct(),
            fail_reasons: acc.fail_reasons.clone(),
            seconds_in_state: HealthState::ALL
                .iter()
                .map(|s| (*s, acc.seconds_in_state(*s)))
                .collect(),
            transitions: acc.transitions.clone(),
            suspension_count: acc.suspension_count,
            suspended_seconds: acc.suspended_seconds(),
            probe_checks: acc.probe_checks,
            analyze_calls: acc.analyze_calls,
            ticker_present: acc.ticker_present,
            ticker_absent: acc.ticker_absent,
            final_state: acc.last_state.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedEntry {
    pub symbol: String,
    pub suspension_count: u64,
    pub suspended_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonEntry {
    pub reason: ReasonBucket,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageGlobal {
    pub symbol_count: usize,
    pub total_cycles: u64,
    pub total_analyze_calls: u64,
    pub total_passes: u64,
    pub total_failures: u64,
    pub total_skipped: u64,
    pub avg_symbols_analyzed_per_cycle: f64,
    pub top_suspended: Vec<SuspendedEntry>,
    pub top_failure_reasons: Vec<ReasonEntry>,
    /// Empty on a healthy run.
    pub invariant_violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub window: WindowInfo,
    pub symbols: BTreeMap<String, SymbolCoverage>,
    pub global: CoverageGlobal,
}

impl CoverageReport {
    pub fn build(window: WindowInfo, accumulators: &BTreeMap<String, CoverageAccumulator>) -> Self {
        let symbols: BTreeMap<String, SymbolCoverage> = accumulators
            .iter()
            .map(|(sym, acc)| (sym.clone(), SymbolCoverage::from_accumulator(acc)))
            .collect();

        let total_cycles = accumulators.values().map(|a| a.cycles_total).sum();
        let total_analyze_calls: u64 = accumulators.values().map(|a| a.analyze_calls).sum();
        let avg_symbols_analyzed_per_cycle = if window.tick_count == 0 {
            0.0
        } else {
            total_analyze_calls as f64 / window.tick_count as f64
        };

        let invariant_violations = accumulators
            .iter()
            .flat_map(|(sym, acc)| invariant_violations(sym, acc, window.tick_count))
            .collect();

        let global = CoverageGlobal {
            symbol_count: accumulators.len(),
            total_cycles,
            total_analyze_calls,
            total_passes: accumulators.values().map(|a| a.cycles_sanity_pass).sum(),
            total_failures: accumulators.values().map(|a| a.sanity_fail_count).sum(),
            total_skipped: accumulators.values().map(|a| a.skipped_count).sum(),
            avg_symbols_analyzed_per_cycle,
            top_suspended: top_suspended(accumulators),
            top_failure_reasons: top_failure_reasons(accumulators),
            invariant_violations,
        };

        Self {
            window,
            symbols,
            global,
        }
    }
}

fn invariant_violations(symbol: &str, acc: &CoverageAccumulator, tick_count: usize) -> Vec<String> {
    let mut out = Vec::new();
    if !acc.cycle_invariant_holds() {
        out.push(format!(
            "{}: pass {} + fail {} + skipped {} != total {}",
            symbol, acc.cycles_sanity_pass, acc.sanity_fail_count, acc.skipped_count, acc.cycles_total
        ));
    }
    if acc.cycles_total != tick_count as u64 {
        out.push(format!(
            "{}: cycles_total {} != tick_count {}",
            symbol, acc.cycles_total, tick_count
        ));
    }
    out
}

/// Symbols ever suspended, by suspension count desc, then suspended time desc,
/// then name.
fn top_suspended(accumulators: &BTreeMap<String, CoverageAccumulator>) -> Vec<SuspendedEntry> {
    let mut entries: Vec<SuspendedEntry> = accumulators
        .iter()
        .filter(|(_, a)| a.suspension_count > 0)
        .map(|(sym, a)| SuspendedEntry {
            symbol: sym.clone(),
            suspension_count: a.suspension_count,
            suspended_seconds: a.suspended_seconds(),
        })
        .collect();
    entries.sort_by(|a, b| {
        b.suspension_count
            .cmp(&a.suspension_count)
            .then_with(|| b.suspended_seconds.total_cmp(&a.suspended_seconds))
            .then_with(|| a.symbol.cmp(&b.symbol))
    });
    entries.truncate(TOP_N);
    entries
}

/// Failure buckets across all symbols, by count desc then bucket name.
fn top_failure_reasons(accumulators: &BTreeMap<String, CoverageAccumulator>) -> Vec<ReasonEntry> {
    let mut totals: BTreeMap<ReasonBucket, u64> = BTreeMap::new();
    for acc in accumulators.values() {
        for (bucket, count) in &acc.fail_reasons {
            *totals.entry(*bucket).or_insert(0) += count;
        }
    }
    let mut entries: Vec<ReasonEntry> = totals
        .into_iter()
        .filter(|(_, count)| *count > 0)
        .map(|(reason, count)| ReasonEntry { reason, count })
        .collect();
    entries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.reason.as_str().cmp(b.reason.as_str()))
    });
    entries.truncate(TOP_N);
    entries
}

// =============================================================================
// DELTA REPORT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolDelta {
    pub enabled_analyze_calls: u64,
    pub disabled_analyze_calls: u64,
    pub wasted_work_prevented: i64,
    pub reached_degraded: bool,
    pub reached_suspended: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaTotals {
    pub enabled_analyze_calls: u64,
    pub disabled_analyze_calls: u64,
    pub wasted_work_prevented: i64,
    pub wasted_work_prevented_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaReport {
    pub window: WindowInfo,
    pub symbols: BTreeMap<String, SymbolDelta>,
    pub totals: DeltaTotals,
    pub symbols_reached_degraded: Vec<String>,
    pub symbols_reached_suspended: Vec<String>,
}

impl DeltaReport {
    pub fn build(
        window: WindowInfo,
        enabled: &BTreeMap<String, CoverageAccumulator>,
        disabled: &BTreeMap<String, DisabledCounts>,
    ) -> Self {
        let symbols: BTreeMap<String, SymbolDelta> = enabled
            .iter()
            .map(|(sym, acc)| {
                let disabled_calls = disabled.get(sym).map(|d| d.analyze_calls).unwrap_or(0);
                (
                    sym.clone(),
                    SymbolDelta {
                        enabled_analyze_calls: acc.analyze_calls,
                        disabled_analyze_calls: disabled_calls,
                        wasted_work_prevented: disabled_calls as i64 - acc.analyze_calls as i64,
                        reached_degraded: acc.reached(HealthState::Degraded),
                        reached_suspended: acc.reached(HealthState::Suspended),
                    },
                )
            })
            .collect();

        let enabled_total: u64 = symbols.values().map(|d| d.enabled_analyze_calls).sum();
        let disabled_total: u64 = symbols.values().map(|d| d.disabled_analyze_calls).sum();
        let wasted = disabled_total as i64 - enabled_total as i64;
        let wasted_pct = if disabled_total == 0 {
            0.0
        } else {
            wasted as f64 * 100.0 / disabled_total as f64
        };

        let symbols_reached_degraded = symbols
            .iter()
            .filter(|(_, d)| d.reached_degraded)
            .map(|(s, _)| s.clone())
            .collect();
        let symbols_reached_suspended = symbols
            .iter()
            .filter(|(_, d)| d.reached_suspended)
            .map(|(s, _)| s.clone())
            .collect();

        Self {
            window,
            totals: DeltaTotals {
                enabled_analyze_calls: enabled_total,
                disabled_analyze_calls: disabled_total,
                wasted_work_prevented: wasted,
                wasted_work_prevented_pct: wasted_pct,
            },
            symbols,
            symbols_reached_degraded,
            symbols_reached_suspended,
        }
    }
}

// =============================================================================
// TEXT SUMMARIES
// =============================================================================

pub fn render_coverage_summary(report: &CoverageReport) -> String {
    let g = &report.global;
    let w = &report.window;
    let mut out = String::new();

    let _ = writeln!(out, "{}", "=".repeat(70));
    let _ = writeln!(out, "DATA GATE COVERAGE  {} .. {}", w.start_date, w.end_date);
    let _ = writeln!(out, "{}", "=".repeat(70));
    let _ = writeln!(out, "Window:              {} -> {}", w.start_utc, w.end_utc);
    let _ = writeln!(out, "Tick interval:       {}s ({} ticks)", w.tick_interval_secs, w.tick_count);
    let _ = writeln!(out, "Symbols:             {}", g.symbol_count);
    let _ = writeln!(out, "Cycles:              {}", g.total_cycles);
    let _ = writeln!(out, "  passed:            {}", g.total_passes);
    let _ = writeln!(out, "  failed:            {}", g.total_failures);
    let _ = writeln!(out, "  skipped:           {}", g.total_skipped);
    let _ = writeln!(out, "Analyze calls:       {}", g.total_analyze_calls);
    let _ = writeln!(out, "Avg analyzed/cycle:  {:.2}", g.avg_symbols_analyzed_per_cycle);

    let _ = writeln!(out, "\nTop suspended symbols:");
    if g.top_suspended.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for e in &g.top_suspended {
        let _ = writeln!(
            out,
            "  {:<16} suspensions={:<4} suspended={:.0}s",
            e.symbol, e.suspension_count, e.suspended_seconds
        );
    }

    let _ = writeln!(out, "\nTop failure reasons:");
    if g.top_failure_reasons.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for e in &g.top_failure_reasons {
        let _ = writeln!(out, "  {:<16} {}", e.reason.as_str(), e.count);
    }

    let _ = writeln!(out, "\nInvariant violations: {}", g.invariant_violations.len());
    for v in &g.invariant_violations {
        let _ = writeln!(out, "  {}", v);
    }
    let _ = writeln!(out, "\nReport digest: {}", digest_or_dash(report));
    out
}

pub fn render_delta_summary(report: &DeltaReport) -> String {
    let t = &report.totals;
    let mut out = String::new();

    let _ = writeln!(out, "{}", "=".repeat(70));
    let _ = writeln!(
        out,
        "DATA GATE DELTA  {} .. {}",
        report.window.start_date, report.window.end_date
    );
    let _ = writeln!(out, "{}", "=".repeat(70));
    let _ = writeln!(out, "Analyze calls (gate off):  {}", t.disabled_analyze_calls);
    let _ = writeln!(out, "Analyze calls (gate on):   {}", t.enabled_analyze_calls);
    let _ = writeln!(
        out,
        "Wasted work prevented:     {} ({:.2}%)",
        t.wasted_work_prevented, t.wasted_work_prevented_pct
    );
    let _ = writeln!(
        out,
        "Reached DEGRADED:          {}",
        report.symbols_reached_degraded.len()
    );
    let _ = writeln!(
        out,
        "Reached SUSPENDED:         {}",
        report.symbols_reached_suspended.len()
    );
    for sym in &report.symbols_reached_suspended {
        let _ = writeln!(out, "  {}", sym);
    }
    let _ = writeln!(out, "\nReport digest: {}", digest_or_dash(report));
    out
}

fn digest_or_dash<T: Serialize>(value: &T) -> String {
    report_digest(value).unwrap_or_else(|_| "-".to_string())
}

// =============================================================================
// OUTPUT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportPaths {
    pub coverage_json: PathBuf,
    pub coverage_summary: PathBuf,
    pub delta_json: PathBuf,
    pub delta_summary: PathBuf,
}

impl ReportPaths {
    /// `coverage_<start>_<end>.json` / `coverage_<start>_<end>_summary.txt` and the
    /// matching delta pair under `dir`.
    pub fn for_window(dir: &Path, window: &WindowInfo) -> Self {
        let stem = |kind: &str| format!("{}_{}_{}", kind, window.start_date, window.end_date);
        let coverage = stem("coverage");
        let delta = stem("delta");
        Self {
            coverage_json: dir.join(format!("{}.json", coverage)),
            coverage_summary: dir.join(format!("{}_summary.txt", coverage)),
            delta_json: dir.join(format!("{}.json", delta)),
            delta_summary: dir.join(format!("{}_summary.txt", delta)),
        }
    }

    pub fn all(&self) -> [&Path; 4] {
        [
            self.coverage_json.as_path(),
            self.coverage_summary.as_path(),
            self.delta_json.as_path(),
            self.delta_summary.as_path(),
        ]
    }
}

/// Write all four report files atomically.
pub fn write_reports(
    dir: &Path,
    coverage: &CoverageReport,
    delta: &DeltaReport,
) -> io::Result<ReportPaths> {
    std::fs::create_dir_all(dir)?;
    let paths = ReportPaths::for_window(dir, &coverage.window);

    write_atomic(&paths.coverage_json, &to_pretty_json(coverage)?)?;
    write_atomic(
        &paths.coverage_summary,
        render_coverage_summary(coverage).as_bytes(),
    )?;
    write_atomic(&paths.delta_json, &to_pretty_json(delta)?)?;
    write_atomic(&paths.delta_summary, render_delta_summary(delta).as_bytes())?;
    Ok(paths)
}

fn to_pretty_json<T: Serialize>(value: &T) -> io::Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// SHA-256 of the canonical JSON encoding, lowercase hex.
pub fn report_digest<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let bytes = serde_json::to_vec(value)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::clock::NANOS_PER_SEC;
    use crate::health::gate::GateOutcome;
    use crate::health::sanity::SanityResult;

    fn window(tick_count: usize) -> WindowInfo {
        WindowInfo {
            start_date: "2024-01-25".into(),
            end_date: "2024-01-25".into(),
            start_utc: "2024-01-25T00:00:00Z".into(),
            end_utc: "2024-01-26T00:00:00Z".into(),
            tick_interval_secs: 300,
            tick_count,
        }
    }

    fn fail(state: HealthState, reason: &str) -> GateOutcome {
        GateOutcome::Checked {
            result: SanityResult::fail(reason),
            probe: false,
            ticker_present: true,
            transition: None,
            state,
        }
    }

    /// Accumulator that entered SUSPENDED `suspensions` times.
    fn suspended_acc(symbol: &str, suspensions: u64, hold_secs: i64) -> CoverageAccumulator {
        let mut acc = CoverageAccumulator::new(symbol);
        let mut t = 0;
        for _ in 0..suspensions {
            acc.record(t, &fail(HealthState::Degraded, "volume_too_low:1<2"));
            t += NANOS_PER_SEC;
            acc.record(t, &fail(HealthState::Suspended, "volume_too_low:1<2"));
            t += hold_secs * NANOS_PER_SEC;
        }
        acc.record(t, &GateOutcome::Skipped { state: HealthState::Suspended });
        acc
    }

    #[test]
    fn test_top_suspended_ordering() {
        let mut accs = BTreeMap::new();
        for (sym, n, hold) in [
            ("AAA", 1, 100),
            ("BBB", 2, 10),
            ("CCC", 1, 500),
            ("DDD", 1, 100),
        ] {
            accs.insert(sym.to_string(), suspended_acc(sym, n, hold));
        }
        for i in 0..12 {
            let sym = format!("Z{:02}", i);
            accs.insert(sym.clone(), suspended_acc(&sym, 1, 1));
        }
        accs.insert("CLEAN".into(), CoverageAccumulator::new("CLEAN"));

        let report = CoverageReport::build(window(0), &accs);
        let order: Vec<&str> = report
            .global
            .top_suspended
            .iter()
            .map(|e| e.symbol.as_str())
            .collect();
        assert_eq!(order.len(), TOP_N);
        assert_eq!(&order[..4], &["BBB", "CCC", "AAA", "DDD"]);
        assert_eq!(&order[4..], &["Z00", "Z01", "Z02", "Z03", "Z04", "Z05"]);
    }

    #[test]
    fn test_failure_reason_ranking() {
        let mut acc = CoverageAccumulator::new("X");
        acc.record(0, &fail(HealthState::Healthy, "spread_too_wide:0.5>=0.01"));
        acc.record(1, &fail(HealthState::Healthy, "no_ticker"));
        acc.record(2, &fail(HealthState::Healthy, "no_ticker"));
        acc.record(3, &fail(HealthState::Healthy, "candle_count_low:3<200"));
        let accs: BTreeMap<_, _> = [("X".to_string(), acc)].into_iter().collect();

        let report = CoverageReport::build(window(4), &accs);
        let reasons: Vec<_> = report
            .global
            .top_failure_reasons
            .iter()
            .map(|e| (e.reason, e.count))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (ReasonBucket::NoTicker, 2),
                (ReasonBucket::CandleCount, 1),
                (ReasonBucket::Spread, 1),
            ]
        );
        assert!(report.global.invariant_violations.is_empty());
        assert_eq!(report.global.avg_symbols_analyzed_per_cycle, 1.0);
    }

    #[test]
    fn test_tick_count_mismatch_is_reported() {
        let mut acc = CoverageAccumulator::new("X");
        acc.record(0, &fail(HealthState::Healthy, "no_ticker"));
        let accs: BTreeMap<_, _> = [("X".to_string(), acc)].into_iter().collect();
        let report = CoverageReport::build(window(2), &accs);
        assert_eq!(report.global.invariant_violations.len(), 1);
    }

    #[test]
    fn test_delta_totals() {
        let mut enabled = BTreeMap::new();
        enabled.insert("A".to_string(), suspended_acc("A", 1, 60));
        enabled.insert("B".to_string(), CoverageAccumulator::new("B"));
        let disabled: BTreeMap<_, _> = [
            ("A".to_string(), DisabledCounts { cycles_total: 10, analyze_calls: 10 }),
            ("B".to_string(), DisabledCounts { cycles_total: 10, analyze_calls: 10 }),
        ]
        .into_iter()
        .collect();

        let delta = DeltaReport::build(window(10), &enabled, &disabled);
        assert_eq!(delta.symbols["A"].enabled_analyze_calls, 2);
        assert_eq!(delta.symbols["A"].wasted_work_prevented, 8);
        assert_eq!(delta.symbols["B"].wasted_work_prevented, 10);
        assert_eq!(delta.totals.wasted_work_prevented, 18);
        assert_eq!(delta.totals.wasted_work_prevented_pct, 90.0);
        assert_eq!(delta.symbols_reached_suspended, vec!["A"]);
        assert_eq!(delta.symbols_reached_degraded, vec!["A"]);
    }

    #[test]
    fn test_written_files_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let accs: BTreeMap<_, _> = [("A".to_string(), suspended_acc("A", 1, 60))]
            .into_iter()
            .collect();
        let coverage = CoverageReport::build(window(3), &accs);
        let delta = DeltaReport::build(window(3), &accs, &BTreeMap::new());

        let paths = write_reports(dir.path(), &coverage, &delta).unwrap();
        assert!(paths.coverage_json.ends_with("coverage_2024-01-25_2024-01-25.json"));
        assert!(paths.coverage_summary.ends_with("coverage_2024-01-25_2024-01-25_summary.txt"));
        assert!(paths.delta_json.ends_with("delta_2024-01-25_2024-01-25.json"));
        assert!(paths.delta_summary.ends_with("delta_2024-01-25_2024-01-25_summary.txt"));
        for p in paths.all() {
            assert!(p.exists(), "{:?} missing", p);
        }

        let parsed: CoverageReport =
            serde_json::from_slice(&std::fs::read(&paths.coverage_json).unwrap()).unwrap();
        assert_eq!(parsed.window, coverage.window);
        assert_eq!(parsed.symbols["A"].suspension_count, 1);

        // Rewriting the same reports yields identical bytes.
        let again = tempfile::tempdir().unwrap();
        let paths_again = write_reports(again.path(), &coverage, &delta).unwrap();
        for (a, b) in paths.all().iter().zip(paths_again.all().iter()) {
            assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
        }

        let digest = report_digest(&coverage).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, report_digest(&coverage.clone()).unwrap());
    }
}
