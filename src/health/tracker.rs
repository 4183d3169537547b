//! Per-Symbol Health Tracker
//!
//! One record per symbol, created lazily on first reference. Each record walks a
//! three-state machine:
//!
//! ```text
//!            N failures                 failure streak >= suspend_after
//!  HEALTHY ─────────────▶ DEGRADED ─────────────────────────────────▶ SUSPENDED
//!     ▲                      │                                          │
//!     └──── M consecutive passes ◀──────────────────────────────────────┘
//! ```
//!
//! Scheduling (`should_analyze`) is asked before the caller performs any I/O:
//! - HEALTHY: always analyze
//! - DEGRADED: every Nth cycle (N = `degraded_skip_ratio`)
//! - SUSPENDED: one probe per `probe_interval`
//!
//! The tracker owns its table, performs no internal locking and reads time only
//! through its [`TimeSource`], so the replay engine can drive it with a [`SimClock`].
//!
//! [`SimClock`]: super::clock::SimClock

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::clock::{format_nanos, secs_to_nanos, Nanos, SystemTimeSource, TimeSource};
use super::persistence::{
    load_state_file, save_state_file, PersistError, PersistOutcome, PersistedStateFile,
    PersistedSymbolState,
};
use crate::config::ConfigError;

// =============================================================================
// HEALTH STATE
// =============================================================================

/// Health tag for one symbol. The serialized names are part of the state-file
/// format and must not follow internal renames.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum HealthState {
    #[default]
    #[serde(rename = "HEALTHY")]
    Healthy,
    #[serde(rename = "DEGRADED")]
    Degraded,
    #[serde(rename = "SUSPENDED")]
    Suspended,
}

impl HealthState {
    pub const ALL: [HealthState; 3] = [
        HealthState::Healthy,
        HealthState::Degraded,
        HealthState::Suspended,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Degraded => "DEGRADED",
            HealthState::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HEALTHY" => Some(HealthState::Healthy),
            "DEGRADED" => Some(HealthState::Degraded),
            "SUSPENDED" => Some(HealthState::Suspended),
            _ => None,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change produced by `record_result`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
}

impl Transition {
    /// Key used in transition histograms, e.g. `HEALTHY_to_DEGRADED`.
    pub fn key(&self) -> String {
        transition_key(self.from, self.to)
    }
}

pub fn transition_key(from: HealthState, to: HealthState) -> String {
    format!("{}_to_{}", from.as_str(), to.as_str())
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Tracker configuration. Durations are whole seconds; the tracker converts
/// them to [`Nanos`] once at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that move HEALTHY -> DEGRADED.
    pub degrade_after_failures: u32,
    /// Consecutive passes that return DEGRADED/SUSPENDED -> HEALTHY.
    pub recover_after_successes: u32,
    /// Age of an unbroken failure streak that moves DEGRADED -> SUSPENDED.
    pub suspend_after_secs: u64,
    /// DEGRADED symbols are analyzed on every Nth cycle.
    pub degraded_skip_ratio: u64,
    /// Minimum spacing between recovery probes while SUSPENDED.
    pub probe_interval_secs: u64,
    /// Sliding window for the trust score.
    pub trust_window_secs: u64,
    /// Upper bound on retained trust observations per symbol.
    pub max_trust_samples: usize,
    /// Per-symbol cooldown for non-transition failure and skip logs.
    pub failure_log_cooldown_secs: u64,
    /// Minimum spacing between rate-limited `persist()` writes.
    pub persist_interval_secs: u64,
    /// State file. `None` disables persistence (replay).
    pub state_path: Option<PathBuf>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degrade_after_failures: 3,
            recover_after_successes: 3,
            suspend_after_secs: 6 * 3600,
            degraded_skip_ratio: 4,
            probe_interval_secs: 30 * 60,
            trust_window_secs: 3600,
            max_trust_samples: 1024,
            failure_log_cooldown_secs: 300,
            persist_interval_secs: 60,
            state_path: Some(PathBuf::from("runtime/symbol_health_state.json")),
        }
    }
}

impl HealthConfig {
    /// Same settings with persistence disabled.
    pub fn in_memory(mut self) -> Self {
        self.state_path = None;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.degrade_after_failures == 0 {
            return Err(ConfigError::invalid("degrade_after_failures", "must be >= 1"));
        }
        if self.recover_after_successes == 0 {
            return Err(ConfigError::invalid("recover_after_successes", "must be >= 1"));
        }
        if self.degraded_skip_ratio == 0 {
            return Err(ConfigError::invalid("degraded_skip_ratio", "must be >= 1"));
        }
        if self.suspend_after_secs == 0 {
            return Err(ConfigError::invalid("suspend_after_secs", "must be > 0"));
        }
        if self.probe_interval_secs == 0 {
            return Err(ConfigError::invalid("probe_interval_secs", "must be > 0"));
        }
        if self.trust_window_secs == 0 {
            return Err(ConfigError::invalid("trust_window_secs", "must be > 0"));
        }
        if self.max_trust_samples == 0 {
            return Err(ConfigError::invalid("max_trust_samples", "must be >= 1"));
        }
        Ok(())
    }
}

/// Resolved configuration in tracker units.
#[derive(Debug, Clone)]
struct TrackerParams {
    degrade_after_failures: u32,
    recover_after_successes: u32,
    suspend_after: Nanos,
    degraded_skip_ratio: u64,
    probe_interval: Nanos,
    trust_window: Nanos,
    max_trust_samples: usize,
    log_cooldown: Nanos,
    persist_interval: Nanos,
}

impl From<&HealthConfig> for TrackerParams {
    fn from(c: &HealthConfig) -> Self {
        Self {
            degrade_after_failures: c.degrade_after_failures,
            recover_after_successes: c.recover_after_successes,
            suspend_after: secs_to_nanos(c.suspend_after_secs),
            degraded_skip_ratio: c.degraded_skip_ratio,
            probe_interval: secs_to_nanos(c.probe_interval_secs),
            trust_window: secs_to_nanos(c.trust_window_secs),
            max_trust_samples: c.max_trust_samples,
            log_cooldown: secs_to_nanos(c.failure_log_cooldown_secs),
            persist_interval: secs_to_nanos(c.persist_interval_secs),
        }
    }
}

// =============================================================================
// PER-SYMBOL RECORD
// =============================================================================

/// One trust observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustObservation {
    pub ts: Nanos,
    pub passed: bool,
}

/// Health record for one symbol.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Start of the current unbroken failure streak.
    pub first_failure_ts: Option<Nanos>,
    /// Last probe let through while SUSPENDED.
    pub last_probe_ts: Option<Nanos>,
    /// Scheduling cycles seen since entering DEGRADED.
    pub cycle_counter: u64,
    pub trust_history: VecDeque<TrustObservation>,
    pub last_reason: Option<String>,
    last_failure_log: Option<Nanos>,
    last_skip_log: Option<Nanos>,
}

impl SymbolHealth {
    /// True when the record carries nothing a fresh record would not.
    fn is_default_healthy(&self) -> bool {
        self.state == HealthState::Healthy
            && self.consecutive_failures == 0
            && self.consecutive_successes == 0
            && self.first_failure_ts.is_none()
            && self.last_probe_ts.is_none()
            && self.cycle_counter == 0
            && self.trust_history.is_empty()
    }

    fn prune_trust(&mut self, now: Nanos, window: Nanos) {
        let cutoff = now.saturating_sub(window);
        while self.trust_history.front().is_some_and(|o| o.ts < cutoff) {
            self.trust_history.pop_front();
        }
    }

    fn push_trust(&mut self, obs: TrustObservation, window: Nanos, cap: usize) {
        self.trust_history.push_back(obs);
        self.prune_trust(obs.ts, window);
        while self.trust_history.len() > cap {
            self.trust_history.pop_front();
        }
    }

    fn to_persisted(&self) -> PersistedSymbolState {
        PersistedSymbolState {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            first_failure_ts_ns: self.first_failure_ts,
            last_probe_ts_ns: self.last_probe_ts,
            degraded_cycle: self.cycle_counter,
            trust_history: self.trust_history.iter().copied().collect(),
        }
    }

    fn from_persisted(p: PersistedSymbolState) -> Self {
        Self {
            state: p.state,
            consecutive_failures: p.consecutive_failures,
            consecutive_successes: p.consecutive_successes,
            first_failure_ts: p.first_failure_ts_ns,
            last_probe_ts: p.last_probe_ts_ns,
            cycle_counter: p.degraded_cycle,
            trust_history: p.trust_history.into_iter().collect(),
            ..Default::default()
        }
    }
}

/// Count of tracked symbols per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub suspended: usize,
}

// =============================================================================
// TRACKER
// =============================================================================

pub struct SymbolHealthTracker {
    params: TrackerParams,
    records: HashMap<String, SymbolHealth>,
    time: Arc<dyn TimeSource>,
    state_path: Option<PathBuf>,
    last_persist: Option<Nanos>,
}

impl fmt::Debug for SymbolHealthTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolHealthTracker")
            .field("params", &self.params)
            .field("symbols", &self.records.len())
            .field("state_path", &self.state_path)
            .finish()
    }
}

impl SymbolHealthTracker {
    /// Wall-clock tracker. Restores from `config.state_path` if present.
    pub fn new(config: HealthConfig) -> Result<Self, ConfigError> {
        Self::with_time_source(config, Arc::new(SystemTimeSource))
    }

    /// Tracker reading time from `time`. Restores from `config.state_path` if present;
    /// a missing or corrupt file starts clean.
    pub fn with_time_source(
        config: HealthConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut tracker = Self {
            params: TrackerParams::from(&config),
            records: HashMap::new(),
            time,
            state_path: config.state_path.clone(),
            last_persist: None,
        };

        if let Some(path) = config.state_path {
            match tracker.restore_from_path(&path) {
                Ok(0) => info!(path = %path.display(), "no persisted symbol health; starting clean"),
                Ok(n) => info!(path = %path.display(), symbols = n, "restored symbol health state"),
                Err(e) => warn!(error = %e, "symbol health state unreadable; starting clean"),
            }
        }
        Ok(tracker)
    }

    /// Rebind the time source (the replay orchestrator installs its SimClock here).
    pub fn set_time_source(&mut self, time: Arc<dyn TimeSource>) {
        self.time = time;
    }

    #[inline]
    pub fn now(&self) -> Nanos {
        self.time.now()
    }

    fn record_mut(&mut self, symbol: &str) -> &mut SymbolHealth {
        self.records.entry(symbol.to_string()).or_default()
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Decide whether `symbol` should be checked this cycle.
    pub fn should_analyze(&mut self, symbol: &str) -> bool {
        let now = self.now();
        let ratio = self.params.degraded_skip_ratio;
        let probe_interval = self.params.probe_interval;
        let log_cooldown = self.params.log_cooldown;
        let rec = self.record_mut(symbol);

        match rec.state {
            HealthState::Healthy => true,
            HealthState::Degraded => {
                rec.cycle_counter = rec.cycle_counter.wrapping_add(1);
                if rec.cycle_counter % ratio == 0 {
                    return true;
                }
                if cooldown_elapsed(rec.last_skip_log, now, log_cooldown) {
                    rec.last_skip_log = Some(now);
                    debug!(
                        symbol,
                        cycle = rec.cycle_counter,
                        ratio,
                        "skipping degraded symbol this cycle"
                    );
                }
                false
            }
            HealthState::Suspended => {
                let due = rec
                    .last_probe_ts
                    .map_or(true, |last| now.saturating_sub(last) >= probe_interval);
                if due {
                    rec.last_probe_ts = Some(now);
                    debug!(symbol, "probing suspended symbol");
                }
                due
            }
        }
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    /// Apply one check outcome. Returns the transition, if any.
    pub fn record_result(&mut self, symbol: &str, passed: bool, reason: &str) -> Option<Transition> {
        let now = self.now();
        let p = self.params.clone();
        let rec = self.record_mut(symbol);

        rec.push_trust(TrustObservation { ts: now, passed }, p.trust_window, p.max_trust_samples);
        rec.last_reason = Some(reason.to_string());

        let from = rec.state;
        let mut to = from;

        if passed {
            rec.consecutive_failures = 0;
            rec.first_failure_ts = None;
            rec.consecutive_successes = rec.consecutive_successes.saturating_add(1);
            if from != HealthState::Healthy && rec.consecutive_successes >= p.recover_after_successes {
                to = HealthState::Healthy;
                rec.consecutive_successes = 0;
                rec.last_probe_ts = None;
                rec.cycle_counter = 0;
            }
        } else {
            rec.consecutive_successes = 0;
            if rec.consecutive_failures == 0 {
                rec.first_failure_ts = Some(now);
            }
            rec.consecutive_failures = rec.consecutive_failures.saturating_add(1);

            match from {
                HealthState::Healthy if rec.consecutive_failures >= p.degrade_after_failures => {
                    to = HealthState::Degraded;
                    rec.cycle_counter = 0;
                }
                HealthState::Degraded => {
                    let streak_age = rec.first_failure_ts.map_or(0, |start| now.saturating_sub(start));
                    if streak_age >= p.suspend_after {
                        to = HealthState::Suspended;
                        rec.last_probe_ts = Some(now);
                    }
                }
                _ => {}
            }
        }

        rec.state = to;

        if to != from {
            let failures = rec.consecutive_failures;
            let streak_start = rec.first_failure_ts.map(format_nanos);
            match to {
                HealthState::Healthy => info!(
                    symbol,
                    from = %from,
                    to = %to,
                    "✅ symbol recovered"
                ),
                _ => warn!(
                    symbol,
                    from = %from,
                    to = %to,
                    failures,
                    streak_start = ?streak_start,
                    reason,
                    "⚠️ symbol health downgraded"
                ),
            }
            return Some(Transition { from, to });
        }

        if !passed && cooldown_elapsed(rec.last_failure_log, now, p.log_cooldown) {
            rec.last_failure_log = Some(now);
            debug!(
                symbol,
                state = %to,
                failures = rec.consecutive_failures,
                reason,
                "sanity check failed"
            );
        }
        None
    }

    // -------------------------------------------------------------------------
    // Trust score + introspection
    // -------------------------------------------------------------------------

    /// Fraction of passing checks inside the trust window. Symbols with no
    /// observations score 1.0.
    pub fn get_trust_score(&mut self, symbol: &str) -> f64 {
        let now = self.now();
        let window = self.params.trust_window;
        let Some(rec) = self.records.get_mut(symbol) else {
            return 1.0;
        };
        rec.prune_trust(now, window);
        if rec.trust_history.is_empty() {
            return 1.0;
        }
        let passed = rec.trust_history.iter().filter(|o| o.passed).count();
        passed as f64 / rec.trust_history.len() as f64
    }

    pub fn state_of(&self, symbol: &str) -> HealthState {
        self.records.get(symbol).map(|r| r.state).unwrap_or_default()
    }

    pub fn record(&self, symbol: &str) -> Option<&SymbolHealth> {
        self.records.get(symbol)
    }

    pub fn tracked_symbols(&self) -> Vec<&str> {
        let mut symbols: Vec<&str> = self.records.keys().map(String::as_str).collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn symbols_in_state(&self, state: HealthState) -> Vec<&str> {
        let mut symbols: Vec<&str> = self
            .records
            .iter()
            .filter(|(_, r)| r.state == state)
            .map(|(s, _)| s.as_str())
            .collect();
        symbols.sort_unstable();
        symbols
    }

    pub fn health_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for rec in self.records.values() {
            match rec.state {
                HealthState::Healthy => summary.healthy += 1,
                HealthState::Degraded => summary.degraded += 1,
                HealthState::Suspended => summary.suspended += 1,
            }
        }
        summary
    }

    /// Forget everything about `symbol` (it restarts HEALTHY on next reference).
    pub fn reset_symbol(&mut self, symbol: &str) -> bool {
        let removed = self.records.remove(symbol).is_some();
        if removed {
            info!(symbol, "symbol health reset");
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Serializable view of every non-default symbol.
    pub fn to_state_file(&self) -> PersistedStateFile {
        self.records
            .iter()
            .filter(|(_, r)| !r.is_default_healthy())
            .map(|(s, r)| (s.clone(), r.to_persisted()))
            .collect()
    }

    /// Replace records with the contents of a state file. Returns symbols loaded.
    pub fn apply_state_file(&mut self, file: PersistedStateFile) -> usize {
        let n = file.len();
        for (symbol, persisted) in file {
            self.records.insert(symbol, SymbolHealth::from_persisted(persisted));
        }
        n
    }

    /// Load records from `path`. A missing file loads nothing.
    pub fn restore_from_path(&mut self, path: &Path) -> Result<usize, PersistError> {
        match load_state_file(path)? {
            Some(file) => Ok(self.apply_state_file(file)),
            None => Ok(0),
        }
    }

    /// Rate-limited save. Never call on a latency-sensitive path.
    pub fn persist(&mut self) -> Result<PersistOutcome, PersistError> {
        let Some(path) = self.state_path.clone() else {
            return Ok(PersistOutcome::Disabled);
        };
        let now = self.now();
        if !cooldown_elapsed(self.last_persist, now, self.params.persist_interval) {
            return Ok(PersistOutcome::RateLimited);
        }
        self.write_state(&path, now)
    }

    /// Unconditional save (shutdown path).
    pub fn force_persist(&mut self) -> Result<PersistOutcome, PersistError> {
        let Some(path) = self.state_path.clone() else {
            return Ok(PersistOutcome::Disabled);
        };
        let now = self.now();
        self.write_state(&path, now)
    }

    /// Save to an explicit path regardless of configuration.
    pub fn persist_to(&self, path: &Path) -> Result<PersistOutcome, PersistError> {
        let file = self.to_state_file();
        let symbols = file.len();
        save_state_file(path, &file)?;
        Ok(PersistOutcome::Written { symbols })
    }

    fn write_state(&mut self, path: &Path, now: Nanos) -> Result<PersistOutcome, PersistError> {
        // Stamp before writing so a failing disk is retried on the next interval,
        // not on every cycle.
        self.last_persist = Some(now);
        let outcome = self.persist_to(path)?;
        debug!(path = %path.display(), ?outcome, "symbol health state persisted");
        Ok(outcome)
    }
}

#[inline]
fn cooldown_elapsed(last: Option<Nanos>, now: Nanos, cooldown: Nanos) -> bool {
    last.map_or(true, |t| now.saturating_sub(t) >= cooldown)
}
