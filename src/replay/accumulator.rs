//! Per-symbol coverage counters for one replay pass.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::health::clock::{Nanos, NANOS_PER_SEC};
use crate::health::gate::GateOutcome;
use crate::health::sanity::ReasonBucket;
use crate::health::tracker::{transition_key, HealthState};

/// Counters for one symbol across a pass.
///
/// Every field is plain data so a half-finished pass can be serialized and
/// resumed later with identical results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageAccumulator {
    pub symbol: String,
    pub cycles_total: u64,
    pub cycles_sanity_pass: u64,
    pub sanity_fail_count: u64,
    pub skipped_count: u64,
    pub fail_reasons: BTreeMap<ReasonBucket, u64>,
    pub ns_in_state: BTreeMap<HealthState, i64>,
    pub transitions: BTreeMap<String, u64>,
    pub suspension_count: u64,
    pub suspended_ns: i64,
    pub probe_checks: u64,
    pub analyze_calls: u64,
    pub ticker_present: u64,
    pub ticker_absent: u64,
    pub states_seen: BTreeSet<HealthState>,
    pub last_state: Option<HealthState>,
    pub last_ts: Option<Nanos>,
}

impl CoverageAccumulator {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Default::default()
        }
    }

    /// Fold one cycle's outcome at simulated time `now`.
    ///
    /// Time since the previous cycle is charged to the state the symbol was in
    /// during that interval, before the new state is looked at.
    pub fn record(&mut self, now: Nanos, outcome: &GateOutcome) {
        if let (Some(prev_state), Some(prev_ts)) = (self.last_state, self.last_ts) {
            let elapsed = (now - prev_ts).max(0);
            *self.ns_in_state.entry(prev_state).or_insert(0) += elapsed;
            if prev_state == HealthState::Suspended {
                self.suspended_ns += elapsed;
            }
        }

        let state = outcome.state();
        // On the first cycle the state before the call comes from the
        // transition the tracker reported, if any.
        let prev_state = self.last_state.unwrap_or_else(|| match outcome {
            GateOutcome::Checked {
                transition: Some(t),
                ..
            } => t.from,
            _ => state,
        });
        self.states_seen.insert(prev_state);
        if prev_state != state {
            *self
                .transitions
                .entry(transition_key(prev_state, state))
                .or_insert(0) += 1;
            if state == HealthState::Suspended {
                self.suspension_count += 1;
            }
        }

        self.cycles_total += 1;
        match outcome {
            GateOutcome::Skipped { .. } => self.skipped_count += 1,
            GateOutcome::Checked {
                result,
                probe,
                ticker_present,
                ..
            } => {
                self.analyze_calls += 1;
                if *probe {
                    self.probe_checks += 1;
                }
                if *ticker_present {
                    self.ticker_present += 1;
                } else {
                    self.ticker_absent += 1;
                }
                if result.passed {
                    self.cycles_sanity_pass += 1;
                } else {
                    self.sanity_fail_count += 1;
                    *self
                        .fail_reasons
                        .entry(ReasonBucket::classify(&result.reason))
                        .or_insert(0) += 1;
                }
            }
        }

        self.states_seen.insert(state);
        self.last_state = Some(state);
        self.last_ts = Some(now);
    }

    /// `pass + fail + skipped == total`.
    pub fn cycle_invariant_holds(&self) -> bool {
        self.cycles_sanity_pass + self.sanity_fail_count + self.skipped_count == self.cycles_total
    }

    pub fn seconds_in_state(&self, state: HealthState) -> f64 {
        self.ns_in_state.get(&state).copied().unwrap_or(0) as f64 / NANOS_PER_SEC as f64
    }

    pub fn suspended_seconds(&self) -> f64 {
        self.suspended_ns as f64 / NANOS_PER_SEC as f64
    }

    pub fn transition_count(&self, key: &str) -> u64 {
        self.transitions.get(key).copied().unwrap_or(0)
    }

    /// Sanity pass rate over all cycles, in percent.
    pub fn coverage_pct(&self) -> f64 {
        if self.cycles_total == 0 {
            return 0.0;
        }
        self.cycles_sanity_pass as f64 / self.cycles_total as f64 * 100.0
    }

    pub fn reached(&self, state: HealthState) -> bool {
        self.states_seen.contains(&state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::sanity::SanityResult;
    use crate::health::tracker::Transition;

    const S: Nanos = NANOS_PER_SEC;

    fn checked(passed: bool, reason: &str, state: HealthState) -> GateOutcome {
        GateOutcome::Checked {
            result: SanityResult {
                passed,
                reason: reason.to_string(),
            },
            probe: false,
            ticker_present: !reason.starts_with("no_ticker"),
            transition: None,
            state,
        }
    }

    #[test]
    fn test_counts_and_buckets() {
        let mut acc = CoverageAccumulator::new("BTCUSDT");
        acc.record(0, &checked(true, "ok", HealthState::Healthy));
        acc.record(300 * S, &checked(false, "spread_too_wide:0.2>=0.01", HealthState::Healthy));
        acc.record(600 * S, &checked(false, "no_ticker", HealthState::Healthy));
        acc.record(900 * S, &GateOutcome::Skipped { state: HealthState::Healthy });

        assert_eq!(acc.cycles_total, 4);
        assert_eq!(acc.cycles_sanity_pass, 1);
        assert_eq!(acc.sanity_fail_count, 2);
        assert_eq!(acc.skipped_count, 1);
        assert_eq!(acc.analyze_calls, 3);
        assert_eq!(acc.ticker_absent, 1);
        assert_eq!(acc.fail_reasons.get(&ReasonBucket::Spread), Some(&1));
        assert_eq!(acc.fail_reasons.get(&ReasonBucket::NoTicker), Some(&1));
        assert!(acc.cycle_invariant_holds());
        assert_eq!(acc.coverage_pct(), 25.0);
    }

    #[test]
    fn test_time_charged_to_previous_state() {
        let mut acc = CoverageAccumulator::new("X");
        acc.record(0, &checked(false, "no_ticker", HealthState::Healthy));
        acc.record(100 * S, &checked(false, "no_ticker", HealthState::Degraded));
        acc.record(400 * S, &GateOutcome::Skipped { state: HealthState::Degraded });
        acc.record(1000 * S, &checked(false, "no_ticker", HealthState::Suspended));
        acc.record(1600 * S, &GateOutcome::Skipped { state: HealthState::Suspended });

        assert_eq!(acc.seconds_in_state(HealthState::Healthy), 100.0);
        assert_eq!(acc.seconds_in_state(HealthState::Degraded), 900.0);
        assert_eq!(acc.seconds_in_state(HealthState::Suspended), 600.0);
        assert_eq!(acc.suspended_seconds(), 600.0);

        assert_eq!(acc.transition_count("HEALTHY_to_DEGRADED"), 1);
        assert_eq!(acc.transition_count("DEGRADED_to_SUSPENDED"), 1);
        assert_eq!(acc.suspension_count, 1);
        assert!(acc.reached(HealthState::Suspended));
    }

    #[test]
    fn test_transition_on_first_cycle_counted() {
        let mut acc = CoverageAccumulator::new("X");
        acc.record(
            0,
            &GateOutcome::Checked {
                result: SanityResult::fail("no_ticker"),
                probe: false,
                ticker_present: false,
                transition: Some(Transition {
                    from: HealthState::Healthy,
                    to: HealthState::Degraded,
                }),
                state: HealthState::Degraded,
            },
        );
        acc.record(300 * S, &GateOutcome::Skipped { state: HealthState::Degraded });

        assert_eq!(acc.transition_count("HEALTHY_to_DEGRADED"), 1);
        assert!(acc.reached(HealthState::Healthy));
        assert!(acc.reached(HealthState::Degraded));
        assert_eq!(acc.seconds_in_state(HealthState::Degraded), 300.0);
        assert_eq!(acc.seconds_in_state(HealthState::Healthy), 0.0);
    }

    #[test]
    fn test_probe_counted() {
        let mut acc = CoverageAccumulator::new("X");
        acc.record(
            0,
            &GateOutcome::Checked {
                result: SanityResult::pass(),
                probe: true,
                ticker_present: true,
                transition: None,
                state: HealthState::Suspended,
            },
        );
        assert_eq!(acc.probe_checks, 1);
        assert_eq!(acc.suspension_count, 0);
    }

    #[test]
    fn test_serde_roundtrip_preserves_state() {
        let mut acc = CoverageAccumulator::new("X");
        acc.record(0, &checked(false, "volume_too_low:1<2", HealthState::Healthy));
        acc.record(60 * S, &checked(false, "volume_too_low:1<2", HealthState::Degraded));

        let json = serde_json::to_string(&acc).unwrap();
        let back: CoverageAccumulator = serde_json::from_str(&json).unwrap();
        assert_eq!(back, acc);
        assert!(json.contains("\"HEALTHY_to_DEGRADED\":1"));
    }
}
