//! Gated Check Cycle
//!
//! The one code path both the live scheduler and the replay engine use for a
//! symbol on a cycle: ask the tracker, run Stage A, run Stage B only if Stage A
//! passed, then feed the verdict back into the tracker.

use super::sanity::{
    check_candle_sanity, check_ticker_sanity, CandleSource, SanityResult, SanityThresholds,
    TickerSource,
};
use super::tracker::{HealthState, SymbolHealthTracker, Transition};

/// What happened to one symbol on one cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// The tracker declined to analyze the symbol this cycle.
    Skipped { state: HealthState },
    /// Checks ran and the verdict was recorded.
    Checked {
        result: SanityResult,
        /// The symbol was SUSPENDED and this was a recovery probe.
        probe: bool,
        ticker_present: bool,
        transition: Option<Transition>,
        /// State after recording the verdict.
        state: HealthState,
    },
}

impl GateOutcome {
    pub fn state(&self) -> HealthState {
        match self {
            GateOutcome::Skipped { state } | GateOutcome::Checked { state, .. } => *state,
        }
    }

    pub fn analyzed(&self) -> bool {
        matches!(self, GateOutcome::Checked { .. })
    }

    pub fn passed(&self) -> bool {
        matches!(self, GateOutcome::Checked { result, .. } if result.passed)
    }
}

/// Run the Stage A/B pipeline for one symbol.
pub fn run_gated_check(
    tracker: &mut SymbolHealthTracker,
    symbol: &str,
    tickers: &dyn TickerSource,
    candles: &dyn CandleSource,
    thresholds: &SanityThresholds,
) -> GateOutcome {
    let state_before = tracker.state_of(symbol);
    if !tracker.should_analyze(symbol) {
        return GateOutcome::Skipped {
            state: state_before,
        };
    }

    let futures = tickers.futures_ticker(symbol);
    let spot = if futures.is_none() && thresholds.allow_spot_fallback {
        tickers.spot_ticker(symbol)
    } else {
        None
    };
    let ticker_present = futures.is_some() || spot.is_some();

    let mut result = check_ticker_sanity(symbol, futures.as_ref(), spot.as_ref(), thresholds);
    if result.passed {
        result = check_candle_sanity(symbol, candles, thresholds, tracker.now());
    }

    let transition = tracker.record_result(symbol, result.passed, &result.reason);
    GateOutcome::Checked {
        result,
        probe: state_before == HealthState::Suspended,
        ticker_present,
        transition,
        state: tracker.state_of(symbol),
    }
}
