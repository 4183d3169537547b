//! Symbol Health Gate
//!
//! Decides, per symbol and per scheduling cycle, whether market data is
//! trustworthy enough to run analysis, and tracks recovery when it is not.
//!
//! ```text
//!   caller ──▶ should_analyze ──▶ Stage A (ticker) ──▶ Stage B (candles) ──▶ record_result
//!                   │                                                            │
//!                   └──────────────── SymbolHealthTracker ◀──────────────────────┘
//!                                          │
//!                                   TimeSource (wall clock | SimClock)
//!                                          │
//!                                   state file (atomic JSON)
//! ```

pub mod clock;
pub mod gate;
pub mod persistence;
pub mod sanity;
pub mod tracker;


pub use clock::{Nanos, SimClock, SystemTimeSource, TimeSource, NANOS_PER_SEC};
pub use gate::{run_gated_check, GateOutcome};
pub use persistence::{PersistError, PersistOutcome, PersistedStateFile, PersistedSymbolState};
pub use sanity::{
    check_candle_sanity, check_ticker_sanity, Candle, CandleSource, ReasonBucket, SanityResult,
    SanityThresholds, Ticker, TickerSource,
};
pub use tracker::{
    HealthConfig, HealthState, HealthSummary, SymbolHealth, SymbolHealthTracker, Transition,
    TrustObservation,
};
