//! Stateless Sanity Checks
//!
//! Pure functions grading one ticker/candle snapshot against configured limits.
//!
//! - **Stage A** ([`check_ticker_sanity`]): spread + 24h volume from the ticker.
//! - **Stage B** ([`check_candle_sanity`]): decision-timeframe candle count + freshness.
//!
//! Missing or malformed data is never an error here: it is a failing
//! [`SanityResult`] with a `prefix:detail` reason string.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::clock::{nanos_to_hours, Nanos};

// =============================================================================
// THRESHOLDS
// =============================================================================

/// Immutable limits applied by the stateless checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanityThresholds {
    /// Maximum `(ask - bid) / bid` before the ticker is rejected.
    pub max_spread_pct: f64,
    /// Minimum 24h quote volume in USD.
    pub min_volume_24h_usd: f64,
    /// Minimum number of decision-timeframe candles.
    pub min_candles: usize,
    /// Candle interval used for Stage B (e.g. "4h").
    pub decision_timeframe: String,
    /// Use the spot ticker when no futures ticker exists.
    pub allow_spot_fallback: bool,
}

impl Default for SanityThresholds {
    fn default() -> Self {
        Self {
            max_spread_pct: 0.01,
            min_volume_24h_usd: 1_000_000.0,
            min_candles: 200,
            decision_timeframe: "4h".to_string(),
            allow_spot_fallback: false,
        }
    }
}

/// Outcome of one stateless check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanityResult {
    pub passed: bool,
    pub reason: String,
}

impl SanityResult {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: "ok".to_string(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// MARKET DATA SHAPES
// =============================================================================

/// Best bid/ask + 24h volume for one symbol. Every field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    /// Pre-computed spread ratio, used only when bid/ask are absent.
    pub spread_pct: Option<f64>,
}

impl Ticker {
    pub fn new(bid: f64, ask: f64, volume_24h_usd: f64) -> Self {
        Self {
            bid: Some(bid),
            ask: Some(ask),
            volume_24h_usd: Some(volume_24h_usd),
            spread_pct: None,
        }
    }

    /// Spread as `(ask - bid) / bid`; `None` when undefined.
    pub fn spread_ratio(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => {
                if bid > 0.0 && ask > 0.0 && bid.is_finite() && ask.is_finite() {
                    Some((ask - bid) / bid)
                } else {
                    None
                }
            }
            _ => self.spread_pct.filter(|s| s.is_finite() && *s >= 0.0),
        }
    }

    pub fn has_price(&self) -> bool {
        self.bid.is_some() || self.ask.is_some() || self.spread_pct.is_some()
    }
}

/// One OHLCV candle. Only `timestamp` matters to Stage B.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: Nanos,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn at(timestamp: Nanos) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }
}

/// Candle provider: returns the candles for `symbol` on `timeframe`, oldest first.
pub trait CandleSource {
    fn get_candles(&self, symbol: &str, timeframe: &str) -> Vec<Candle>;
}

/// Ticker provider for Stage A.
pub trait TickerSource {
    fn futures_ticker(&self, symbol: &str) -> Option<Ticker>;

    fn spot_ticker(&self, _symbol: &str) -> Option<Ticker> {
        None
    }
}

// =============================================================================
// TIMEFRAMES
// =============================================================================

/// Parse a timeframe string ("15m", "1h", "4h", "1d", "1w") into hours.
pub fn parse_timeframe_hours(timeframe: &str) -> Option<f64> {
    let tf = timeframe.trim();
    let (idx, unit) = tf.char_indices().last()?;
    let value: u32 = tf[..idx].parse().ok()?;
    if value == 0 {
        return None;
    }
    let value = value as f64;
    match unit {
        'm' => Some(value / 60.0),
        'h' => Some(value),
        'd' => Some(value * 24.0),
        'w' => Some(value * 168.0),
        _ => None,
    }
}

/// Maximum tolerated age of the newest candle: `max(2 * tf, tf + 1)` hours.
#[inline]
pub fn max_candle_age_hours(timeframe_hours: f64) -> f64 {
    (2.0 * timeframe_hours).max(timeframe_hours + 1.0)
}

// =============================================================================
// STAGE A / STAGE B
// =============================================================================

/// Stage A: grade the ticker. Prefers futures; spot only if futures is absent and
/// fallback is enabled.
pub fn check_ticker_sanity(
    symbol: &str,
    futures: Option<&Ticker>,
    spot: Option<&Ticker>,
    thresholds: &SanityThresholds,
) -> SanityResult {
    let ticker = match (futures, spot) {
        (Some(t), _) => t,
        (None, Some(t)) if thresholds.allow_spot_fallback => t,
        (None, Some(_)) => return SanityResult::fail("no_ticker:spot_fallback_disabled"),
        (None, None) => return SanityResult::fail("no_ticker"),
    };

    let Some(spread) = ticker.spread_ratio() else {
        return SanityResult::fail(format!(
            "spread_undefined:bid={:?},ask={:?}",
            ticker.bid, ticker.ask
        ));
    };
    if spread >= thresholds.max_spread_pct {
        return SanityResult::fail(format!(
            "spread_too_wide:{:.4}>={:.4}",
            spread, thresholds.max_spread_pct
        ));
    }

    let volume = ticker.volume_24h_usd.filter(|v| v.is_finite()).unwrap_or(0.0);
    if volume < thresholds.min_volume_24h_usd {
        return SanityResult::fail(format!(
            "volume_too_low:{:.0}<{:.0}",
            volume, thresholds.min_volume_24h_usd
        ));
    }

    tracing::trace!(symbol, spread, volume, "ticker sanity passed");
    SanityResult::pass()
}

/// Stage B: grade the decision-timeframe candles at time `now`.
pub fn check_candle_sanity(
    symbol: &str,
    candles: &dyn CandleSource,
    thresholds: &SanityThresholds,
    now: Nanos,
) -> SanityResult {
    let timeframe = thresholds.decision_timeframe.as_str();
    let series = candles.get_candles(symbol, timeframe);

    if series.len() < thresholds.min_candles {
        return SanityResult::fail(format!(
            "candle_count_low:{}<{}",
            series.len(),
            thresholds.min_candles
        ));
    }
    let Some(newest) = series.last() else {
        return SanityResult::fail("candle_count_low:0");
    };

    let Some(tf_hours) = parse_timeframe_hours(timeframe) else {
        return SanityResult::fail(format!("bad_timeframe:{}", timeframe));
    };
    let max_age = max_candle_age_hours(tf_hours);
    let age = nanos_to_hours(now - newest.timestamp);
    if age > max_age {
        return SanityResult::fail(format!("stale_candle_age:{:.2}h>{:.2}h", age, max_age));
    }

    SanityResult::pass()
}

// =============================================================================
// REASON BUCKETS
// =============================================================================

/// Canonical failure buckets used for report aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonBucket {
    Spread,
    Volume,
    StaleCandles,
    CandleCount,
    NoTicker,
    Other,
}

impl ReasonBucket {
    pub const ALL: [ReasonBucket; 6] = [
        ReasonBucket::Spread,
        ReasonBucket::Volume,
        ReasonBucket::StaleCandles,
        ReasonBucket::CandleCount,
        ReasonBucket::NoTicker,
        ReasonBucket::Other,
    ];

    pub fn classify(reason: &str) -> Self {
        let prefix = reason.split(':').next().unwrap_or("");
        match prefix {
            "spread_too_wide" | "spread_undefined" => ReasonBucket::Spread,
            "volume_too_low" => ReasonBucket::Volume,
            "stale_candle_age" => ReasonBucket::StaleCandles,
            "candle_count_low" => ReasonBucket::CandleCount,
            "no_ticker" => ReasonBucket::NoTicker,
            _ => ReasonBucket::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonBucket::Spread => "spread",
            ReasonBucket::Volume => "volume",
            ReasonBucket::StaleCandles => "stale_candles",
            ReasonBucket::CandleCount => "candle_count",
            ReasonBucket::NoTicker => "no_ticker",
            ReasonBucket::Other => "other",
        }
    }
}

impl fmt::Display for ReasonBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::clock::NANOS_PER_HOUR;

    struct FixedCandles {
        count: usize,
        newest: Nanos,
    }

    impl CandleSource for FixedCandles {
        fn get_candles(&self, _symbol: &str, _timeframe: &str) -> Vec<Candle> {
            (0..self.count)
                .map(|i| Candle::at(self.newest - (self.count - 1 - i) as i64 * 4 * NANOS_PER_HOUR))
                .collect()
        }
    }

    fn example_thresholds() -> SanityThresholds {
        SanityThresholds {
            max_spread_pct: 0.10,
            min_volume_24h_usd: 10_000.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_ticker_examples() {
        let t = example_thresholds();

        let wide = check_ticker_sanity("BTCUSDT", Some(&Ticker::new(100.0, 120.0, 50_000.0)), None, &t);
        assert!(!wide.passed);
        assert_eq!(ReasonBucket::classify(&wide.reason), ReasonBucket::Spread);

        let thin = check_ticker_sanity("BTCUSDT", Some(&Ticker::new(100.0, 101.0, 9_999.0)), None, &t);
        assert!(!thin.passed);
        assert_eq!(ReasonBucket::classify(&thin.reason), ReasonBucket::Volume);

        let ok = check_ticker_sanity("BTCUSDT", Some(&Ticker::new(100.0, 101.0, 50_000.0)), None, &t);
        assert!(ok.passed, "{}", ok.reason);
    }

    #[test]
    fn test_spread_at_limit_fails() {
        let t = example_thresholds();
        let r = check_ticker_sanity("X", Some(&Ticker::new(100.0, 110.0, 50_000.0)), None, &t);
        assert!(!r.passed);
        assert!(r.reason.starts_with("spread_too_wide"));
    }

    #[test]
    fn test_undefined_spread_fails() {
        let t = example_thresholds();
        let r = check_ticker_sanity("X", Some(&Ticker::new(0.0, 101.0, 50_000.0)), None, &t);
        assert!(!r.passed);
        assert!(r.reason.starts_with("spread_undefined"));
        assert_eq!(ReasonBucket::classify(&r.reason), ReasonBucket::Spread);
    }

    #[test]
    fn test_spot_fallback() {
        let mut t = example_thresholds();
        let spot = Ticker::new(100.0, 101.0, 50_000.0);

        let r = check_ticker_sanity("X", None, Some(&spot), &t);
        assert!(!r.passed);
        assert_eq!(ReasonBucket::classify(&r.reason), ReasonBucket::NoTicker);

        t.allow_spot_fallback = true;
        assert!(check_ticker_sanity("X", None, Some(&spot), &t).passed);

        let none = check_ticker_sanity("X", None, None, &t);
        assert_eq!(none.reason, "no_ticker");
    }

    #[test]
    fn test_futures_preferred_over_spot() {
        let mut t = example_thresholds();
        t.allow_spot_fallback = true;
        let bad_futures = Ticker::new(100.0, 150.0, 50_000.0);
        let good_spot = Ticker::new(100.0, 101.0, 50_000.0);
        assert!(!check_ticker_sanity("X", Some(&bad_futures), Some(&good_spot), &t).passed);
    }

    #[test]
    fn test_precomputed_spread_used_without_prices() {
        let t = example_thresholds();
        let ticker = Ticker {
            spread_pct: Some(0.01),
            volume_24h_usd: Some(50_000.0),
            ..Default::default()
        };
        assert!(check_ticker_sanity("X", Some(&ticker), None, &t).passed);
    }

    #[test]
    fn test_candle_examples() {
        let t = SanityThresholds {
            decision_timeframe: "4h".into(),
            min_candles: 200,
            ..Default::default()
        };
        let now = 1_700_000_000 * crate::health::clock::NANOS_PER_SEC;

        let fresh = FixedCandles { count: 260, newest: now - 7 * NANOS_PER_HOUR };
        assert!(check_candle_sanity("X", &fresh, &t, now).passed);

        let stale = FixedCandles { count: 260, newest: now - 12 * NANOS_PER_HOUR };
        let r = check_candle_sanity("X", &stale, &t, now);
        assert!(!r.passed);
        assert_eq!(ReasonBucket::classify(&r.reason), ReasonBucket::StaleCandles);

        let short = FixedCandles { count: 120, newest: now };
        let r = check_candle_sanity("X", &short, &t, now);
        assert_eq!(r.reason, "candle_count_low:120<200");
    }

    #[test]
    fn test_max_candle_age() {
        assert_eq!(max_candle_age_hours(parse_timeframe_hours("1h").unwrap()), 2.0);
        assert_eq!(max_candle_age_hours(parse_timeframe_hours("4h").unwrap()), 8.0);
        assert_eq!(max_candle_age_hours(parse_timeframe_hours("1d").unwrap()), 48.0);
        assert_eq!(max_candle_age_hours(parse_timeframe_hours("15m").unwrap()), 1.25);
        assert!(parse_timeframe_hours("4x").is_none());
        assert!(parse_timeframe_hours("0h").is_none());
        assert!(parse_timeframe_hours("h").is_none());
        assert!(parse_timeframe_hours("").is_none());
        assert!(parse_timeframe_hours("4é").is_none());
        assert!(parse_timeframe_hours("é").is_none());
        assert!(parse_timeframe_hours("1é4h").is_none());
    }

    #[test]
    fn test_reason_buckets() {
        assert_eq!(ReasonBucket::classify("candle_count_low:3<200"), ReasonBucket::CandleCount);
        assert_eq!(ReasonBucket::classify("no_ticker:spot_fallback_disabled"), ReasonBucket::NoTicker);
        assert_eq!(ReasonBucket::classify("something_else"), ReasonBucket::Other);
    }
}
