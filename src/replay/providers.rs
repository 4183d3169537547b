//! Replay Market Data Providers
//!
//! Zero-order hold over recorded snapshots: a query at simulated time `t`
//! returns the most recent row with `ts <= t` for that symbol, or nothing if no
//! such row exists. Nothing after `t` is ever visible.
//!
//! Both providers hand out lightweight views bound to one timestamp; the views
//! implement the same [`TickerSource`] / [`CandleSource`] traits the live gate
//! consumes.

use std::collections::{BTreeMap, HashMap};

use crate::health::clock::{Nanos, NANOS_PER_HOUR};
use crate::health::sanity::{parse_timeframe_hours, Candle, CandleSource, Ticker, TickerSource};

use super::snapshot_store::MarketSnapshot;

/// Upper bound on candles reconstructed from a recorded count. Larger counts
/// are treated as corrupt.
pub const MAX_RECONSTRUCTED_CANDLES: u64 = 100_000;

// =============================================================================
// TICKERS
// =============================================================================

#[derive(Debug, Clone)]
struct TickerPoint {
    ts: Nanos,
    /// `None` when the recorder flagged an error and captured no prices.
    ticker: Option<Ticker>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayTickerProvider {
    series: HashMap<String, Vec<TickerPoint>>,
}

impl ReplayTickerProvider {
    /// Index rows by symbol. Rows must already be time-sorted within a symbol;
    /// equal timestamps resolve to the later row.
    pub fn from_snapshots(rows: &[MarketSnapshot]) -> Self {
        let mut series: HashMap<String, Vec<TickerPoint>> = HashMap::new();
        for row in rows {
            series
                .entry(row.symbol.clone())
                .or_default()
                .push(TickerPoint {
                    ts: row.ts,
                    ticker: ticker_from_row(row),
                });
        }
        for points in series.values_mut() {
            points.sort_by_key(|p| p.ts);
        }
        Self { series }
    }

    /// Ticker in effect for `symbol` at `ts`.
    pub fn ticker_at(&self, symbol: &str, ts: Nanos) -> Option<Ticker> {
        let points = self.series.get(symbol)?;
        let idx = points.partition_point(|p| p.ts <= ts);
        if idx == 0 {
            return None;
        }
        points[idx - 1].ticker.clone()
    }

    pub fn view_at(&self, ts: Nanos) -> TickerView<'_> {
        TickerView { provider: self, ts }
    }

    pub fn symbol_count(&self) -> usize {
        self.series.len()
    }
}

fn ticker_from_row(row: &MarketSnapshot) -> Option<Ticker> {
    let ticker = Ticker {
        bid: row.bid,
        ask: row.ask,
        volume_24h_usd: row.volume_24h_usd,
        spread_pct: row.spread_pct,
    };
    if row.error_code.is_some() && !ticker.has_price() {
        return None;
    }
    Some(ticker)
}

/// [`ReplayTickerProvider`] frozen at one simulated instant.
#[derive(Debug, Clone, Copy)]
pub struct TickerView<'a> {
    provider: &'a ReplayTickerProvider,
    ts: Nanos,
}

impl TickerSource for TickerView<'_> {
    fn futures_ticker(&self, symbol: &str) -> Option<Ticker> {
        self.provider.ticker_at(symbol, self.ts)
    }
}

// =============================================================================
// CANDLES
// =============================================================================

/// Recorded candle metadata for one timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleMeta {
    pub last_ts: Option<Nanos>,
    pub count: u64,
}

#[derive(Debug, Clone)]
struct CandlePoint {
    ts: Nanos,
    frames: BTreeMap<String, CandleMeta>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayCandleProvider {
    series: HashMap<String, Vec<CandlePoint>>,
}

impl ReplayCandleProvider {
    pub fn from_snapshots(rows: &[MarketSnapshot]) -> Self {
        let mut series: HashMap<String, Vec<CandlePoint>> = HashMap::new();
        for row in rows {
            let frames = row
                .candle_count
                .iter()
                .map(|(tf, count)| {
                    (
                        tf.clone(),
                        CandleMeta {
                            last_ts: row.last_candle_ts.get(tf).copied(),
                            count: *count,
                        },
                    )
                })
                .collect();
            series
                .entry(row.symbol.clone())
                .or_default()
                .push(CandlePoint { ts: row.ts, frames });
        }
        for points in series.values_mut() {
            points.sort_by_key(|p| p.ts);
        }
        Self { series }
    }

    /// Metadata in effect for `symbol`/`timeframe` at `ts`.
    pub fn meta_at(&self, symbol: &str, timeframe: &str, ts: Nanos) -> Option<CandleMeta> {
        let points = self.series.get(symbol)?;
        let idx = points.partition_point(|p| p.ts <= ts);
        if idx == 0 {
            return None;
        }
        points[idx - 1].frames.get(timeframe).copied()
    }

    /// Reconstruct `count` synthetic candles ending exactly at the recorded
    /// newest timestamp, spaced one timeframe apart. Missing or malformed
    /// metadata yields an empty list.
    pub fn candles_at(&self, symbol: &str, timeframe: &str, ts: Nanos) -> Vec<Candle> {
        let Some(meta) = self.meta_at(symbol, timeframe, ts) else {
            return Vec::new();
        };
        let (Some(last_ts), Some(step)) = (meta.last_ts, timeframe_step(timeframe)) else {
            return Vec::new();
        };
        if meta.count == 0 || meta.count > MAX_RECONSTRUCTED_CANDLES {
            return Vec::new();
        }

        let count = meta.count as i64;
        // Oldest candle must be representable; everything after it lies
        // between it and `last_ts`.
        let Some(first_ts) = (count - 1)
            .checked_mul(step)
            .and_then(|span| last_ts.checked_sub(span))
        else {
            return Vec::new();
        };
        (0..count).map(|i| Candle::at(first_ts + i * step)).collect()
    }

    pub fn view_at(&self, ts: Nanos) -> CandleView<'_> {
        CandleView { provider: self, ts }
    }
}

fn timeframe_step(timeframe: &str) -> Option<Nanos> {
    let hours = parse_timeframe_hours(timeframe)?;
    let step = (hours * NANOS_PER_HOUR as f64).round() as Nanos;
    (step > 0).then_some(step)
}

/// [`ReplayCandleProvider`] frozen at one simulated instant.
#[derive(Debug, Clone, Copy)]
pub struct CandleView<'a> {
    provider: &'a ReplayCandleProvider,
    ts: Nanos,
}

impl CandleSource for CandleView<'_> {
    fn get_candles(&self, symbol: &str, timeframe: &str) -> Vec<Candle> {
        self.provider.candles_at(symbol, timeframe, self.ts)
    }
}
