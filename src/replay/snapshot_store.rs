//! Recorded Market Snapshot Table
//!
//! Read access (plus an append path for fixtures and the recorder contract) to the
//! append-only `market_snapshots` table: one row per symbol per recording tick.
//!
//! - `ts_utc` is RFC3339 UTC text
//! - `last_candle_ts` / `candle_count` are JSON objects keyed by timeframe
//!   (`{"4h": "2024-01-25T00:00:00Z"}`, `{"4h": 260}`); candle timestamps may also be
//!   integer Unix milliseconds
//! - malformed timestamps drop the row; malformed JSON maps degrade to empty maps

use anyhow::{Context, Result};
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, Row};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::health::clock::{format_nanos, parse_timestamp, Nanos, NANOS_PER_MILLI};

// =============================================================================
// SCHEMA
// =============================================================================

const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS market_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_utc TEXT NOT NULL,
    symbol TEXT NOT NULL,
    futures_bid REAL,
    futures_ask REAL,
    futures_spread_pct REAL,
    futures_volume_24h REAL,
    open_interest REAL,
    funding_rate REAL,
    -- JSON: timeframe -> newest candle timestamp
    last_candle_ts TEXT,
    -- JSON: timeframe -> candle count
    candle_count TEXT,
    error_code TEXT
);

-- Range scans per symbol
CREATE INDEX IF NOT EXISTS idx_market_snapshots_symbol_ts
    ON market_snapshots(symbol, ts_utc);

-- Symbol discovery per window
CREATE INDEX IF NOT EXISTS idx_market_snapshots_ts
    ON market_snapshots(ts_utc);
"#;

const SELECT_COLUMNS: &str = "ts_utc, symbol, futures_bid, futures_ask, futures_spread_pct, \
     futures_volume_24h, open_interest, funding_rate, last_candle_ts, candle_count, error_code";

// =============================================================================
// ROW TYPE
// =============================================================================

/// One recorded row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketSnapshot {
    pub ts: Nanos,
    pub symbol: String,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub spread_pct: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    /// Informational only; never used for gating.
    pub open_interest: Option<f64>,
    /// Informational only; never used for gating.
    pub funding_rate: Option<f64>,
    pub last_candle_ts: BTreeMap<String, Nanos>,
    pub candle_count: BTreeMap<String, u64>,
    pub error_code: Option<String>,
}

/// Rows for a window plus the count of rows dropped as unreadable.
#[derive(Debug, Clone, Default)]
pub struct LoadedWindow {
    pub rows: Vec<MarketSnapshot>,
    pub skipped_rows: usize,
}

// =============================================================================
// STORE
// =============================================================================

pub struct SnapshotStore {
    conn: Connection,
}

impl SnapshotStore {
    /// Open (creating if needed) a writable store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open snapshot database: {:?}", path))?;
        conn.execute_batch(SNAPSHOT_SCHEMA)
            .context("Failed to create snapshot schema")?;
        Ok(Self { conn })
    }

    /// Open an existing recording without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open snapshot database: {:?}", path))?;
        Ok(Self { conn })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch(SNAPSHOT_SCHEMA)
            .context("Failed to create snapshot schema")?;
        Ok(Self { conn })
    }

    pub fn append(&self, snap: &MarketSnapshot) -> Result<()> {
        let last_candle_ts: BTreeMap<&str, String> = snap
            .last_candle_ts
            .iter()
            .map(|(tf, ts)| (tf.as_str(), format_nanos(*ts)))
            .collect();
        self.conn
            .execute(
                "INSERT INTO market_snapshots (ts_utc, symbol, futures_bid, futures_ask, \
                 futures_spread_pct, futures_volume_24h, open_interest, funding_rate, \
                 last_candle_ts, candle_count, error_code) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    format_nanos(snap.ts),
                    snap.symbol,
                    snap.bid,
                    snap.ask,
                    snap.spread_pct,
                    snap.volume_24h_usd,
                    snap.open_interest,
                    snap.funding_rate,
                    serde_json::to_string(&last_candle_ts)?,
                    serde_json::to_string(&snap.candle_count)?,
                    snap.error_code,
                ],
            )
            .with_context(|| format!("Failed to insert snapshot for {}", snap.symbol))?;
        Ok(())
    }

    /// Insert raw column values (test fixtures for malformed recordings).
    pub fn append_raw(
        &self,
        ts_utc: &str,
        symbol: &str,
        last_candle_ts: &str,
        candle_count: &str,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO market_snapshots (ts_utc, symbol, futures_bid, futures_ask, \
             futures_volume_24h, last_candle_ts, candle_count) \
             VALUES (?1, ?2, 100.0, 100.1, 5000000.0, ?3, ?4)",
            params![ts_utc, symbol, last_candle_ts, candle_count],
        )?;
        Ok(())
    }

    /// Distinct symbols with at least one row in `[start, end)`, sorted.
    pub fn discover_symbols(&self, start: Nanos, end: Nanos) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT symbol FROM market_snapshots \
                 WHERE ts_utc >= ?1 AND ts_utc < ?2 ORDER BY symbol",
            )
            .context("Failed to query snapshot symbols")?;
        let symbols = stmt
            .query_map(params![format_nanos(start), format_nanos(end)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(symbols)
    }

    /// All rows for `symbols` in `[start, end)`, sorted by (symbol, timestamp).
    pub fn load_window(&self, symbols: &[String], start: Nanos, end: Nanos) -> Result<LoadedWindow> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM market_snapshots \
             WHERE symbol = ?1 AND ts_utc >= ?2 AND ts_utc < ?3 ORDER BY ts_utc, id",
            SELECT_COLUMNS
        ))?;
        let (lo, hi) = (format_nanos(start), format_nanos(end));

        let mut out = LoadedWindow::default();
        for symbol in symbols {
            let mut rows = stmt.query(params![symbol, lo, hi])?;
            let mut loaded = Vec::new();
            while let Some(row) = rows.next()? {
                match parse_row(row) {
                    Some(snap) if snap.ts >= start && snap.ts < end => loaded.push(snap),
                    Some(_) => {}
                    None => out.skipped_rows += 1,
                }
            }
            // Stable: equal timestamps keep insertion order (last write wins).
            loaded.sort_by_key(|s| s.ts);
            debug!(symbol = %symbol, rows = loaded.len(), "loaded snapshot rows");
            out.rows.extend(loaded);
        }

        if out.skipped_rows > 0 {
            warn!(skipped = out.skipped_rows, "dropped snapshot rows with unreadable timestamps");
        }
        Ok(out)
    }
}

// =============================================================================
// ROW PARSING
// =============================================================================

fn parse_row(row: &Row<'_>) -> Option<MarketSnapshot> {
    let ts = match row.get_ref(0).ok()? {
        ValueRef::Text(t) => parse_timestamp(std::str::from_utf8(t).ok()?)?,
        _ => return None,
    };
    let symbol = text(row, 1)?;

    Some(MarketSnapshot {
        ts,
        symbol,
        bid: real(row, 2),
        ask: real(row, 3),
        spread_pct: real(row, 4),
        volume_24h_usd: real(row, 5),
        open_interest: real(row, 6),
        funding_rate: real(row, 7),
        last_candle_ts: text(row, 8)
            .map(|s| parse_candle_ts_map(&s))
            .unwrap_or_default(),
        candle_count: text(row, 9)
            .map(|s| parse_candle_count_map(&s))
            .unwrap_or_default(),
        error_code: text(row, 10).filter(|s| !s.is_empty()),
    })
}

fn text(row: &Row<'_>, idx: usize) -> Option<String> {
    match row.get_ref(idx).ok()? {
        ValueRef::Text(t) => std::str::from_utf8(t).ok().map(str::to_string),
        ValueRef::Integer(i) => Some(i.to_string()),
        _ => None,
    }
}

fn real(row: &Row<'_>, idx: usize) -> Option<f64> {
    let v = match row.get_ref(idx).ok()? {
        ValueRef::Real(f) => f,
        ValueRef::Integer(i) => i as f64,
        ValueRef::Text(t) => std::str::from_utf8(t).ok()?.trim().parse().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

/// `{"4h": "2024-01-25T00:00:00Z" | 1706140800000}` -> timeframe -> Nanos.
pub fn parse_candle_ts_map(raw: &str) -> BTreeMap<String, Nanos> {
    let Ok(map) = serde_json::from_str::<BTreeMap<String, Value>>(raw) else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(tf, v)| {
            let ts = match v {
                Value::String(s) => parse_timestamp(&s)?,
                Value::Number(n) => n.as_i64()?.checked_mul(NANOS_PER_MILLI)?,
                _ => return None,
            };
            Some((tf, ts))
        })
        .collect()
}

/// `{"4h": 260}` -> timeframe -> count.
pub fn parse_candle_count_map(raw: &str) -> BTreeMap<String, u64> {
    let Ok(map) = serde_json::from_str::<BTreeMap<String, Value>>(raw) else {
        return BTreeMap::new();
    };
    map.into_iter()
        .filter_map(|(tf, v)| v.as_u64().map(|n| (tf, n)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::clock::NANOS_PER_SEC;

    const T0: Nanos = 1_706_140_800 * NANOS_PER_SEC;

    fn snap(symbol: &str, ts: Nanos, bid: f64) -> MarketSnapshot {
        MarketSnapshot {
            ts,
            symbol: symbol.to_string(),
            bid: Some(bid),
            ask: Some(bid * 1.001),
            volume_24h_usd: Some(5_000_000.0),
            last_candle_ts: [("4h".to_string(), ts)].into_iter().collect(),
            candle_count: [("4h".to_string(), 260)].into_iter().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_append_and_load_roundtrip() {
        let store = SnapshotStore::open_memory().unwrap();
        store.append(&snap("ETHUSDT", T0 + 300 * NANOS_PER_SEC, 2000.0)).unwrap();
        store.append(&snap("BTCUSDT", T0, 40_000.0)).unwrap();
        store.append(&snap("BTCUSDT", T0 + 300 * NANOS_PER_SEC, 40_010.0)).unwrap();

        let symbols = store.discover_symbols(T0, T0 + 3600 * NANOS_PER_SEC).unwrap();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT"]);

        let loaded = store.load_window(&symbols, T0, T0 + 3600 * NANOS_PER_SEC).unwrap();
        assert_eq!(loaded.rows.len(), 3);
        assert_eq!(loaded.skipped_rows, 0);
        assert_eq!(loaded.rows[0], snap("BTCUSDT", T0, 40_000.0));
        assert_eq!(loaded.rows[2].symbol, "ETHUSDT");
    }

    #[test]
    fn test_window_bounds_are_half_open() {
        let store = SnapshotStore::open_memory().unwrap();
        store.append(&snap("BTCUSDT", T0, 1.0)).unwrap();
        store.append(&snap("BTCUSDT", T0 + 60 * NANOS_PER_SEC, 1.0)).unwrap();

        assert!(store.discover_symbols(T0 + NANOS_PER_SEC, T0 + 60 * NANOS_PER_SEC).unwrap().is_empty());
        let loaded = store
            .load_window(&["BTCUSDT".to_string()], T0, T0 + 60 * NANOS_PER_SEC)
            .unwrap();
        assert_eq!(loaded.rows.len(), 1);
    }

    #[test]
    fn test_malformed_rows_degrade() {
        let store = SnapshotStore::open_memory().unwrap();
        store.append_raw("2024-01-25T00:0x:00Z", "BTCUSDT", "{}", "{}").unwrap();
        store
            .append_raw("2024-01-25T00:05:00Z", "BTCUSDT", "{not json", r#"{"4h": "many"}"#)
            .unwrap();

        let loaded = store
            .load_window(&["BTCUSDT".to_string()], T0, T0 + 3600 * NANOS_PER_SEC)
            .unwrap();
        assert_eq!(loaded.rows.len(), 1);
        assert_eq!(loaded.skipped_rows, 1);
        assert!(loaded.rows[0].last_candle_ts.is_empty());
        assert!(loaded.rows[0].candle_count.is_empty());
    }

    #[test]
    fn test_candle_ts_map_formats() {
        let map = parse_candle_ts_map(r#"{"4h": "2024-01-25T00:00:00Z", "1h": 1706140800000, "1d": true}"#);
        assert_eq!(map.get("4h"), Some(&T0));
        assert_eq!(map.get("1h"), Some(&T0));
        assert!(!map.contains_key("1d"));
    }
}
