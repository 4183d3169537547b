//! Gate Configuration
//!
//! One TOML document with three sections, every field optional:
//!
//! ```toml
//! [thresholds]
//! max_spread_pct = 0.01
//! min_volume_24h_usd = 1000000.0
//! min_candles = 200
//! decision_timeframe = "4h"
//! allow_spot_fallback = false
//!
//! [health]
//! degrade_after_failures = 3
//! suspend_after_secs = 21600
//! state_path = "runtime/symbol_health_state.json"
//!
//! [replay]
//! tick_interval_secs = 300
//! output_dir = "replay_reports"
//! ```
//!
//! Environment variables (`DATAGATE_*`) override the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

use crate::health::sanity::{parse_timeframe_hours, SanityThresholds};
use crate::health::tracker::HealthConfig;

// =============================================================================
// ERRORS
// =============================================================================

/// Invalid configuration. The only error the gate raises at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { field, reason } => {
                write!(f, "invalid configuration: {} {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// =============================================================================
// REPLAY SETTINGS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    /// Spacing of the synthetic tick timeline.
    pub tick_interval_secs: u64,
    /// Directory receiving coverage/delta reports.
    pub output_dir: PathBuf,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 300,
            output_dir: PathBuf::from("replay_reports"),
        }
    }
}

// =============================================================================
// GATE CONFIG
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub thresholds: SanityThresholds,
    pub health: HealthConfig,
    pub replay: ReplaySettings,
}

impl GateConfig {
    /// Load from an optional TOML file, apply `DATAGATE_*` overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                let config: GateConfig = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?;
                info!(path = %path.display(), "loaded gate configuration");
                config
            }
            None => GateConfig::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let t = &mut self.thresholds;
        override_parsed(&lookup, "DATAGATE_MAX_SPREAD_PCT", &mut t.max_spread_pct);
        override_parsed(&lookup, "DATAGATE_MIN_VOLUME_24H_USD", &mut t.min_volume_24h_usd);
        override_parsed(&lookup, "DATAGATE_MIN_CANDLES", &mut t.min_candles);
        if let Some(tf) = lookup("DATAGATE_DECISION_TIMEFRAME").filter(|v| !v.trim().is_empty()) {
            t.decision_timeframe = tf.trim().to_string();
        }
        if let Some(v) = lookup("DATAGATE_ALLOW_SPOT_FALLBACK") {
            t.allow_spot_fallback = matches!(v.trim(), "1" | "true" | "TRUE" | "on" | "ON");
        }

        let h = &mut self.health;
        override_parsed(&lookup, "DATAGATE_DEGRADE_AFTER_FAILURES", &mut h.degrade_after_failures);
        override_parsed(&lookup, "DATAGATE_RECOVER_AFTER_SUCCESSES", &mut h.recover_after_successes);
        override_parsed(&lookup, "DATAGATE_SUSPEND_AFTER_SECS", &mut h.suspend_after_secs);
        override_parsed(&lookup, "DATAGATE_PROBE_INTERVAL_SECS", &mut h.probe_interval_secs);
        override_parsed(&lookup, "DATAGATE_DEGRADED_SKIP_RATIO", &mut h.degraded_skip_ratio);
        override_parsed(&lookup, "DATAGATE_TRUST_WINDOW_SECS", &mut h.trust_window_secs);
        if let Some(p) = lookup("DATAGATE_STATE_PATH").filter(|v| !v.trim().is_empty()) {
            h.state_path = Some(PathBuf::from(p.trim()));
        }

        let r = &mut self.replay;
        override_parsed(&lookup, "DATAGATE_TICK_INTERVAL_SECS", &mut r.tick_interval_secs);
        if let Some(dir) = lookup("DATAGATE_OUTPUT_DIR").filter(|v| !v.trim().is_empty()) {
            r.output_dir = PathBuf::from(dir.trim());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if !(t.max_spread_pct.is_finite() && t.max_spread_pct > 0.0) {
            return Err(ConfigError::invalid("max_spread_pct", "must be a positive number"));
        }
        if !(t.min_volume_24h_usd.is_finite() && t.min_volume_24h_usd >= 0.0) {
            return Err(ConfigError::invalid("min_volume_24h_usd", "must be >= 0"));
        }
        if t.min_candles == 0 {
            return Err(ConfigError::invalid("min_candles", "must be >= 1"));
        }
        if parse_timeframe_hours(&t.decision_timeframe).is_none() {
            return Err(ConfigError::invalid(
                "decision_timeframe",
                format!("'{}' is not a timeframe like 15m/1h/4h/1d", t.decision_timeframe),
            ));
        }
        self.health.validate()?;
        if self.replay.tick_interval_secs == 0 {
            return Err(ConfigError::invalid("tick_interval_secs", "must be > 0"));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => *target = v,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable configuration override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = GateConfig::default();
        config.validate().unwrap();
        assert_eq!(config.health.degrade_after_failures, 3);
        assert_eq!(config.health.suspend_after_secs, 21_600);
        assert_eq!(config.replay.tick_interval_secs, 300);
        assert_eq!(config.thresholds.decision_timeframe, "4h");
    }

    #[test]
    fn test_partial_toml() {
        let config: GateConfig = toml::from_str(
            r#"
            [thresholds]
            max_spread_pct = 0.10
            decision_timeframe = "1h"

            [health]
            degraded_skip_ratio = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.thresholds.max_spread_pct, 0.10);
        assert_eq!(config.thresholds.decision_timeframe, "1h");
        assert_eq!(config.thresholds.min_candles, 200);
        assert_eq!(config.health.degraded_skip_ratio, 6);
        assert_eq!(config.health.recover_after_successes, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATAGATE_MAX_SPREAD_PCT", "0.05"),
            ("DATAGATE_MIN_CANDLES", "not-a-number"),
            ("DATAGATE_ALLOW_SPOT_FALLBACK", "true"),
            ("DATAGATE_DEGRADED_SKIP_RATIO", "8"),
            ("DATAGATE_STATE_PATH", "/tmp/health.json"),
            ("DATAGATE_TICK_INTERVAL_SECS", "60"),
        ]
        .into_iter()
        .collect();

        let mut config = GateConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.thresholds.max_spread_pct, 0.05);
        assert_eq!(config.thresholds.min_candles, 200);
        assert!(config.thresholds.allow_spot_fallback);
        assert_eq!(config.health.degraded_skip_ratio, 8);
        assert_eq!(config.health.state_path, Some(PathBuf::from("/tmp/health.json")));
        assert_eq!(config.replay.tick_interval_secs, 60);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = GateConfig::default();
        config.thresholds.decision_timeframe = "4x".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "decision_timeframe", .. }));

        config.thresholds.decision_timeframe = "4é".into();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "decision_timeframe", .. }));

        let mut config = GateConfig::default();
        config.thresholds.max_spread_pct = 0.0;
        assert!(config.validate().is_err());

        let mut config = GateConfig::default();
        config.replay.tick_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = GateConfig::default();
        config.health.recover_after_successes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gate.toml");
        std::fs::write(&path, "[replay]\noutput_dir = \"out\"\n").unwrap();
        let config = GateConfig::load(Some(&path)).unwrap();
        assert_eq!(config.replay.output_dir, PathBuf::from("out"));

        std::fs::write(&path, "[thresholds]\nmin_candles = 0\n").unwrap();
        assert!(GateConfig::load(Some(&path)).is_err());
    }
}
