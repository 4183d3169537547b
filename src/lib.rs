//! Datagate Library
//!
//! Market-data quality gate for the trading scheduler, plus the offline replay
//! engine that measures what the gate would have done over recorded data.
//!
//! - [`health`]: stateless sanity checks, per-symbol health tracker, persistence
//! - [`replay`]: snapshot providers, two-pass replay, coverage/delta reports
//! - [`config`]: TOML + environment configuration
//! - [`logging`]: tracing bootstrap for the binaries

pub mod config;
pub mod health;
pub mod logging;
pub mod replay;

pub use config::{ConfigError, GateConfig};
pub use health::{GateOutcome, HealthConfig, HealthState, SymbolHealthTracker};
pub use replay::ReplayError;
