//! Symbol Health State Inspector
//!
//! Prints the persisted symbol health state file as a table or JSON.
//!
//! Usage:
//!   cargo run --bin health_state_inspect -- --state runtime/symbol_health_state.json
//!   cargo run --bin health_state_inspect -- --json --only SUSPENDED

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use datagate::config::GateConfig;
use datagate::health::clock::{format_nanos, secs_to_nanos, Nanos};
use datagate::health::persistence::{load_state_file, PersistedStateFile, PersistedSymbolState};
use datagate::health::HealthState;
use datagate::logging::{init_tracing, load_env};

/// Inspect the persisted symbol health state
#[derive(Parser, Debug)]
#[command(name = "health_state_inspect")]
#[command(about = "Print the persisted symbol health state")]
struct Args {
    /// State file (default: DATAGATE_STATE_PATH, then the configured path)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Gate configuration file (TOML) used to locate the state file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Only show symbols in this state (HEALTHY, DEGRADED, SUSPENDED)
    #[arg(long)]
    only: Option<String>,

    /// Emit JSON instead of a table
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    load_env();
    init_tracing("warn");
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("health_state_inspect: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let config = GateConfig::load(args.config.as_deref())?;
    let path = match (&args.state, &config.health.state_path) {
        (Some(p), _) | (None, Some(p)) => p.clone(),
        (None, None) => bail!("no state file configured; pass --state"),
    };
    let trust_window = secs_to_nanos(config.health.trust_window_secs);

    let only = match args.only.as_deref() {
        Some(s) => match HealthState::parse(&s.to_uppercase()) {
            Some(state) => Some(state),
            None => bail!("unknown state '{}'", s),
        },
        None => None,
    };

    let Some(file) = load_state_file(&path)? else {
        bail!("state file not found: {}", path.display());
    };
    let file: PersistedStateFile = file
        .into_iter()
        .filter(|(_, rec)| only.map_or(true, |s| rec.state == s))
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&file)?);
    } else {
        print_table(&file, trust_window);
    }
    Ok(())
}

fn print_table(file: &PersistedStateFile, trust_window: Nanos) {
    println!(
        "{:<16} {:<10} {:>6} {:>6} {:>7} {:>24} {:>24}",
        "Symbol", "State", "Fails", "Passes", "Trust", "Streak Start", "Last Probe"
    );
    println!("{}", "-".repeat(99));

    for (symbol, rec) in file {
        println!(
            "{:<16} {:<10} {:>6} {:>6} {:>7} {:>24} {:>24}",
            symbol,
            rec.state.as_str(),
            rec.consecutive_failures,
            rec.consecutive_successes,
            trust_at_last_observation(rec, trust_window),
            rec.first_failure_ts_ns.map(format_nanos).unwrap_or_else(|| "-".into()),
            rec.last_probe_ts_ns.map(format_nanos).unwrap_or_else(|| "-".into()),
        );
    }

    let count = |s: HealthState| file.values().filter(|r| r.state == s).count();
    println!(
        "\n{} symbols: {} healthy, {} degraded, {} suspended",
        file.len(),
        count(HealthState::Healthy),
        count(HealthState::Degraded),
        count(HealthState::Suspended)
    );
}

/// Pass ratio over the trust window ending at the newest observation.
fn trust_at_last_observation(rec: &PersistedSymbolState, window: Nanos) -> String {
    let Some(last) = rec.trust_history.iter().map(|o| o.ts).max() else {
        return "-".into();
    };
    let cutoff = last.saturating_sub(window);
    let (passed, total) = rec
        .trust_history
        .iter()
        .filter(|o| o.ts >= cutoff)
        .fold((0usize, 0usize), |(p, t), o| (p + o.passed as usize, t + 1));
    format!("{:.2}", passed as f64 / total as f64)
}
