//! Gate Replay CLI
//!
//! Replays recorded market snapshots through the symbol health gate on a
//! simulated clock and writes coverage/delta reports.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --bin gate_replay -- \
//!   --db ./market_snapshots.db \
//!   --start 2024-01-25 \
//!   --end   2024-01-31 \
//!   --output-dir ./replay_reports \
//!   --verify
//! ```
//!
//! # Exit Codes
//!
//! - 0: Reports written for at least one symbol
//! - 1: Missing database, no symbols in the window, or any other failure

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use datagate::config::GateConfig;
use datagate::logging::{init_tracing, load_env};
use datagate::replay::{run_replay, ReplayOutcome, ReplayWindow, SnapshotStore};

/// Replay recorded market snapshots through the data quality gate
#[derive(Parser, Debug)]
#[command(name = "gate_replay")]
#[command(about = "Replay recorded market snapshots through the symbol health gate")]
struct Args {
    /// SQLite database with the market_snapshots table
    #[arg(long, env = "DATAGATE_REPLAY_DB")]
    db: Option<PathBuf>,

    /// First UTC date to replay (YYYY-MM-DD, inclusive)
    #[arg(long)]
    start: NaiveDate,

    /// Last UTC date to replay (YYYY-MM-DD, inclusive)
    #[arg(long)]
    end: NaiveDate,

    /// Synthetic tick spacing in seconds (default: config, then 300)
    #[arg(long)]
    tick_seconds: Option<u64>,

    /// Report directory (default: config, then ./replay_reports)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Gate configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Also check determinism and split/resume equivalence
    #[arg(long)]
    verify: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    load_env();
    let args = Args::parse();
    init_tracing(&args.log_level);

    match run(&args) {
        Ok(outcome) => {
            print_summary(&outcome);
            match &outcome.verification {
                Some(v) if !v.passed() => {
                    error!(?v, "replay verification failed");
                    ExitCode::FAILURE
                }
                _ => ExitCode::SUCCESS,
            }
        }
        Err(e) => {
            error!("{:#}", e);
            eprintln!("gate_replay: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<ReplayOutcome> {
    let Some(db) = &args.db else {
        bail!("--db is required");
    };
    if !db.exists() {
        bail!("database not found: {}", db.display());
    }

    let mut config = GateConfig::load(args.config.as_deref())?;
    if let Some(tick) = args.tick_seconds {
        config.replay.tick_interval_secs = tick;
    }
    if let Some(dir) = &args.output_dir {
        config.replay.output_dir = dir.clone();
    }

    let window = ReplayWindow::new(args.start, args.end)?;
    let store = SnapshotStore::open_read_only(db)?;
    info!(db = %db.display(), "opened snapshot database");

    let output_dir = config.replay.output_dir.clone();
    run_replay(&store, &window, &config, &output_dir, args.verify)
        .with_context(|| format!("replay {}..{} failed", args.start, args.end))
}

fn print_summary(outcome: &ReplayOutcome) {
    let totals = &outcome.delta.totals;
    println!("{}", "=".repeat(70));
    println!("GATE REPLAY SUMMARY");
    println!("{}", "=".repeat(70));
    println!("Symbols:                {}", outcome.symbols.len());
    println!("Ticks:                  {}", outcome.tick_count);
    println!("Analyze calls (off):    {}", totals.disabled_analyze_calls);
    println!("Analyze calls (on):     {}", totals.enabled_analyze_calls);
    println!(
        "Wasted work prevented:  {} ({:.2}%)",
        totals.wasted_work_prevented, totals.wasted_work_prevented_pct
    );
    println!(
        "Reached SUSPENDED:      {}",
        outcome.delta.symbols_reached_suspended.len()
    );
    println!(
        "Invariant violations:   {}",
        outcome.coverage.global.invariant_violations.len()
    );
    if let Some(v) = &outcome.verification {
        println!(
            "Verification:           deterministic={} resume_equivalent={} (split at tick {})",
            v.deterministic, v.resume_equivalent, v.split_index
        );
    }
    println!("Coverage digest:        {}", outcome.coverage_digest);
    println!("Delta digest:           {}", outcome.delta_digest);
    println!("\nReports:");
    for path in outcome.paths.all() {
        println!("  {}", path.display());
    }
}
