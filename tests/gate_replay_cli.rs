//! Integration tests for the gate_replay and health_state_inspect CLIs.
//!
//! Each test builds its own snapshot database in a temp dir through the library
//! API, then runs the compiled binary.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use datagate::health::clock::{Nanos, NANOS_PER_HOUR, NANOS_PER_SEC};
use datagate::health::persistence::{save_state_file, PersistedStateFile, PersistedSymbolState};
use datagate::health::HealthState;
use datagate::replay::{MarketSnapshot, SnapshotStore};

const T0: Nanos = 1_706_140_800 * NANOS_PER_SEC; // 2024-01-25T00:00:00Z

fn gate_replay() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_gate_replay"));
    cmd.env_remove("DATAGATE_REPLAY_DB")
        .env_remove("DATAGATE_OUTPUT_DIR")
        .env_remove("DATAGATE_TICK_INTERVAL_SECS")
        .env("RUST_LOG", "warn");
    cmd
}

fn snapshot(symbol: &str, ts: Nanos, ask: f64) -> MarketSnapshot {
    MarketSnapshot {
        ts,
        symbol: symbol.to_string(),
        bid: Some(100.0),
        ask: Some(ask),
        volume_24h_usd: Some(3_000_000.0),
        last_candle_ts: [("4h".to_string(), ts - ts.rem_euclid(4 * NANOS_PER_HOUR))]
            .into_iter()
            .collect(),
        candle_count: [("4h".to_string(), 240)].into_iter().collect(),
        ..Default::default()
    }
}

/// One day of 15-minute snapshots: BTCUSDT clean, WIDEUSDT always too wide.
fn create_fixture_db(dir: &Path) -> PathBuf {
    let path = dir.join("snapshots.db");
    let store = SnapshotStore::open(&path).unwrap();
    for i in 0..96 {
        let ts = T0 + i * 15 * 60 * NANOS_PER_SEC;
        store.append(&snapshot("BTCUSDT", ts, 100.02)).unwrap();
        store.append(&snapshot("WIDEUSDT", ts, 110.0)).unwrap();
    }
    path
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("failed to spawn binary")
}

#[test]
fn test_missing_db_exits_with_error() {
    let out = run(gate_replay().args(["--start", "2024-01-25", "--end", "2024-01-25"]));
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("--db"));
}

#[test]
fn test_nonexistent_db_exits_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let out = run(gate_replay().args([
        "--db",
        dir.path().join("nope.db").to_str().unwrap(),
        "--start",
        "2024-01-25",
        "--end",
        "2024-01-25",
    ]));
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_window_without_symbols_exits_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let db = create_fixture_db(dir.path());
    let reports = dir.path().join("reports");

    let out = run(gate_replay()
        .arg("--db")
        .arg(&db)
        .args(["--start", "2023-06-01", "--end", "2023-06-02"])
        .arg("--output-dir")
        .arg(&reports));
    assert_eq!(out.status.code(), Some(1));
    assert!(!reports.join("coverage_2023-06-01_2023-06-02.json").exists());
}

#[test]
fn test_replay_writes_reports() {
    let dir = tempfile::tempdir().unwrap();
    let db = create_fixture_db(dir.path());
    let reports = dir.path().join("reports");

    let out = run(gate_replay()
        .arg("--db")
        .arg(&db)
        .args(["--start", "2024-01-25", "--end", "2024-01-25", "--tick-seconds", "600"])
        .arg("--output-dir")
        .arg(&reports)
        .arg("--verify"));
    assert_eq!(
        out.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    for name in [
        "coverage_2024-01-25_2024-01-25.json",
        "coverage_2024-01-25_2024-01-25_summary.txt",
        "delta_2024-01-25_2024-01-25.json",
        "delta_2024-01-25_2024-01-25_summary.txt",
    ] {
        assert!(reports.join(name).exists(), "{} missing", name);
    }

    let coverage: serde_json::Value = serde_json::from_slice(
        &std::fs::read(reports.join("coverage_2024-01-25_2024-01-25.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(coverage["window"]["tick_count"], 144);
    assert_eq!(coverage["global"]["symbol_count"], 2);
    assert_eq!(coverage["symbols"]["BTCUSDT"]["cycles_sanity_pass"], 144);
    assert_eq!(coverage["symbols"]["WIDEUSDT"]["final_state"], "SUSPENDED");

    let delta: serde_json::Value = serde_json::from_slice(
        &std::fs::read(reports.join("delta_2024-01-25_2024-01-25.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(delta["totals"]["disabled_analyze_calls"], 288);
    assert!(delta["totals"]["wasted_work_prevented"].as_i64().unwrap() > 0);
    assert_eq!(delta["symbols_reached_suspended"][0], "WIDEUSDT");

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("deterministic=true resume_equivalent=true"));
}

#[test]
fn test_reports_are_byte_identical_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let db = create_fixture_db(dir.path());

    let mut files = Vec::new();
    for run_dir in ["a", "b"] {
        let reports = dir.path().join(run_dir);
        let out = run(gate_replay()
            .arg("--db")
            .arg(&db)
            .args(["--start", "2024-01-25", "--end", "2024-01-25"])
            .arg("--output-dir")
            .arg(&reports));
        assert_eq!(out.status.code(), Some(0));
        files.push(std::fs::read(reports.join("delta_2024-01-25_2024-01-25.json")).unwrap());
    }
    assert_eq!(files[0], files[1]);
}

#[test]
fn test_inspect_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("health.json");
    let mut file = PersistedStateFile::new();
    file.insert(
        "WIDEUSDT".into(),
        PersistedSymbolState {
            state: HealthState::Suspended,
            consecutive_failures: 40,
            consecutive_successes: 0,
            first_failure_ts_ns: Some(T0),
            last_probe_ts_ns: Some(T0 + 6 * NANOS_PER_HOUR),
            degraded_cycle: 0,
            trust_history: Vec::new(),
        },
    );
    save_state_file(&path, &file).unwrap();

    let out = run(Command::new(env!("CARGO_BIN_EXE_health_state_inspect"))
        .arg("--state")
        .arg(&path)
        .arg("--json"));
    assert_eq!(out.status.code(), Some(0));
    let parsed: PersistedStateFile = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(parsed, file);

    let out = run(Command::new(env!("CARGO_BIN_EXE_health_state_inspect"))
        .arg("--state")
        .arg(&path));
    assert!(String::from_utf8_lossy(&out.stdout).contains("SUSPENDED"));

    std::fs::write(&path, "{ not json").unwrap();
    let out = run(Command::new(env!("CARGO_BIN_EXE_health_state_inspect"))
        .arg("--state")
        .arg(&path));
    assert_eq!(out.status.code(), Some(1));
}
