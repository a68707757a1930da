use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use flate2::read::GzDecoder;
use odometer_rs::filters::policy::FilterDecision;
use odometer_rs::{
    FilterConfig, FilterPolicy, JsonFileStore, KalmanProfile, LocationSample, Odometer, UpdateStatus,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Parser, Debug)]
struct Args {
    /// Path to comparison_*.json[.gz] log
    #[arg(long, conflicts_with = "golden_dir")]
    log: Option<PathBuf>,

    /// Directory of golden logs to batch replay (processes comparison_*.json[.gz])
    #[arg(long)]
    golden_dir: Option<PathBuf>,

    /// JSON filter config; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// pass-through | adjust | conservative
    #[arg(long)]
    policy: Option<FilterPolicy>,

    /// Skip the Kalman smoother
    #[arg(long, default_value_t = false)]
    no_kalman: bool,

    /// default | aggressive | conservative
    #[arg(long)]
    profile: Option<KalmanProfile>,

    /// Distance filter in meters
    #[arg(long)]
    distance_filter: Option<f64>,

    /// Log per-sample filter decisions (RUST_LOG=debug)
    #[arg(long, default_value_t = false)]
    filter_debug: bool,

    /// Write Kalman diagnostics CSV here (single log only)
    #[arg(long)]
    diagnostics: Option<PathBuf>,

    /// Persist final odometer state JSON here (single log only)
    #[arg(long)]
    state: Option<PathBuf>,
}

#[derive(Deserialize)]
struct GpsData {
    timestamp: f64,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    speed: Option<f64>,
    accuracy: f64,
}

#[derive(Deserialize)]
struct Reading {
    gps: Option<GpsData>,
}

#[derive(Deserialize)]
struct LogFile {
    readings: Vec<Reading>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let gz = GzDecoder::new(file);
        let reader = BufReader::new(gz);
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn build_config(args: &Args) -> anyhow::Result<FilterConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => FilterConfig::load(path)?,
        None => FilterConfig::default(),
    };
    if let Some(policy) = args.policy {
        config = config.with_policy(policy);
    }
    if args.no_kalman {
        config = config.with_kalman(false);
    }
    if let Some(profile) = args.profile {
        config = config.with_kalman_profile(profile);
    }
    if let Some(df) = args.distance_filter {
        config = config.with_distance_filter(df);
    }
    let kalman_debug = config.kalman_debug || args.diagnostics.is_some();
    Ok(config.with_debug(config.filter_debug || args.filter_debug, kalman_debug))
}

fn run_once(path: &Path, args: &Args, config: &FilterConfig, single: bool) -> anyhow::Result<serde_json::Value> {
    let log = load_log(path)?;

    let odometer = match args.state.as_ref().filter(|_| single) {
        Some(state_path) => Odometer::with_store(Arc::new(JsonFileStore::new(state_path)))?,
        None => Odometer::new(),
    };

    let mut decisions: BTreeMap<String, u64> = BTreeMap::new();
    let mut reasons: BTreeMap<String, u64> = BTreeMap::new();
    let mut raw_total = 0.0;
    let mut gps_fixes = 0u64;

    for r in &log.readings {
        let Some(gps) = r.gps.as_ref() else {
            continue;
        };
        gps_fixes += 1;
        let sample = LocationSample::new(gps.latitude, gps.longitude, gps.accuracy, gps.speed, gps.timestamp);
        let update = odometer.update(&sample, config);

        let key = match &update.status {
            UpdateStatus::Skipped(reason) => format!("skipped:{:?}", reason),
            UpdateStatus::Evaluated(verdict) => {
                raw_total += verdict.metrics.raw_delta;
                if verdict.decision != FilterDecision::Accept || verdict.metrics.flags.any_cap() {
                    *reasons.entry(verdict.reason.to_string()).or_insert(0) += 1;
                }
                format!("{:?}", verdict.decision).to_lowercase()
            }
        };
        *decisions.entry(key).or_insert(0) += 1;
    }

    let mut diagnostics_rows = 0;
    if let Some(csv_path) = args.diagnostics.as_ref().filter(|_| single) {
        diagnostics_rows = odometer.export_diagnostics_csv(csv_path)?;
        println!("[DIAG] wrote {} rows to {}", diagnostics_rows, csv_path.display());
    }
    if single && args.state.is_some() {
        odometer.persist()?;
    }

    let reading = odometer.reading();
    Ok(json!({
        "log": path.display().to_string(),
        "policy": config.policy.to_string(),
        "use_kalman": config.use_kalman,
        "kalman_profile": config.kalman_profile,
        "distance_filter": config.distance_filter,
        "gps_fixes": gps_fixes,
        "raw_distance_m": raw_total,
        "odometer_m": reading.odometer,
        "odometer_error_m": reading.odometer_error,
        "decisions": decisions,
        "reasons": reasons,
        "diagnostic_rows": diagnostics_rows,
        "kalman": odometer.kalman_state(),
    }))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = build_config(&args)?;
    let mut results = Vec::new();

    if let Some(dir) = args.golden_dir.as_ref() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !(name.starts_with("comparison_") && (name.ends_with(".json") || name.ends_with(".json.gz"))) {
                continue;
            }
            match run_once(&path, &args, &config, false) {
                Ok(res) => results.push(res),
                Err(e) => log::warn!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &args, &config, true)?);
    } else {
        anyhow::bail!("Provide --log or --golden-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
