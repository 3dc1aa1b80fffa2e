//! qforecast CLI — ingest observations, retrain, evaluate and query forecasts.
//!
//! Commands:
//! - `ingest` — append CSV observations (or a synthetic price history) to the log
//! - `retrain` — train, evaluate walk-forward, gate, promote and forecast
//! - `evaluate` — walk-forward evaluation only; nothing is promoted
//! - `latest` — latest served forecast per ticker, with staleness
//! - `history` — past forecasts for a ticker joined with realised prices
//! - `releases` — the active release lineage
//! - `rollback` — restore the release promoted before the current one

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use qforecast_core::domain::{FiscalQuarter, IncomingObservation, Prediction, QuarterKey};
use qforecast_core::ObservationSnapshot;
use qforecast_runner::synthetic::synthetic_observations;
use qforecast_runner::{
    read_csv_file, ObservationStore, Pipeline, PipelineConfig, PromotionDecision, RetrainSummary,
};

#[derive(Parser)]
#[command(
    name = "qforecast",
    about = "qforecast CLI — quarterly equity price forecasting pipeline"
)]
struct Cli {
    /// Pipeline config (TOML).
    #[arg(long, global = true, default_value = "configs/pipeline.toml")]
    config: PathBuf,

    /// Directory holding the observation log, registry, reports and store.
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append observations from CSV files to the observation log.
    Ingest {
        /// CSV files with columns source, series_id, timestamp, value, publication_timestamp.
        files: Vec<PathBuf>,

        /// Generate this many quarters of synthetic prices for the universe instead.
        #[arg(long)]
        synthetic: Option<usize>,
    },
    /// Retrain, evaluate, gate and promote; record forecasts for the latest quarter.
    Retrain {
        /// Decision time (YYYY-MM-DD or YYYY-MM-DD HH:MM:SS). Defaults to now.
        #[arg(long)]
        now: Option<String>,

        /// Print the full summary as JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Walk-forward evaluation without promotion.
    Evaluate {
        /// Decision time (YYYY-MM-DD or YYYY-MM-DD HH:MM:SS). Defaults to now.
        #[arg(long)]
        now: Option<String>,
    },
    /// Latest served forecast per ticker.
    Latest {
        /// Tickers to look up. Defaults to the whole universe.
        tickers: Vec<String>,

        /// Staleness reference time. Defaults to now.
        #[arg(long)]
        now: Option<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Past forecasts for one ticker with realised prices where known.
    History {
        ticker: String,

        /// First target quarter (e.g. 2023Q1).
        #[arg(long)]
        from: Option<FiscalQuarter>,

        /// Last target quarter (e.g. 2024Q4).
        #[arg(long)]
        to: Option<FiscalQuarter>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List the active release lineage, oldest first.
    Releases,
    /// Restore the release promoted before the current one.
    Rollback,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_file(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let data_dir = cli.data_dir;

    match cli.command {
        Commands::Ingest { files, synthetic } => run_ingest(&config, &data_dir, &files, synthetic),
        Commands::Retrain { now, json } => run_retrain(config, &data_dir, parse_now(now)?, json),
        Commands::Evaluate { now } => run_evaluate(config, &data_dir, parse_now(now)?),
        Commands::Latest { tickers, now, json } => {
            run_latest(config, &data_dir, tickers, parse_now(now)?, json)
        }
        Commands::History {
            ticker,
            from,
            to,
            json,
        } => run_history(config, &data_dir, &ticker, from, to, json),
        Commands::Releases => run_releases(config, &data_dir),
        Commands::Rollback => run_rollback(config, &data_dir),
    }
}

fn parse_now(raw: Option<String>) -> Result<NaiveDateTime> {
    let Some(raw) = raw else {
        return Ok(chrono::Local::now().naive_local());
    };
    if let Ok(at) = NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(at);
    }
    let date = NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .with_context(|| format!("invalid --now '{raw}'"))?;
    Ok(date.and_time(chrono::NaiveTime::default()))
}

fn observation_store(data_dir: &Path) -> ObservationStore {
    ObservationStore::new(data_dir.join("observations.jsonl"))
}

fn load_snapshot(data_dir: &Path) -> Result<ObservationSnapshot> {
    let log = observation_store(data_dir).load()?;
    if log.is_empty() {
        bail!(
            "observation log is empty; run `qforecast ingest` first ({})",
            data_dir.display()
        );
    }
    Ok(log.snapshot())
}

// ─── Commands ────────────────────────────────────────────────────────

fn run_ingest(
    config: &PipelineConfig,
    data_dir: &Path,
    files: &[PathBuf],
    synthetic: Option<usize>,
) -> Result<()> {
    if files.is_empty() && synthetic.is_none() {
        bail!("nothing to ingest: pass CSV files or --synthetic <quarters>");
    }
    std::fs::create_dir_all(data_dir)?;
    let store = observation_store(data_dir);
    let mut log = store.load()?;

    let mut batch: Vec<IncomingObservation> = Vec::new();
    for path in files {
        let parsed = read_csv_file(path)?;
        for reason in &parsed.skipped {
            eprintln!("{}: skipped {reason}", path.display());
        }
        batch.extend(parsed.rows);
    }
    if let Some(quarters) = synthetic {
        batch.extend(
            synthetic_observations(config, quarters)
                .into_iter()
                .map(IncomingObservation::from),
        );
    }

    let report = store.ingest(&mut log, batch)?;
    for rejection in &report.rejections {
        eprintln!("rejected: {rejection}");
    }

    println!("Observation log: {}", store.path().display());
    println!("{:<16} {:>9} {:>9} {:>10}", "Source", "Accepted", "Rejected", "Duplicate");
    println!("{}", "-".repeat(47));
    for (source, tally) in &report.sources {
        println!(
            "{:<16} {:>9} {:>9} {:>10}",
            source, tally.accepted, tally.rejected, tally.duplicate
        );
    }
    println!(
        "Total: {} accepted, {} rejected, {} duplicate; {} stored",
        report.accepted(),
        report.rejected(),
        report.duplicates(),
        log.len()
    );
    Ok(())
}

fn run_retrain(config: PipelineConfig, data_dir: &Path, now: NaiveDateTime, json: bool) -> Result<()> {
    let snapshot = load_snapshot(data_dir)?;
    let pipeline = Pipeline::open(config, data_dir)?;
    info!(%now, observations = snapshot.len(), "retraining");
    let summary = pipeline.run_retraining(&snapshot, now)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    print_retrain_summary(&summary);
    Ok(())
}

fn print_retrain_summary(summary: &RetrainSummary) {
    println!("Dataset:   {} ({} examples)", summary.dataset_hash, summary.examples);
    println!("Folds:     {}", summary.folds);
    println!("Ensemble:  {}", summary.ensemble);
    for member in &summary.members {
        println!("  member   {} {}", member.family, member.version);
    }
    for failure in &summary.failures {
        println!("  failed   {}: {}", failure.family, failure.error);
    }
    println!();
    for report in &summary.aggregates {
        println!("{report}");
    }
    println!();
    match &summary.decision {
        PromotionDecision::Promoted { release } => {
            println!("Promoted {}", release.version);
        }
        PromotionDecision::Blocked {
            candidate,
            reasons,
            serving,
        } => {
            println!("Blocked {candidate}:");
            for reason in reasons {
                println!("  - {reason}");
            }
            match serving {
                Some(v) => println!("Still serving {v}"),
                None => println!("No release is serving"),
            }
        }
    }
    if !summary.predictions.is_empty() {
        println!();
        print_prediction_header();
        for p in &summary.predictions {
            print_prediction(p, false);
        }
    }
}

fn run_evaluate(config: PipelineConfig, data_dir: &Path, now: NaiveDateTime) -> Result<()> {
    let snapshot = load_snapshot(data_dir)?;
    let pipeline = Pipeline::open(config, data_dir)?;
    let summary = pipeline.evaluate(&snapshot, now)?;

    for fold in &summary.outcome.folds {
        for report in &fold.reports {
            println!("{report}");
        }
    }
    println!();
    for report in summary.outcome.all_reports().iter().filter(|r| r.is_aggregate()) {
        println!("{report}");
    }
    println!();
    match &summary.gate {
        Ok(()) => println!("Gate: pass"),
        Err(reasons) => {
            println!("Gate: fail");
            for reason in reasons {
                println!("  - {reason}");
            }
        }
    }
    println!("Reports appended to {}", pipeline.reports().path().display());
    Ok(())
}

fn run_latest(
    config: PipelineConfig,
    data_dir: &Path,
    tickers: Vec<String>,
    now: NaiveDateTime,
    json: bool,
) -> Result<()> {
    let tickers = if tickers.is_empty() {
        config.universe.iter().map(|t| t.symbol.clone()).collect()
    } else {
        tickers
    };
    let pipeline = Pipeline::open(config, data_dir)?;
    let results = pipeline.store().latest_many(&tickers, now);

    if json {
        let rows: Vec<serde_json::Value> = results
            .iter()
            .map(|(ticker, result)| match result {
                Ok(served) => serde_json::json!({
                    "ticker": ticker,
                    "stale": served.stale,
                    "prediction": served.prediction.as_ref(),
                }),
                Err(e) => serde_json::json!({ "ticker": ticker, "error": e.to_string() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    print_prediction_header();
    for (ticker, result) in &results {
        match result {
            Ok(served) => print_prediction(&served.prediction, served.stale),
            Err(e) => println!("{ticker:<10} {e}"),
        }
    }
    Ok(())
}

fn run_history(
    config: PipelineConfig,
    data_dir: &Path,
    ticker: &str,
    from: Option<FiscalQuarter>,
    to: Option<FiscalQuarter>,
    json: bool,
) -> Result<()> {
    let range = match (from, to) {
        (None, None) => None,
        (from, to) => Some((
            from.unwrap_or(config.first_quarter),
            to.unwrap_or_else(|| FiscalQuarter::containing(chrono::Local::now().date_naive()).next()),
        )),
    };
    let pipeline = Pipeline::open(config, data_dir)?;
    let actuals = realised_prices(&pipeline, data_dir);
    let outcomes = pipeline.store().history_with_outcomes(ticker, range, &actuals);

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
        return Ok(());
    }
    if outcomes.is_empty() {
        println!("No forecasts recorded for {ticker}");
        return Ok(());
    }
    println!(
        "{:<8} {:<20} {:>12} {:>12} {:>8} {:<18}",
        "Target", "Generated", "Forecast", "Actual", "Error", "Ensemble"
    );
    println!("{}", "-".repeat(84));
    for o in &outcomes {
        let p = &o.prediction;
        println!(
            "{:<8} {:<20} {:>12.2} {:>12} {:>8} {:<18}",
            p.key.quarter().to_string(),
            p.generated_at.format("%Y-%m-%d %H:%M").to_string(),
            p.point_estimate,
            o.actual.map_or("-".to_string(), |a| format!("{a:.2}")),
            o.error_pct.map_or("-".to_string(), |e| format!("{e:.2}%")),
            p.ensemble_version.to_string(),
        );
    }
    Ok(())
}

/// Realised quarter-end prices known from the observation log. Empty when the
/// log is missing or no quarter has closed.
fn realised_prices(pipeline: &Pipeline, data_dir: &Path) -> BTreeMap<QuarterKey, f64> {
    let Ok(log) = observation_store(data_dir).load() else {
        return BTreeMap::new();
    };
    let now = chrono::Local::now().naive_local();
    let Ok(dataset) = pipeline.build_dataset(&log.snapshot(), now) else {
        return BTreeMap::new();
    };
    dataset
        .examples
        .iter()
        .filter_map(|e| e.target.map(|t| (e.target_key(), t)))
        .collect()
}

fn run_releases(config: PipelineConfig, data_dir: &Path) -> Result<()> {
    let pipeline = Pipeline::open(config, data_dir)?;
    let lineage = pipeline.store().lineage();
    if lineage.is_empty() {
        println!("No release has been promoted");
        return Ok(());
    }
    let pct = |v: Option<f64>| v.map_or("n/a".to_string(), |v| format!("{:.2}%", v * 100.0));
    println!(
        "{:<18} {:<18} {:<20} {:>8} {:>8}",
        "Ensemble", "Feature set", "Promoted", "MAPE", "DA"
    );
    println!("{}", "-".repeat(76));
    for (i, r) in lineage.iter().enumerate() {
        let marker = if i + 1 == lineage.len() { " *" } else { "" };
        println!(
            "{:<18} {:<18} {:<20} {:>8} {:>8}{marker}",
            r.version.to_string(),
            r.feature_set.to_string(),
            r.promoted_at.format("%Y-%m-%d %H:%M").to_string(),
            pct(r.mape),
            pct(r.directional_accuracy),
        );
    }
    Ok(())
}

fn run_rollback(config: PipelineConfig, data_dir: &Path) -> Result<()> {
    let pipeline = Pipeline::open(config, data_dir)?;
    let restored = pipeline.store().rollback(chrono::Local::now().naive_local())?;
    println!("Rolled back to {}", restored.version);
    Ok(())
}

// ─── Formatting ──────────────────────────────────────────────────────

fn print_prediction_header() {
    println!(
        "{:<10} {:<8} {:>12} {:>25} {:>8} {:>6} {:<6}",
        "Ticker", "Target", "Forecast", "Interval", "Change", "Conf", ""
    );
    println!("{}", "-".repeat(81));
}

fn print_prediction(p: &Prediction, stale: bool) {
    println!(
        "{:<10} {:<8} {:>12.2} {:>25} {:>7.2}% {:>6.1} {:<6}",
        p.ticker(),
        p.key.quarter().to_string(),
        p.point_estimate,
        format!("[{:.2}, {:.2}]", p.interval.lower, p.interval.upper),
        p.change_pct,
        p.confidence_score,
        if stale { "STALE" } else { "" },
    );
}
