//! Attribution Pipeline CLI
//!
//! Builds customer journeys, scores them against the remote attribution
//! service, and writes the channel report.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use attribution_pipeline::{build_runtime, run_pipeline, Config, RunRequest, RunStatus};

#[derive(Parser)]
#[command(name = "attribution-pipeline")]
#[command(about = "Journey assembly and multi-touch attribution scoring", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override scoring parallelism
    #[arg(long, global = true)]
    parallelism: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run {
        /// Window start (RFC 3339, "YYYY-MM-DD HH:MM:SS", or "YYYY-MM-DD")
        #[arg(long)]
        window_start: String,

        /// Window end (same formats as window_start)
        #[arg(long)]
        window_end: String,

        /// Run identifier (derived from the window when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Aggregate whatever chunks succeed instead of failing the run
        #[arg(long)]
        best_effort: bool,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run {
            window_start,
            window_end,
            run_id,
            best_effort,
        }) => run_command(
            cli.config,
            cli.parallelism,
            &window_start,
            &window_end,
            run_id,
            best_effort,
        ),

        Some(Commands::Validate) => validate_command(cli.config),

        Some(Commands::GenerateConfig { output }) => generate_config_command(output),

        None => {
            anyhow::bail!("No command specified; see --help");
        }
    }
}

fn run_command(
    config_path: PathBuf,
    parallelism: Option<usize>,
    window_start: &str,
    window_end: &str,
    run_id: Option<String>,
    best_effort: bool,
) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;

    // Apply overrides
    if let Some(p) = parallelism {
        config.processing.scoring_parallelism = p;
    }

    config.validate()?;

    let window_start = parse_time(window_start)?;
    let window_end = parse_time(window_end)?;
    if window_end <= window_start {
        anyhow::bail!("window_end must be after window_start");
    }

    let request = RunRequest {
        run_id: run_id
            .unwrap_or_else(|| format!("run-{}", window_start.format("%Y%m%d%H%M%S"))),
        window_start,
        window_end,
        best_effort,
    };

    let runtime = build_runtime(config.processing.worker_threads)?;
    let summary = runtime.block_on(async { run_pipeline(config, request).await })?;

    println!("\n=== Run Summary ===");
    println!("Run: {} ({:?})", summary.run_id, summary.status);
    println!("Events loaded: {}", summary.events_loaded);
    println!(
        "Journeys: {} built, {} scored",
        summary.journeys_built, summary.journeys_scored
    );
    println!(
        "Chunks: {} total, {} succeeded, {} partial, {} failed",
        summary.chunks_total,
        summary.chunks_succeeded,
        summary.chunks_partial,
        summary.chunks_failed
    );
    if !summary.failed_chunks.is_empty() {
        println!("\n--- Failed Chunks ---");
        for failed in &summary.failed_chunks {
            println!("{}: {}", failed.chunk_id, failed.error);
        }
    }
    if !summary.warnings.is_empty() {
        println!("\n--- Warnings ({}) ---", summary.warnings.len());
        for warning in &summary.warnings {
            println!("{}", warning);
        }
    }
    println!("===================\n");

    if summary.status == RunStatus::Failed {
        anyhow::bail!("run {} failed", summary.run_id);
    }
    Ok(())
}

/// Accepts RFC 3339, "YYYY-MM-DD HH:MM:SS", or a bare date (midnight UTC).
fn parse_time(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    anyhow::bail!("Unrecognized time format: {input}")
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Attribution Pipeline Configuration

# === STORAGE: Event input and report output ===
storage:
  # JSON-lines file with raw touchpoint events
  events_path: "events.jsonl"

  # Channel report destination
  report_path: "channel_report.json"

  # Optional CSV export of the report
  # report_csv_path: "channel_report.csv"

# === API: Remote scoring service ===
api:
  endpoint: "https://scoring.example.com/v1/score"

  # Sent as the x-api-key header
  # api_key: "your-key-here"

  # Per-request timeout in seconds
  request_timeout_secs: 30

  # Submission attempts per chunk (first try included)
  max_retry_attempts: 5

  # Exponential backoff: base doubles per attempt, capped at max
  retry_backoff_base_ms: 200
  retry_backoff_max_ms: 10000

  # Chunk limits; whichever binds first
  max_chunk_journeys: 100
  max_chunk_bytes: 1048576

# === JOURNEYS: Construction rules ===
journeys:
  # Inactivity gap that starts a new journey
  session_timeout_minutes: 30

  # Events read before the window to catch in-progress journeys
  lookback_minutes: 1440

  # Accepted channels; empty list accepts everything
  channel_whitelist: []

  # Drop exact duplicates (first occurrence wins)
  dedupe_duplicates: true

  # Emit journeys that never converted
  include_non_converting: false

  # Abort the run when more than this fraction of events fails validation
  validation_error_tolerance: 0.05

# === PROCESSING: Run execution ===
processing:
  # Concurrent chunk submissions
  scoring_parallelism: 8

  # Scoring stage wall-clock budget
  run_timeout_seconds: 600

  # Aggregate whatever succeeded instead of failing on chunk failures
  best_effort: false

  # Fraction of chunks allowed to fail before the run fails
  failed_chunk_tolerance: 0.0

  # Resubmit journeys left unscored by partial responses once
  resubmit_partials: true

  # Print progress metrics during scoring
  enable_metrics: true
  metrics_interval_secs: 10

  # Optional metrics JSON dump after the run
  # metrics_output_path: "metrics.json"

# === AGGREGATION ===
aggregation:
  # Rescale drifted credit sums back to 1.0 (mismatch still reported)
  normalize_credits: true

  # Allowed deviation for per-journey credit sums
  credit_tolerance: 0.0001
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
