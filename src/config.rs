//! Configuration for the attribution pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Event storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Scoring service configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Journey construction configuration
    #[serde(default)]
    pub journeys: JourneyConfig,

    /// Run execution configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Result aggregation configuration
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

/// Where events are read from and reports are written to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the JSON-lines event file
    #[serde(default = "default_events_path")]
    pub events_path: String,

    /// Path for the JSON channel report
    #[serde(default = "default_report_path")]
    pub report_path: String,

    /// Optional path for a CSV export of the report
    #[serde(default)]
    pub report_csv_path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            events_path: default_events_path(),
            report_path: default_report_path(),
            report_csv_path: None,
        }
    }
}

/// Remote scoring service settings, including the chunking limits the
/// service imposes on a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Scoring endpoint URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API key sent as the x-api-key header
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Maximum submission attempts per chunk (first try included)
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    /// Base backoff in milliseconds; doubles per attempt
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    /// Maximum journeys per request chunk
    #[serde(default = "default_max_chunk_journeys")]
    pub max_chunk_journeys: usize,

    /// Maximum serialized request size per chunk in bytes
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            max_chunk_journeys: default_max_chunk_journeys(),
            max_chunk_bytes: default_max_chunk_bytes(),
        }
    }
}

/// Journey construction rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyConfig {
    /// Inactivity gap that closes a session and starts a new journey
    #[serde(default = "default_session_timeout_minutes")]
    pub session_timeout_minutes: i64,

    /// How far before the window to read events, to capture in-progress
    /// journeys that end inside the window
    #[serde(default = "default_lookback_minutes")]
    pub lookback_minutes: i64,

    /// Accepted channel names. Empty means any channel is accepted.
    #[serde(default)]
    pub channel_whitelist: Vec<String>,

    /// Drop exact duplicate events (same customer, channel, timestamp),
    /// keeping the first occurrence
    #[serde(default = "default_true")]
    pub dedupe_duplicates: bool,

    /// Emit journeys that did not convert by window close
    #[serde(default)]
    pub include_non_converting: bool,

    /// Fraction of input events that may fail validation before the run
    /// aborts
    #[serde(default = "default_validation_error_tolerance")]
    pub validation_error_tolerance: f64,
}

impl Default for JourneyConfig {
    fn default() -> Self {
        Self {
            session_timeout_minutes: default_session_timeout_minutes(),
            lookback_minutes: default_lookback_minutes(),
            channel_whitelist: Vec::new(),
            dedupe_duplicates: true,
            include_non_converting: false,
            validation_error_tolerance: default_validation_error_tolerance(),
        }
    }
}

/// Run execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of chunks scored concurrently
    #[serde(default = "default_scoring_parallelism")]
    pub scoring_parallelism: usize,

    /// Wall-clock budget for the scoring stage; expiry fails the run
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,

    /// Proceed to aggregation with whatever chunks succeeded instead of
    /// failing the run on permanent chunk failures
    #[serde(default)]
    pub best_effort: bool,

    /// Fraction of chunks that may permanently fail before the run fails
    /// (ignored under best_effort)
    #[serde(default)]
    pub failed_chunk_tolerance: f64,

    /// Resubmit journeys left unscored by partial chunks once
    #[serde(default = "default_true")]
    pub resubmit_partials: bool,

    /// Number of Tokio worker threads (null = num CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Enable periodic metrics reporting during scoring
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            scoring_parallelism: default_scoring_parallelism(),
            run_timeout_seconds: default_run_timeout_seconds(),
            best_effort: false,
            failed_chunk_tolerance: 0.0,
            resubmit_partials: true,
            worker_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// Result aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Rescale a converted journey's credits to sum to 1.0 when they drift
    /// beyond tolerance (the mismatch is still reported)
    #[serde(default = "default_true")]
    pub normalize_credits: bool,

    /// Allowed deviation when checking per-journey credit sums
    #[serde(default = "default_credit_tolerance")]
    pub credit_tolerance: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            normalize_credits: true,
            credit_tolerance: default_credit_tolerance(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // YAML is a superset of JSON
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api.endpoint.is_empty() {
            anyhow::bail!("Scoring endpoint must not be empty");
        }
        if self.api.max_retry_attempts == 0 {
            anyhow::bail!("max_retry_attempts must be >= 1");
        }
        if self.api.max_chunk_journeys == 0 {
            anyhow::bail!("max_chunk_journeys must be > 0");
        }
        if self.api.max_chunk_bytes == 0 {
            anyhow::bail!("max_chunk_bytes must be > 0");
        }
        if self.journeys.session_timeout_minutes <= 0 {
            anyhow::bail!("session_timeout_minutes must be > 0");
        }
        if self.journeys.lookback_minutes < 0 {
            anyhow::bail!("lookback_minutes must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.journeys.validation_error_tolerance) {
            anyhow::bail!("validation_error_tolerance must be within [0, 1]");
        }
        if self.processing.scoring_parallelism == 0 {
            anyhow::bail!("scoring_parallelism must be > 0");
        }
        if self.processing.run_timeout_seconds == 0 {
            anyhow::bail!("run_timeout_seconds must be > 0");
        }
        if !(0.0..=1.0).contains(&self.processing.failed_chunk_tolerance) {
            anyhow::bail!("failed_chunk_tolerance must be within [0, 1]");
        }
        if self.aggregation.credit_tolerance <= 0.0 {
            anyhow::bail!("credit_tolerance must be > 0");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_events_path() -> String { "events.jsonl".to_string() }
fn default_report_path() -> String { "channel_report.json".to_string() }
fn default_endpoint() -> String { "https://scoring.example.com/v1/score".to_string() }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_max_retry_attempts() -> u32 { 5 }
fn default_retry_backoff_base_ms() -> u64 { 200 }
fn default_retry_backoff_max_ms() -> u64 { 10_000 }
fn default_max_chunk_journeys() -> usize { 100 }
fn default_max_chunk_bytes() -> usize { 1_048_576 }
fn default_session_timeout_minutes() -> i64 { 30 }
fn default_lookback_minutes() -> i64 { 1_440 }
fn default_validation_error_tolerance() -> f64 { 0.05 }
fn default_scoring_parallelism() -> usize { 8 }
fn default_run_timeout_seconds() -> u64 { 600 }
fn default_metrics_interval() -> u64 { 10 }
fn default_credit_tolerance() -> f64 { 1e-4 }
fn default_true() -> bool { true }
