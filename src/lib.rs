//! Attribution Pipeline
//!
//! Assembles per-customer touchpoint journeys from raw events, submits them
//! to a remote multi-touch-attribution scoring service in bounded batches,
//! and reduces the returned credits into a per-channel report.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Journey**: grouping events into session-bounded customer journeys
//! - **Chunk**: partitioning journeys into request-sized batches
//! - **Scoring**: the HTTP client with retry/backoff and a shared rate gate
//! - **Aggregate**: order-independent reduction into channel totals
//! - **Pipeline**: run orchestration with per-stage state and metrics
//!
//! # Usage
//!
//! ```no_run
//! use attribution_pipeline::{run_pipeline, Config, RunRequest};
//! use chrono::Utc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let request = RunRequest {
//!         run_id: "run-20240601".into(),
//!         window_start: Utc::now() - chrono::Duration::days(1),
//!         window_end: Utc::now(),
//!         best_effort: false,
//!     };
//!     let summary = run_pipeline(config, request).await?;
//!     println!("{:?}", summary.status);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod chunk;
pub mod config;
pub mod error;
pub mod journey;
pub mod model;
pub mod pipeline;
pub mod scoring;
pub mod storage;

pub use aggregate::ResultAggregator;
pub use chunk::{Chunker, ScoringRequestChunk};
pub use config::Config;
pub use error::{PipelineError, ScoringError, StorageError};
pub use journey::{JourneyBuilder, JourneyIndex};
pub use model::{ChannelReport, Journey, RunRequest, RunStatus, RunSummary, TouchpointEvent};
pub use pipeline::{Metrics, PipelineOrchestrator};
pub use scoring::ScoringClient;
pub use storage::{EventStore, JsonlEventStore};

use anyhow::Result;
use std::sync::Arc;

/// Run one full pipeline pass with the given configuration.
pub async fn run_pipeline(config: Config, request: RunRequest) -> Result<RunSummary> {
    config.validate()?;

    let config = Arc::new(config);

    tracing::info!("Starting attribution pipeline run {}", request.run_id);
    tracing::info!(
        "Window: {} .. {} (lookback {} min)",
        request.window_start,
        request.window_end,
        config.journeys.lookback_minutes
    );

    let store = Arc::new(JsonlEventStore::from_config(&config.storage));
    let orchestrator = PipelineOrchestrator::new(config.clone(), store)?;

    let summary = orchestrator.run(request).await;

    if let Some(path) = &config.processing.metrics_output_path {
        let snapshot = orchestrator.metrics().snapshot();
        if let Err(e) = snapshot.save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path, e);
        }
    }

    tracing::info!(
        "Run {} finished: {:?} ({} chunks ok, {} partial, {} failed, {} warnings)",
        summary.run_id,
        summary.status,
        summary.chunks_succeeded,
        summary.chunks_partial,
        summary.chunks_failed,
        summary.warning_count()
    );

    Ok(summary)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}
