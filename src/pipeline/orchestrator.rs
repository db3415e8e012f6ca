//! Sequences one attribution run across its stages.
//!
//! ```text
//! Idle -> Loading -> Building -> Chunking -> Scoring -> Aggregating -> Persisting -> Done
//!                                                                            \-> Failed
//! ```
//!
//! Chunks score concurrently up to the configured parallelism; everything
//! else is sequential. Chunk failures are isolated: a failed chunk never
//! aborts its siblings, and the run only fails once every chunk has been
//! attempted and the failure fraction exceeds tolerance (or immediately on
//! storage errors, validation overflow, or the run timeout). Duplicate chunk
//! submissions are deduplicated by chunk id before aggregation, which makes
//! resubmission idempotent.

use chrono::Duration as ChronoDuration;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::aggregate::ResultAggregator;
use crate::chunk::{Chunker, ScoringRequestChunk};
use crate::config::Config;
use crate::error::PipelineError;
use crate::journey::{JourneyBuilder, JourneyIndex};
use crate::model::{
    ChunkResult, ChunkStatus, FailedChunk, RunRequest, RunStatus, RunSummary, RunWarning,
};
use crate::pipeline::{Metrics, MetricsReporter};
use crate::scoring::ScoringClient;
use crate::storage::EventStore;

/// Stage of a run, used for logging and failure attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Loading,
    Building,
    Chunking,
    Scoring,
    Aggregating,
    Persisting,
    Done,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "Idle",
            RunState::Loading => "Loading",
            RunState::Building => "Building",
            RunState::Chunking => "Chunking",
            RunState::Scoring => "Scoring",
            RunState::Aggregating => "Aggregating",
            RunState::Persisting => "Persisting",
            RunState::Done => "Done",
            RunState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Drives one run end to end.
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    store: Arc<dyn EventStore>,
    client: ScoringClient,
    metrics: Arc<Metrics>,
}

impl PipelineOrchestrator {
    pub fn new(config: Arc<Config>, store: Arc<dyn EventStore>) -> anyhow::Result<Self> {
        let client = ScoringClient::new(&config.api)?;
        Ok(Self {
            config,
            store,
            client,
            metrics: Metrics::new(),
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Execute a run. Always returns a summary; fatal errors surface as
    /// `RunStatus::Failed` with nothing persisted.
    pub async fn run(&self, request: RunRequest) -> RunSummary {
        let mut state = RunState::Idle;
        let mut warnings = Vec::new();
        let mut failed_chunks = Vec::new();

        let result = self
            .run_inner(&request, &mut state, &mut warnings, &mut failed_chunks)
            .await;

        match result {
            Ok(summary) => summary,
            Err(error) => {
                tracing::error!("Run {} failed during {}: {}", request.run_id, state, error);
                self.advance(&mut state, RunState::Failed);
                let snapshot = self.metrics.snapshot();
                RunSummary {
                    run_id: request.run_id,
                    status: RunStatus::Failed,
                    events_loaded: snapshot.events_loaded as usize,
                    journeys_built: snapshot.journeys_built as usize,
                    journeys_scored: 0,
                    chunks_total: snapshot.chunks_total as usize,
                    chunks_succeeded: snapshot.chunks_succeeded as usize,
                    chunks_partial: snapshot.chunks_partial as usize,
                    chunks_failed: snapshot.chunks_failed as usize,
                    warnings,
                    failed_chunks,
                }
            }
        }
    }

    fn advance(&self, state: &mut RunState, next: RunState) {
        tracing::info!("Run state: {} -> {}", state, next);
        *state = next;
    }

    async fn run_inner(
        &self,
        request: &RunRequest,
        state: &mut RunState,
        warnings: &mut Vec<RunWarning>,
        failed_chunks: &mut Vec<FailedChunk>,
    ) -> Result<RunSummary, PipelineError> {
        let processing = &self.config.processing;
        let best_effort = request.best_effort || processing.best_effort;

        // Loading
        self.advance(state, RunState::Loading);
        let lookback = ChronoDuration::minutes(self.config.journeys.lookback_minutes);
        let events = self
            .store
            .read_events(request.window_start, request.window_end, lookback)
            .await?;
        self.metrics.add_events_loaded(events.len() as u64);
        tracing::info!("Loaded {} events for run {}", events.len(), request.run_id);

        // Building
        self.advance(state, RunState::Building);
        let builder = JourneyBuilder::new(self.config.journeys.clone());
        let build = builder.build(events, request.window_start, request.window_end)?;
        self.metrics.add_journeys_built(build.journeys.len() as u64);
        self.metrics
            .add_events_deduplicated(build.events_deduplicated as u64);
        self.metrics.add_events_rejected(build.events_rejected as u64);
        warnings.extend(build.warnings);
        tracing::info!(
            "Built {} journeys ({} events deduplicated, {} rejected, {} journeys dropped)",
            build.journeys.len(),
            build.events_deduplicated,
            build.events_rejected,
            build.journeys_dropped
        );

        let events_loaded = build.events_total;
        let journeys_built = build.journeys.len();
        let index = JourneyIndex::build(&build.journeys);

        // Chunking
        self.advance(state, RunState::Chunking);
        let chunker = Chunker::from_config(&self.config.api);
        let chunked = chunker.chunk(&request.run_id, build.journeys);
        warnings.extend(chunked.warnings);
        let chunks = chunked.chunks;
        self.metrics.set_chunks_total(chunks.len() as u64);
        tracing::info!(
            "Partitioned {} journeys into {} chunks ({} parallel)",
            journeys_built,
            chunks.len(),
            processing.scoring_parallelism
        );

        // Scoring
        self.advance(state, RunState::Scoring);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if processing.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                processing.metrics_interval_secs,
                chunks.len() as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let scoring_start = Instant::now();
        let timeout = Duration::from_secs(processing.run_timeout_seconds);
        let scoring = tokio::time::timeout(timeout, self.score_with_resubmission(&chunks)).await;
        self.metrics.add_scoring_time(scoring_start.elapsed());

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        // Timeout aborts in-flight submissions and discards everything.
        let results =
            scoring.map_err(|_| PipelineError::RunTimeout(processing.run_timeout_seconds))?;

        // Failure policy: evaluated only after every chunk has been
        // attempted. Resubmission results are keyed `.r1` and never count as
        // chunk failures; their journeys are surfaced as unscored instead.
        let first_pass_failed: Vec<&ChunkResult> = results
            .iter()
            .filter(|r| r.status == ChunkStatus::Failed && !r.chunk_id.ends_with(".r1"))
            .collect();
        for result in &first_pass_failed {
            failed_chunks.push(FailedChunk {
                chunk_id: result.chunk_id.clone(),
                error: result
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }
        let failed_count = first_pass_failed.len();
        if failed_count > 0 && !best_effort {
            let fraction = failed_count as f64 / chunks.len().max(1) as f64;
            if fraction > processing.failed_chunk_tolerance {
                return Err(PipelineError::ChunkFailures {
                    failed: failed_count,
                    total: chunks.len(),
                });
            }
        }

        warnings.extend(unscored_warnings(&chunks, &results, &index));

        // Aggregating
        self.advance(state, RunState::Aggregating);
        let aggregator = ResultAggregator::new(self.config.aggregation.clone());
        let aggregated = aggregator.aggregate(request, &results, &index);
        warnings.extend(aggregated.warnings);
        self.metrics.add_warnings(warnings.len() as u64);

        // Persisting
        self.advance(state, RunState::Persisting);
        self.store
            .write_report(&aggregated.report, &request.run_id)
            .await?;

        self.advance(state, RunState::Done);

        let snapshot = self.metrics.snapshot();
        let status = if failed_count > 0 {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Done
        };
        Ok(RunSummary {
            run_id: request.run_id.clone(),
            status,
            events_loaded,
            journeys_built,
            journeys_scored: aggregated.journeys_scored,
            chunks_total: chunks.len(),
            chunks_succeeded: snapshot.chunks_succeeded as usize,
            chunks_partial: snapshot.chunks_partial as usize,
            chunks_failed: failed_count,
            warnings: std::mem::take(warnings),
            failed_chunks: std::mem::take(failed_chunks),
        })
    }

    /// First scoring pass over all chunks, then one resubmission pass for
    /// journeys that partial responses left unscored.
    async fn score_with_resubmission(
        &self,
        chunks: &[ScoringRequestChunk],
    ) -> Vec<ChunkResult> {
        let mut results = self.score_all(chunks, true).await;

        if !self.config.processing.resubmit_partials {
            return results;
        }

        let by_id: HashMap<&str, &ScoringRequestChunk> =
            chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();

        let mut resubmits = Vec::new();
        for result in &results {
            if result.status != ChunkStatus::Partial {
                continue;
            }
            let Some(chunk) = by_id.get(result.chunk_id.as_str()) else {
                continue;
            };
            let journeys: Vec<_> = result
                .unscored
                .iter()
                .filter_map(|&idx| chunk.journeys.get(idx).cloned())
                .collect();
            if !journeys.is_empty() {
                resubmits.push(ScoringRequestChunk {
                    chunk_id: format!("{}.r1", result.chunk_id),
                    journeys,
                    bytes: 0,
                    oversized: false,
                });
            }
        }

        if resubmits.is_empty() {
            return results;
        }

        tracing::info!(
            "Resubmitting {} chunk(s) for unscored journeys",
            resubmits.len()
        );
        for _ in &resubmits {
            self.metrics.add_chunk_resubmitted();
        }
        results.extend(self.score_all(&resubmits, false).await);
        results
    }

    /// Score chunks concurrently under the parallelism limit. Outcome
    /// counters are only recorded for the first pass.
    async fn score_all(
        &self,
        chunks: &[ScoringRequestChunk],
        record_outcomes: bool,
    ) -> Vec<ChunkResult> {
        stream::iter(chunks)
            .map(|chunk| {
                let client = self.client.clone();
                let metrics = self.metrics.clone();
                async move {
                    let result = client.score_chunk(chunk).await;
                    if record_outcomes {
                        match result.status {
                            ChunkStatus::Success => metrics.add_chunk_succeeded(),
                            ChunkStatus::Partial => metrics.add_chunk_partial(),
                            ChunkStatus::Failed => metrics.add_chunk_failed(),
                        }
                    }
                    metrics.add_scores_received(result.scores.len() as u64);
                    result
                }
            })
            .buffer_unordered(self.config.processing.scoring_parallelism)
            .collect()
            .await
    }
}

/// Warnings for journeys that ended the scoring stage without any credit.
fn unscored_warnings(
    chunks: &[ScoringRequestChunk],
    results: &[ChunkResult],
    index: &JourneyIndex,
) -> Vec<RunWarning> {
    let mut covered: HashSet<usize> = HashSet::new();
    for result in results {
        for score in &result.scores {
            if let Some(ordinal) = index.resolve(&score.customer_id, score.timestamp) {
                covered.insert(ordinal);
            }
        }
    }

    let by_id: HashMap<&str, &ScoringRequestChunk> =
        chunks.iter().map(|c| (c.chunk_id.as_str(), c)).collect();

    let mut warnings = Vec::new();
    for result in results {
        if result.status != ChunkStatus::Partial {
            continue;
        }
        let Some(chunk) = by_id.get(result.chunk_id.as_str()) else {
            continue;
        };
        for &idx in &result.unscored {
            let Some(journey) = chunk.journeys.get(idx) else {
                continue;
            };
            let still_unscored = journey
                .end_timestamp()
                .and_then(|ts| index.resolve(&journey.customer_id, ts))
                .map(|ordinal| !covered.contains(&ordinal))
                .unwrap_or(true);
            if still_unscored {
                warnings.push(RunWarning::UnscoredJourney {
                    chunk_id: result.chunk_id.clone(),
                    customer_id: journey.customer_id.clone(),
                });
            }
        }
    }
    warnings
}
