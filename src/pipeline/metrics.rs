//! Run progress monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for one pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Events read from storage
    pub events_loaded: AtomicU64,

    /// Duplicate events dropped
    pub events_deduplicated: AtomicU64,

    /// Events rejected by channel validation
    pub events_rejected: AtomicU64,

    /// Journeys emitted by the builder
    pub journeys_built: AtomicU64,

    /// Chunks submitted in the first scoring pass
    pub chunks_total: AtomicU64,

    /// Chunks fully scored
    pub chunks_succeeded: AtomicU64,

    /// Chunks partially scored
    pub chunks_partial: AtomicU64,

    /// Chunks that permanently failed
    pub chunks_failed: AtomicU64,

    /// Chunks submitted again for unscored journeys
    pub chunks_resubmitted: AtomicU64,

    /// Touchpoint scores received
    pub scores_received: AtomicU64,

    /// Warnings recorded across the run
    pub warnings: AtomicU64,

    /// Time spent in the scoring stage (microseconds)
    pub scoring_us: AtomicU64,

    /// Start time
    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Self::default()
        })
    }

    pub fn add_events_loaded(&self, count: u64) {
        self.events_loaded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_events_deduplicated(&self, count: u64) {
        self.events_deduplicated.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_events_rejected(&self, count: u64) {
        self.events_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_journeys_built(&self, count: u64) {
        self.journeys_built.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_chunks_total(&self, count: u64) {
        self.chunks_total.store(count, Ordering::Relaxed);
    }

    pub fn add_chunk_succeeded(&self) {
        self.chunks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_partial(&self) {
        self.chunks_partial.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_resubmitted(&self) {
        self.chunks_resubmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_scores_received(&self, count: u64) {
        self.scores_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_warnings(&self, count: u64) {
        self.warnings.fetch_add(count, Ordering::Relaxed);
    }

    /// Record time spent in the scoring stage (in microseconds).
    pub fn add_scoring_time(&self, duration: Duration) {
        self.scoring_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Chunks completed per second across the scoring stage.
    pub fn chunks_per_second(&self) -> f64 {
        let done = self.chunks_succeeded.load(Ordering::Relaxed)
            + self.chunks_partial.load(Ordering::Relaxed)
            + self.chunks_failed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_loaded: self.events_loaded.load(Ordering::Relaxed),
            events_deduplicated: self.events_deduplicated.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            journeys_built: self.journeys_built.load(Ordering::Relaxed),
            chunks_total: self.chunks_total.load(Ordering::Relaxed),
            chunks_succeeded: self.chunks_succeeded.load(Ordering::Relaxed),
            chunks_partial: self.chunks_partial.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            chunks_resubmitted: self.chunks_resubmitted.load(Ordering::Relaxed),
            scores_received: self.scores_received.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            chunks_per_second: self.chunks_per_second(),
            scoring_secs: self.scoring_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub events_loaded: u64,
    pub events_deduplicated: u64,
    pub events_rejected: u64,
    pub journeys_built: u64,
    pub chunks_total: u64,
    pub chunks_succeeded: u64,
    pub chunks_partial: u64,
    pub chunks_failed: u64,
    pub chunks_resubmitted: u64,
    pub scores_received: u64,
    pub warnings: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub chunks_per_second: f64,
    /// Total time spent waiting on the scoring service (seconds, summed
    /// across workers)
    pub scoring_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Chunks: {} ok, {} partial, {} failed of {} | Scores: {} | \
             Journeys: {} | Rate: {:.1} chunks/s | Warnings: {} | Elapsed: {:.1}s",
            self.chunks_succeeded,
            self.chunks_partial,
            self.chunks_failed,
            self.chunks_total,
            self.scores_received,
            self.journeys_built,
            self.chunks_per_second,
            self.warnings,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic metrics reporter for the scoring stage.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_chunks: u64,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_chunks: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_chunks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let done = snapshot.chunks_succeeded
                        + snapshot.chunks_partial
                        + snapshot.chunks_failed;
                    let progress = if self.total_chunks > 0 {
                        done as f64 / self.total_chunks as f64 * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_events_loaded(100);
        metrics.add_events_loaded(50);

        assert_eq!(metrics.events_loaded.load(Ordering::Relaxed), 150);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.set_chunks_total(3);
        metrics.add_chunk_succeeded();
        metrics.add_chunk_partial();
        metrics.add_chunk_failed();
        metrics.add_scores_received(42);
        metrics.add_warnings(2);

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.chunks_total, 3);
        assert_eq!(snapshot.chunks_succeeded, 1);
        assert_eq!(snapshot.chunks_partial, 1);
        assert_eq!(snapshot.chunks_failed, 1);
        assert_eq!(snapshot.scores_received, 42);
        assert_eq!(snapshot.warnings, 2);
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_chunk_succeeded();

        assert_eq!(metrics.chunks_per_second(), 0.0);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        metrics.set_chunks_total(10);
        metrics.add_chunk_succeeded();
        metrics.add_chunk_failed();
        metrics.add_scores_received(25);

        let display = format!("{}", metrics.snapshot());

        assert!(display.contains("1 ok"));
        assert!(display.contains("1 failed"));
        assert!(display.contains("of 10"));
        assert!(display.contains("Scores: 25"));
    }

    #[test]
    fn test_scoring_time_accumulates() {
        let metrics = Metrics::new();
        metrics.add_scoring_time(Duration::from_millis(100));
        metrics.add_scoring_time(Duration::from_millis(150));

        let snapshot = metrics.snapshot();
        assert!((snapshot.scoring_secs - 0.25).abs() < 0.001);
    }
}
