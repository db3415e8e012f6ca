//! Partitions the run's journeys into request-sized scoring chunks.
//!
//! Chunks respect both a journey-count cap and a serialized-size cap,
//! whichever binds first, while preserving input order. A single journey
//! that alone exceeds the size cap is still emitted, as its own flagged
//! chunk: dropping or truncating data is not an option here.

use serde::Serialize;

use crate::config::ApiConfig;
use crate::model::{Journey, RunWarning};

/// An ordered batch of journeys for one scoring request.
#[derive(Debug, Clone)]
pub struct ScoringRequestChunk {
    pub chunk_id: String,
    pub journeys: Vec<Journey>,
    /// Estimated serialized size of the journeys, in bytes.
    pub bytes: usize,
    /// Set when this chunk exceeds the size limit on its own.
    pub oversized: bool,
}

/// Chunking output plus anomalies (oversized chunks).
#[derive(Debug)]
pub struct ChunkOutcome {
    pub chunks: Vec<ScoringRequestChunk>,
    pub warnings: Vec<RunWarning>,
}

/// Splits journey sets under the configured chunk limits.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_journeys: usize,
    max_bytes: usize,
}

impl Chunker {
    pub fn new(max_journeys: usize, max_bytes: usize) -> Self {
        Self {
            max_journeys,
            max_bytes,
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        Self::new(config.max_chunk_journeys, config.max_chunk_bytes)
    }

    /// Partition `journeys` into chunks with ids `{run_id}.{seq}`.
    ///
    /// The union of the output equals the input, in order, with no journey
    /// split across chunks. Same input and limits always produce the same
    /// partition.
    pub fn chunk(&self, run_id: &str, journeys: Vec<Journey>) -> ChunkOutcome {
        let mut chunks = Vec::new();
        let mut warnings = Vec::new();

        let mut current: Vec<Journey> = Vec::new();
        let mut current_bytes = 0usize;
        let mut seq = 0usize;

        let mut flush = |current: &mut Vec<Journey>,
                         current_bytes: &mut usize,
                         seq: &mut usize,
                         chunks: &mut Vec<ScoringRequestChunk>,
                         warnings: &mut Vec<RunWarning>| {
            if current.is_empty() {
                return;
            }
            let chunk_id = format!("{run_id}.{seq}");
            *seq += 1;
            let oversized = *current_bytes > self.max_bytes;
            if oversized {
                warnings.push(RunWarning::OversizedChunk {
                    chunk_id: chunk_id.clone(),
                    journeys: current.len(),
                    bytes: *current_bytes,
                });
            }
            chunks.push(ScoringRequestChunk {
                chunk_id,
                journeys: std::mem::take(current),
                bytes: std::mem::take(current_bytes),
                oversized,
            });
        };

        for journey in journeys {
            let size = serialized_size(&journey);
            let over_count = current.len() + 1 > self.max_journeys;
            let over_bytes = current_bytes + size > self.max_bytes;
            if !current.is_empty() && (over_count || over_bytes) {
                flush(
                    &mut current,
                    &mut current_bytes,
                    &mut seq,
                    &mut chunks,
                    &mut warnings,
                );
            }
            current.push(journey);
            current_bytes += size;
        }
        flush(
            &mut current,
            &mut current_bytes,
            &mut seq,
            &mut chunks,
            &mut warnings,
        );

        ChunkOutcome { chunks, warnings }
    }
}

/// JSON size of a value, used as the wire-size estimate for chunk packing.
fn serialized_size<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}
