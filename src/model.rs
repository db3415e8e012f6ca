//! Core data model for the attribution pipeline.
//!
//! Events flow through the pipeline as immutable values: raw
//! [`TouchpointEvent`]s are grouped into [`Journey`]s, journeys are batched
//! into scoring chunks, and the service's [`TouchpointScore`]s are reduced
//! into a [`ChannelReport`]. Nothing here is mutated after construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ScoringError;

/// Kind of touchpoint interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Impression,
    Click,
    Conversion,
}

/// Scalar attribute value attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// A single raw touchpoint event as read from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchpointEvent {
    pub customer_id: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttrValue>,
}

impl TouchpointEvent {
    pub fn is_conversion(&self) -> bool {
        self.event_type == EventType::Conversion
    }
}

/// An ordered sequence of touchpoints for one customer, ending either with a
/// conversion (inclusive) or at a session/window boundary.
///
/// Invariants, upheld by the builder: timestamps are strictly non-decreasing,
/// and at most one conversion appears, as the last element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub customer_id: String,
    pub events: Vec<TouchpointEvent>,
}

impl Journey {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether this journey ended with a conversion.
    pub fn converted(&self) -> bool {
        self.events.last().is_some_and(|e| e.is_conversion())
    }

    /// Timestamp of the last touchpoint.
    pub fn end_timestamp(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.timestamp)
    }

    /// Channel of the converting touchpoint, if the journey converted.
    pub fn converting_channel(&self) -> Option<&str> {
        self.events
            .last()
            .filter(|e| e.is_conversion())
            .map(|e| e.channel.as_str())
    }

    /// Revenue carried on the conversion event's attributes, if any.
    pub fn revenue(&self) -> Option<f64> {
        self.events
            .last()
            .filter(|e| e.is_conversion())
            .and_then(|e| e.attributes.get("revenue"))
            .and_then(AttrValue::as_f64)
    }
}

/// Per-touchpoint credit returned by the scoring service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TouchpointScore {
    pub customer_id: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    pub credit: f64,
}

/// Outcome of one chunk submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Success,
    Partial,
    Failed,
}

/// Result of submitting one chunk to the scoring service, after retries.
#[derive(Debug)]
pub struct ChunkResult {
    pub chunk_id: String,
    pub status: ChunkStatus,
    pub scores: Vec<TouchpointScore>,
    /// Positions (within the submitted chunk) of journeys the response did
    /// not fully cover. Empty unless `status` is `Partial`.
    pub unscored: Vec<usize>,
    pub error: Option<ScoringError>,
}

impl ChunkResult {
    pub fn failed(chunk_id: String, error: ScoringError) -> Self {
        Self {
            chunk_id,
            status: ChunkStatus::Failed,
            scores: Vec::new(),
            unscored: Vec::new(),
            error: Some(error),
        }
    }
}

/// One row of the final channel report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    pub channel: String,
    pub total_credit: f64,
    pub touchpoint_count: u64,
    pub conversion_count: u64,
    pub attributed_revenue: f64,
    /// This channel's fraction of all credit in the run.
    pub share_of_credit: f64,
    pub avg_credit_per_touchpoint: f64,
}

/// Channel-level attribution report for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelReport {
    pub run_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub rows: Vec<ChannelRow>,
    pub total_credit: f64,
    pub total_revenue: f64,
}

/// Parameters for one pipeline run, supplied by the trigger collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub run_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub best_effort: bool,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Done,
    Failed,
    PartiallyFailed,
}

/// A recoverable anomaly observed during a run. Warnings never abort a run on
/// their own; they are enumerated in the summary with enough context to
/// re-drive the affected subset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunWarning {
    UnknownChannel {
        customer_id: String,
        channel: String,
        timestamp: DateTime<Utc>,
    },
    DuplicateEvent {
        customer_id: String,
        channel: String,
        timestamp: DateTime<Utc>,
    },
    OversizedChunk {
        chunk_id: String,
        journeys: usize,
        bytes: usize,
    },
    CreditSumMismatch {
        customer_id: String,
        journey_end: DateTime<Utc>,
        sum: f64,
        expected: f64,
    },
    UnscoredJourney {
        chunk_id: String,
        customer_id: String,
    },
    UnmatchedScore {
        chunk_id: String,
        customer_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl std::fmt::Display for RunWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunWarning::UnknownChannel {
                customer_id,
                channel,
                timestamp,
            } => write!(
                f,
                "unknown channel {channel:?} for customer {customer_id} at {timestamp}"
            ),
            RunWarning::DuplicateEvent {
                customer_id,
                channel,
                timestamp,
            } => write!(
                f,
                "duplicate event for customer {customer_id} on {channel} at {timestamp}"
            ),
            RunWarning::OversizedChunk {
                chunk_id,
                journeys,
                bytes,
            } => write!(
                f,
                "chunk {chunk_id} exceeds size limit ({journeys} journeys, {bytes} bytes)"
            ),
            RunWarning::CreditSumMismatch {
                customer_id,
                journey_end,
                sum,
                expected,
            } => write!(
                f,
                "credit sum {sum:.6} (expected {expected:.1}) for customer {customer_id} \
                 journey ending {journey_end}"
            ),
            RunWarning::UnscoredJourney {
                chunk_id,
                customer_id,
            } => write!(f, "journey for customer {customer_id} unscored in chunk {chunk_id}"),
            RunWarning::UnmatchedScore {
                chunk_id,
                customer_id,
                timestamp,
            } => write!(
                f,
                "score for customer {customer_id} at {timestamp} in chunk {chunk_id} \
                 matches no submitted touchpoint"
            ),
        }
    }
}

/// A chunk that permanently failed, with the terminal error rendered for the
/// summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedChunk {
    pub chunk_id: String,
    pub error: String,
}

/// End-of-run summary returned to the trigger collaborator.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub events_loaded: usize,
    pub journeys_built: usize,
    pub journeys_scored: usize,
    pub chunks_total: usize,
    pub chunks_succeeded: usize,
    pub chunks_partial: usize,
    pub chunks_failed: usize,
    pub warnings: Vec<RunWarning>,
    pub failed_chunks: Vec<FailedChunk>,
}

impl RunSummary {
    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}
