//! Groups raw touchpoint events into customer journeys.
//!
//! The builder runs a single pass over events sorted by (customer, time):
//! a journey closes when its last event is a conversion, or when the gap to
//! the next event exceeds the session timeout. The pass produces immutable
//! [`Journey`] values; nothing downstream ever mutates them.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::config::JourneyConfig;
use crate::error::PipelineError;
use crate::model::{Journey, RunWarning, TouchpointEvent};

/// Journey construction output: the journeys plus every anomaly observed on
/// the way.
#[derive(Debug)]
pub struct BuildOutcome {
    pub journeys: Vec<Journey>,
    pub warnings: Vec<RunWarning>,
    pub events_total: usize,
    pub events_rejected: usize,
    pub events_deduplicated: usize,
    /// Journeys discarded because they ended outside the run window or did
    /// not convert while non-converting journeys are excluded.
    pub journeys_dropped: usize,
}

/// Builds journeys for one run window.
pub struct JourneyBuilder {
    config: JourneyConfig,
}

impl JourneyBuilder {
    pub fn new(config: JourneyConfig) -> Self {
        Self { config }
    }

    /// Build the journeys that end within `[window_start, window_end]`.
    ///
    /// `events` is the storage query result for the window plus lookback; it
    /// does not need to be pre-sorted. Fails only when the fraction of
    /// events rejected by channel validation exceeds the configured
    /// tolerance.
    pub fn build(
        &self,
        mut events: Vec<TouchpointEvent>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<BuildOutcome, PipelineError> {
        let events_total = events.len();
        let mut warnings = Vec::new();

        // Channel whitelist check. Rejected events are excluded, not fatal,
        // unless too much of the input is bad.
        let mut events_rejected = 0;
        if !self.config.channel_whitelist.is_empty() {
            let allowed: HashSet<&str> = self
                .config
                .channel_whitelist
                .iter()
                .map(String::as_str)
                .collect();
            events.retain(|e| {
                if allowed.contains(e.channel.as_str()) {
                    true
                } else {
                    events_rejected += 1;
                    warnings.push(RunWarning::UnknownChannel {
                        customer_id: e.customer_id.clone(),
                        channel: e.channel.clone(),
                        timestamp: e.timestamp,
                    });
                    false
                }
            });

            if events_total > 0 {
                let fraction = events_rejected as f64 / events_total as f64;
                if fraction > self.config.validation_error_tolerance {
                    return Err(PipelineError::ValidationThreshold {
                        invalid: events_rejected,
                        total: events_total,
                        tolerance: self.config.validation_error_tolerance,
                    });
                }
            }
        }

        // Stable sort keeps input order among equal keys, so the first
        // occurrence of a duplicate survives deduplication.
        events.sort_by(|a, b| {
            (a.customer_id.as_str(), a.timestamp).cmp(&(b.customer_id.as_str(), b.timestamp))
        });

        let mut events_deduplicated = 0;
        if self.config.dedupe_duplicates {
            let mut seen: HashSet<(String, String, DateTime<Utc>)> =
                HashSet::with_capacity(events.len());
            events.retain(|e| {
                let key = (e.customer_id.clone(), e.channel.clone(), e.timestamp);
                if seen.insert(key) {
                    true
                } else {
                    events_deduplicated += 1;
                    warnings.push(RunWarning::DuplicateEvent {
                        customer_id: e.customer_id.clone(),
                        channel: e.channel.clone(),
                        timestamp: e.timestamp,
                    });
                    false
                }
            });
        }

        let session_timeout = Duration::minutes(self.config.session_timeout_minutes);

        let mut journeys = Vec::new();
        let mut journeys_dropped = 0;
        let mut current: Vec<TouchpointEvent> = Vec::new();

        let mut flush = |events: &mut Vec<TouchpointEvent>,
                         journeys: &mut Vec<Journey>,
                         journeys_dropped: &mut usize| {
            if events.is_empty() {
                return;
            }
            let journey = Journey {
                customer_id: events[0].customer_id.clone(),
                events: std::mem::take(events),
            };
            let end = journey.end_timestamp().unwrap_or(window_start);
            let in_window = end >= window_start && end <= window_end;
            let keep = in_window && (journey.converted() || self.config.include_non_converting);
            if keep {
                journeys.push(journey);
            } else {
                *journeys_dropped += 1;
            }
        };

        for event in events {
            if let Some(prev) = current.last() {
                let boundary = prev.customer_id != event.customer_id
                    || prev.is_conversion()
                    || event.timestamp - prev.timestamp > session_timeout;
                if boundary {
                    flush(&mut current, &mut journeys, &mut journeys_dropped);
                }
            }
            let is_conversion = event.is_conversion();
            current.push(event);
            if is_conversion {
                flush(&mut current, &mut journeys, &mut journeys_dropped);
            }
        }
        flush(&mut current, &mut journeys, &mut journeys_dropped);

        Ok(BuildOutcome {
            journeys,
            warnings,
            events_total,
            events_rejected,
            events_deduplicated,
            journeys_dropped,
        })
    }
}
