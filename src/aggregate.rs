//! Reduces returned touchpoint scores into the channel report.
//!
//! The reduction is a commutative, associative fold over per-channel sums,
//! so the report is independent of chunk completion order. Double counting
//! is ruled out structurally: chunk results are deduplicated by chunk id,
//! and scores by (journey, timestamp, channel), before anything is summed.
//! Derived metrics are computed once over the final totals rather than
//! incrementally.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

use crate::config::AggregationConfig;
use crate::journey::JourneyIndex;
use crate::model::{
    ChannelReport, ChannelRow, ChunkResult, ChunkStatus, RunRequest, RunWarning,
};

/// Aggregation output: the report plus data-quality warnings.
#[derive(Debug)]
pub struct AggregateOutcome {
    pub report: ChannelReport,
    pub warnings: Vec<RunWarning>,
    /// Journeys that received at least one credit.
    pub journeys_scored: usize,
}

/// Running totals for one channel.
#[derive(Debug, Default, Clone, Copy)]
struct ChannelTotals {
    credit: f64,
    touchpoints: u64,
    conversions: u64,
    revenue: f64,
}

impl ChannelTotals {
    fn merge(&mut self, other: &ChannelTotals) {
        self.credit += other.credit;
        self.touchpoints += other.touchpoints;
        self.conversions += other.conversions;
        self.revenue += other.revenue;
    }
}

/// Reduces chunk results for one run into a [`ChannelReport`].
pub struct ResultAggregator {
    config: AggregationConfig,
}

impl ResultAggregator {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config }
    }

    /// Aggregate every successful and partial chunk result. Failed chunks
    /// contribute nothing; invariant violations become warnings, never
    /// errors.
    pub fn aggregate(
        &self,
        request: &RunRequest,
        results: &[ChunkResult],
        index: &JourneyIndex,
    ) -> AggregateOutcome {
        let mut warnings = Vec::new();

        // Per-journey score sets, deduplicated at both levels.
        let mut seen_chunks: HashSet<&str> = HashSet::new();
        let mut by_journey: BTreeMap<usize, BTreeMap<(DateTime<Utc>, String), f64>> =
            BTreeMap::new();

        for result in results {
            if !seen_chunks.insert(&result.chunk_id) {
                tracing::debug!("Ignoring duplicate result for chunk {}", result.chunk_id);
                continue;
            }
            if result.status == ChunkStatus::Failed {
                continue;
            }
            for score in &result.scores {
                let Some(ordinal) = index.resolve(&score.customer_id, score.timestamp) else {
                    warnings.push(RunWarning::UnmatchedScore {
                        chunk_id: result.chunk_id.clone(),
                        customer_id: score.customer_id.clone(),
                        timestamp: score.timestamp,
                    });
                    continue;
                };
                by_journey
                    .entry(ordinal)
                    .or_default()
                    .entry((score.timestamp, score.channel.clone()))
                    .or_insert(score.credit);
            }
        }

        let journeys_scored = by_journey.len();

        // Fold each journey's validated credits into the channel totals.
        let mut channels: BTreeMap<String, ChannelTotals> = BTreeMap::new();
        for (ordinal, scores) in by_journey {
            let Some(entry) = index.entry(ordinal) else {
                continue;
            };

            let sum: f64 = scores.values().sum();
            let expected = if entry.converted { 1.0 } else { 0.0 };
            let mut scale = 1.0;
            if (sum - expected).abs() > self.config.credit_tolerance {
                warnings.push(RunWarning::CreditSumMismatch {
                    customer_id: entry.customer_id.clone(),
                    journey_end: entry.end_timestamp,
                    sum,
                    expected,
                });
                if self.config.normalize_credits && entry.converted && sum > 0.0 {
                    scale = 1.0 / sum;
                }
            }

            let mut journey_totals: BTreeMap<&str, ChannelTotals> = BTreeMap::new();
            for ((_, channel), credit) in &scores {
                let credit = credit * scale;
                let totals = journey_totals.entry(channel.as_str()).or_default();
                totals.credit += credit;
                totals.touchpoints += 1;
                totals.revenue += credit * entry.revenue.unwrap_or(0.0);
            }
            if entry.converted {
                if let Some(channel) = entry.converting_channel.as_deref() {
                    journey_totals.entry(channel).or_default().conversions += 1;
                }
            }

            for (channel, totals) in journey_totals {
                channels
                    .entry(channel.to_string())
                    .or_default()
                    .merge(&totals);
            }
        }

        // Derived metrics over the final totals only.
        let total_credit: f64 = channels.values().map(|t| t.credit).sum();
        let total_revenue: f64 = channels.values().map(|t| t.revenue).sum();

        let rows: Vec<ChannelRow> = channels
            .into_iter()
            .map(|(channel, totals)| ChannelRow {
                channel,
                total_credit: totals.credit,
                touchpoint_count: totals.touchpoints,
                conversion_count: totals.conversions,
                attributed_revenue: totals.revenue,
                share_of_credit: if total_credit > 0.0 {
                    totals.credit / total_credit
                } else {
                    0.0
                },
                avg_credit_per_touchpoint: if totals.touchpoints > 0 {
                    totals.credit / totals.touchpoints as f64
                } else {
                    0.0
                },
            })
            .collect();

        AggregateOutcome {
            report: ChannelReport {
                run_id: request.run_id.clone(),
                window_start: request.window_start,
                window_end: request.window_end,
                rows,
                total_credit,
                total_revenue,
            },
            warnings,
            journeys_scored,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrValue, EventType, Journey, TouchpointEvent, TouchpointScore};
    use chrono::TimeZone;
    use std::collections::BTreeMap as Map;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    fn request() -> RunRequest {
        RunRequest {
            run_id: "run-1".into(),
            window_start: ts(-60),
            window_end: ts(60),
            best_effort: false,
        }
    }

    fn event(
        customer: &str,
        channel: &str,
        minutes: i64,
        event_type: EventType,
    ) -> TouchpointEvent {
        TouchpointEvent {
            customer_id: customer.into(),
            channel: channel.into(),
            timestamp: ts(minutes),
            event_type,
            attributes: Map::new(),
        }
    }

    /// One converted journey: Google impression, Facebook click, Google
    /// conversion.
    fn three_touch_journey(revenue: Option<f64>) -> Journey {
        let mut conversion = event("C1", "Google", 20, EventType::Conversion);
        if let Some(value) = revenue {
            conversion
                .attributes
                .insert("revenue".into(), AttrValue::Float(value));
        }
        Journey {
            customer_id: "C1".into(),
            events: vec![
                event("C1", "Google", 0, EventType::Impression),
                event("C1", "Facebook", 10, EventType::Click),
                conversion,
            ],
        }
    }

    fn score(customer: &str, channel: &str, minutes: i64, credit: f64) -> TouchpointScore {
        TouchpointScore {
            customer_id: customer.into(),
            channel: channel.into(),
            timestamp: ts(minutes),
            credit,
        }
    }

    fn success(chunk_id: &str, scores: Vec<TouchpointScore>) -> ChunkResult {
        ChunkResult {
            chunk_id: chunk_id.into(),
            status: ChunkStatus::Success,
            scores,
            unscored: Vec::new(),
            error: None,
        }
    }

    fn aggregator() -> ResultAggregator {
        ResultAggregator::new(AggregationConfig::default())
    }

    #[test]
    fn test_channel_totals_from_converted_journey() {
        let journeys = vec![three_touch_journey(None)];
        let index = JourneyIndex::build(&journeys);
        let results = vec![success(
            "run-1.0",
            vec![
                score("C1", "Google", 0, 0.4),
                score("C1", "Facebook", 10, 0.3),
                score("C1", "Google", 20, 0.3),
            ],
        )];

        let outcome = aggregator().aggregate(&request(), &results, &index);

        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.journeys_scored, 1);

        let report = &outcome.report;
        assert_eq!(report.rows.len(), 2);
        let facebook = &report.rows[0];
        let google = &report.rows[1];
        assert_eq!(facebook.channel, "Facebook");
        assert_eq!(google.channel, "Google");
        assert!((google.total_credit - 0.7).abs() < 1e-9);
        assert!((facebook.total_credit - 0.3).abs() < 1e-9);
        assert_eq!(google.touchpoint_count, 2);
        assert_eq!(google.conversion_count, 1);
        assert_eq!(facebook.conversion_count, 0);
        assert!((google.share_of_credit - 0.7).abs() < 1e-9);
        assert!((google.avg_credit_per_touchpoint - 0.35).abs() < 1e-9);
        assert!((report.total_credit - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_total_mass_preserved() {
        let journeys = vec![three_touch_journey(None)];
        let index = JourneyIndex::build(&journeys);
        let credits = [0.5, 0.25, 0.25];
        let results = vec![success(
            "run-1.0",
            vec![
                score("C1", "Google", 0, credits[0]),
                score("C1", "Facebook", 10, credits[1]),
                score("C1", "Google", 20, credits[2]),
            ],
        )];

        let outcome = aggregator().aggregate(&request(), &results, &index);
        let input_sum: f64 = credits.iter().sum();
        assert!((outcome.report.total_credit - input_sum).abs() < 1e-9);
    }

    #[test]
    fn test_order_independence() {
        let journeys = vec![
            three_touch_journey(None),
            Journey {
                customer_id: "C2".into(),
                events: vec![event("C2", "TikTok", 5, EventType::Conversion)],
            },
        ];
        let index = JourneyIndex::build(&journeys);
        let mut results = vec![
            success(
                "run-1.0",
                vec![
                    score("C1", "Google", 0, 0.4),
                    score("C1", "Facebook", 10, 0.3),
                    score("C1", "Google", 20, 0.3),
                ],
            ),
            success("run-1.1", vec![score("C2", "TikTok", 5, 1.0)]),
        ];

        let forward = aggregator().aggregate(&request(), &results, &index);
        results.reverse();
        let backward = aggregator().aggregate(&request(), &results, &index);

        assert_eq!(forward.report, backward.report);
    }

    #[test]
    fn test_duplicate_chunk_results_counted_once() {
        let journeys = vec![three_touch_journey(None)];
        let index = JourneyIndex::build(&journeys);
        let scores = vec![
            score("C1", "Google", 0, 0.4),
            score("C1", "Facebook", 10, 0.3),
            score("C1", "Google", 20, 0.3),
        ];
        let once = vec![success("run-1.0", scores.clone())];
        let twice = vec![
            success("run-1.0", scores.clone()),
            success("run-1.0", scores),
        ];

        let single = aggregator().aggregate(&request(), &once, &index);
        let double = aggregator().aggregate(&request(), &twice, &index);

        assert_eq!(single.report, double.report);
    }

    #[test]
    fn test_failed_chunks_contribute_zero() {
        let journeys = vec![three_touch_journey(None)];
        let index = JourneyIndex::build(&journeys);
        let results = vec![ChunkResult::failed(
            "run-1.0".into(),
            crate::error::ScoringError::ServiceUnavailable(500),
        )];

        let outcome = aggregator().aggregate(&request(), &results, &index);
        assert!(outcome.report.rows.is_empty());
        assert_eq!(outcome.report.total_credit, 0.0);
    }

    #[test]
    fn test_credit_sum_mismatch_normalized() {
        let journeys = vec![three_touch_journey(None)];
        let index = JourneyIndex::build(&journeys);
        // sums to 0.8 instead of 1.0
        let results = vec![success(
            "run-1.0",
            vec![
                score("C1", "Google", 0, 0.4),
                score("C1", "Facebook", 10, 0.2),
                score("C1", "Google", 20, 0.2),
            ],
        )];

        let outcome = aggregator().aggregate(&request(), &results, &index);

        assert!(matches!(
            outcome.warnings[0],
            RunWarning::CreditSumMismatch { .. }
        ));
        // normalized back to unit mass
        assert!((outcome.report.total_credit - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_credit_sum_mismatch_kept_when_normalization_off() {
        let journeys = vec![three_touch_journey(None)];
        let index = JourneyIndex::build(&journeys);
        let results = vec![success(
            "run-1.0",
            vec![
                score("C1", "Google", 0, 0.4),
                score("C1", "Facebook", 10, 0.2),
                score("C1", "Google", 20, 0.2),
            ],
        )];

        let aggregator = ResultAggregator::new(AggregationConfig {
            normalize_credits: false,
            ..AggregationConfig::default()
        });
        let outcome = aggregator.aggregate(&request(), &results, &index);

        assert_eq!(outcome.warnings.len(), 1);
        assert!((outcome.report.total_credit - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_non_converting_journey_with_credit_warns() {
        let journeys = vec![Journey {
            customer_id: "C1".into(),
            events: vec![event("C1", "Google", 0, EventType::Click)],
        }];
        let index = JourneyIndex::build(&journeys);
        let results = vec![success("run-1.0", vec![score("C1", "Google", 0, 0.5)])];

        let outcome = aggregator().aggregate(&request(), &results, &index);

        assert!(matches!(
            outcome.warnings[0],
            RunWarning::CreditSumMismatch { expected, .. } if expected == 0.0
        ));
        // no normalization for non-converting journeys
        assert!((outcome.report.total_credit - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unmatched_score_warns_and_skips() {
        let journeys = vec![three_touch_journey(None)];
        let index = JourneyIndex::build(&journeys);
        let results = vec![success("run-1.0", vec![score("C9", "Google", 0, 1.0)])];

        let outcome = aggregator().aggregate(&request(), &results, &index);

        assert!(matches!(
            outcome.warnings[0],
            RunWarning::UnmatchedScore { .. }
        ));
        assert!(outcome.report.rows.is_empty());
        assert_eq!(outcome.journeys_scored, 0);
    }

    #[test]
    fn test_revenue_attributed_by_credit_share() {
        let journeys = vec![three_touch_journey(Some(200.0))];
        let index = JourneyIndex::build(&journeys);
        let results = vec![success(
            "run-1.0",
            vec![
                score("C1", "Google", 0, 0.4),
                score("C1", "Facebook", 10, 0.3),
                score("C1", "Google", 20, 0.3),
            ],
        )];

        let outcome = aggregator().aggregate(&request(), &results, &index);

        let facebook = &outcome.report.rows[0];
        let google = &outcome.report.rows[1];
        assert!((google.attributed_revenue - 140.0).abs() < 1e-9);
        assert!((facebook.attributed_revenue - 60.0).abs() < 1e-9);
        assert!((outcome.report.total_revenue - 200.0).abs() < 1e-9);
    }
}
