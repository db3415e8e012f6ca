//! Lookup structure resolving returned scores back to the journeys that
//! produced them.
//!
//! The wire contract identifies results by (customer_id, timestamp) only, and
//! a customer can have several journeys in one run. The index is built once
//! from the full journey set and queried during validation and aggregation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::model::Journey;

/// Per-journey facts needed after scoring.
#[derive(Debug, Clone)]
pub struct JourneyEntry {
    pub customer_id: String,
    pub end_timestamp: DateTime<Utc>,
    pub touchpoint_count: usize,
    pub converted: bool,
    pub converting_channel: Option<String>,
    pub revenue: Option<f64>,
}

/// Maps (customer_id, touchpoint timestamp) to a journey ordinal.
#[derive(Debug, Default)]
pub struct JourneyIndex {
    touchpoints: HashMap<(String, DateTime<Utc>), usize>,
    entries: Vec<JourneyEntry>,
}

impl JourneyIndex {
    /// Build the index over the full journey set for a run.
    pub fn build(journeys: &[Journey]) -> Self {
        let mut touchpoints = HashMap::new();
        let mut entries = Vec::with_capacity(journeys.len());

        for (ordinal, journey) in journeys.iter().enumerate() {
            entries.push(JourneyEntry {
                customer_id: journey.customer_id.clone(),
                end_timestamp: journey.end_timestamp().unwrap_or_default(),
                touchpoint_count: journey.len(),
                converted: journey.converted(),
                converting_channel: journey.converting_channel().map(String::from),
                revenue: journey.revenue(),
            });
            for event in &journey.events {
                touchpoints
                    .entry((journey.customer_id.clone(), event.timestamp))
                    .or_insert(ordinal);
            }
        }

        Self {
            touchpoints,
            entries,
        }
    }

    /// Resolve a returned score to a journey ordinal.
    pub fn resolve(&self, customer_id: &str, timestamp: DateTime<Utc>) -> Option<usize> {
        self.touchpoints
            .get(&(customer_id.to_string(), timestamp))
            .copied()
    }

    pub fn entry(&self, ordinal: usize) -> Option<&JourneyEntry> {
        self.entries.get(ordinal)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventType, TouchpointEvent};
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::minutes(minutes)
    }

    fn journey(customer: &str, minutes: &[i64], converted: bool) -> Journey {
        let last = minutes.len() - 1;
        let events = minutes
            .iter()
            .enumerate()
            .map(|(i, &m)| TouchpointEvent {
                customer_id: customer.into(),
                channel: "Google".into(),
                timestamp: ts(m),
                event_type: if converted && i == last {
                    EventType::Conversion
                } else {
                    EventType::Click
                },
                attributes: BTreeMap::new(),
            })
            .collect();
        Journey {
            customer_id: customer.into(),
            events,
        }
    }

    #[test]
    fn test_resolves_across_multiple_journeys_per_customer() {
        let journeys = vec![
            journey("C1", &[0, 10], true),
            journey("C1", &[60, 70], true),
            journey("C2", &[5], false),
        ];
        let index = JourneyIndex::build(&journeys);

        assert_eq!(index.len(), 3);
        assert_eq!(index.resolve("C1", ts(10)), Some(0));
        assert_eq!(index.resolve("C1", ts(60)), Some(1));
        assert_eq!(index.resolve("C2", ts(5)), Some(2));
        assert_eq!(index.resolve("C2", ts(10)), None);
        assert_eq!(index.resolve("C3", ts(0)), None);
    }

    #[test]
    fn test_entry_facts() {
        let journeys = vec![journey("C1", &[0, 10, 20], true), journey("C2", &[5], false)];
        let index = JourneyIndex::build(&journeys);

        let converted = index.entry(0).unwrap();
        assert!(converted.converted);
        assert_eq!(converted.touchpoint_count, 3);
        assert_eq!(converted.end_timestamp, ts(20));

        let open = index.entry(1).unwrap();
        assert!(!open.converted);
        assert_eq!(open.revenue, None);
    }
}
