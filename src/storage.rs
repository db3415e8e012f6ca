//! Storage collaborator: event reads and report writes.
//!
//! The pipeline only ever talks to the [`EventStore`] trait; the JSON-lines
//! implementation here backs the CLI and tests. Retries are the store's own
//! concern, not the pipeline's.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;

use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::model::{ChannelReport, TouchpointEvent};

/// Read/write seam toward the persistence layer.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Read events with timestamps in `[window_start - lookback, window_end]`.
    async fn read_events(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<TouchpointEvent>, StorageError>;

    /// Persist the finished report for `run_id`.
    async fn write_report(
        &self,
        report: &ChannelReport,
        run_id: &str,
    ) -> Result<(), StorageError>;
}

/// File-backed store: events as JSON lines, report as JSON with an optional
/// CSV export.
pub struct JsonlEventStore {
    events_path: PathBuf,
    report_path: PathBuf,
    report_csv_path: Option<PathBuf>,
}

impl JsonlEventStore {
    pub fn new(events_path: PathBuf, report_path: PathBuf) -> Self {
        Self {
            events_path,
            report_path,
            report_csv_path: None,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            events_path: PathBuf::from(&config.events_path),
            report_path: PathBuf::from(&config.report_path),
            report_csv_path: config.report_csv_path.as_ref().map(PathBuf::from),
        }
    }
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn read_events(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        lookback: Duration,
    ) -> Result<Vec<TouchpointEvent>, StorageError> {
        let contents = tokio::fs::read_to_string(&self.events_path).await?;
        let earliest = window_start - lookback;

        let mut events = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: TouchpointEvent =
                serde_json::from_str(line).map_err(|e| StorageError::Malformed {
                    line: number + 1,
                    message: e.to_string(),
                })?;
            if event.timestamp >= earliest && event.timestamp <= window_end {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn write_report(
        &self,
        report: &ChannelReport,
        run_id: &str,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(report).map_err(|e| StorageError::Malformed {
            line: 0,
            message: e.to_string(),
        })?;
        tokio::fs::write(&self.report_path, json).await?;
        tracing::info!(
            "Report for run {} written to {}",
            run_id,
            self.report_path.display()
        );

        if let Some(csv_path) = &self.report_csv_path {
            tokio::fs::write(csv_path, render_csv(report)).await?;
            tracing::info!("CSV export written to {}", csv_path.display());
        }
        Ok(())
    }
}

fn render_csv(report: &ChannelReport) -> String {
    let mut out = String::from(
        "channel,total_credit,touchpoint_count,conversion_count,attributed_revenue,\
         share_of_credit,avg_credit_per_touchpoint\n",
    );
    for row in &report.rows {
        out.push_str(&format!(
            "{},{:.6},{},{},{:.2},{:.6},{:.6}\n",
            row.channel,
            row.total_credit,
            row.touchpoint_count,
            row.conversion_count,
            row.attributed_revenue,
            row.share_of_credit,
            row.avg_credit_per_touchpoint,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelRow, EventType};
    use chrono::TimeZone;

    fn ts(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn event_line(customer: &str, minutes: i64) -> String {
        format!(
            r#"{{"customer_id":"{customer}","channel":"Google","timestamp":"{}","event_type":"click"}}"#,
            ts(minutes).to_rfc3339()
        )
    }

    #[tokio::test]
    async fn test_read_events_filters_window_with_lookback() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.jsonl");
        let lines = [
            event_line("C-old", -120), // before lookback
            event_line("C-lookback", -30),
            event_line("C-in", 10),
            event_line("C-late", 120), // after window end
        ];
        std::fs::write(&events_path, lines.join("\n")).unwrap();

        let store = JsonlEventStore::new(events_path, dir.path().join("report.json"));
        let events = store
            .read_events(ts(0), ts(60), Duration::minutes(60))
            .await
            .unwrap();

        let customers: Vec<_> = events.iter().map(|e| e.customer_id.as_str()).collect();
        assert_eq!(customers, vec!["C-lookback", "C-in"]);
        assert_eq!(events[1].event_type, EventType::Click);
    }

    #[tokio::test]
    async fn test_read_events_rejects_malformed_line() {
        let dir = tempfile::tempdir().unwrap();
        let events_path = dir.path().join("events.jsonl");
        let contents = format!("{}\nnot json\n", event_line("C1", 0));
        std::fs::write(&events_path, contents).unwrap();

        let store = JsonlEventStore::new(events_path, dir.path().join("report.json"));
        let err = store
            .read_events(ts(0), ts(60), Duration::minutes(0))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Malformed { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let store = JsonlEventStore::new(
            PathBuf::from("/nonexistent/events.jsonl"),
            PathBuf::from("/nonexistent/report.json"),
        );
        let err = store
            .read_events(ts(0), ts(60), Duration::minutes(0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[tokio::test]
    async fn test_write_report_json_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let report_path = dir.path().join("report.json");
        let csv_path = dir.path().join("report.csv");

        let store = JsonlEventStore {
            events_path: dir.path().join("events.jsonl"),
            report_path: report_path.clone(),
            report_csv_path: Some(csv_path.clone()),
        };

        let report = ChannelReport {
            run_id: "run-1".into(),
            window_start: ts(0),
            window_end: ts(60),
            rows: vec![ChannelRow {
                channel: "Google".into(),
                total_credit: 0.7,
                touchpoint_count: 2,
                conversion_count: 1,
                attributed_revenue: 140.0,
                share_of_credit: 0.7,
                avg_credit_per_touchpoint: 0.35,
            }],
            total_credit: 1.0,
            total_revenue: 200.0,
        };

        store.write_report(&report, "run-1").await.unwrap();

        let json = std::fs::read_to_string(&report_path).unwrap();
        let back: ChannelReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);

        let csv = std::fs::read_to_string(&csv_path).unwrap();
        let mut lines = csv.lines();
        assert!(lines.next().unwrap().starts_with("channel,total_credit"));
        assert!(lines.next().unwrap().starts_with("Google,0.700000,2,1,140.00"));
    }
}
