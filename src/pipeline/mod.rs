//! Normalization pipeline.
//!
//! Takes a provider's canonical batch, classifies every record against the
//! indicator catalog, normalizes values to standard units, and splits the
//! batch into series rows (point samples, UTC) and summary rows (interval
//! aggregates, user-local wall clock). Per-record errors are counted and
//! skipped; the batch reports an aggregate success flag.

pub mod records;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{info, warn};

use crate::catalog::{self, SummaryWindow};
use crate::pipeline::records::{PulseData, RecordValue};
use crate::store::{Database, SeriesRecord, SummaryRecord};

/// Outcome of one batch.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub success: bool,
    pub series_count: usize,
    pub summary_count: usize,
    pub skipped_count: usize,
}

/// The one source whose percent-valued records arrive as fractions and need
/// scaling before unit conversion. Watch-sourced records already carry whole
/// percentages.
const FRACTIONAL_PERCENT_SOURCE: &str = "apple_health";

#[derive(Clone)]
pub struct NormalizationPipeline {
    db: Database,
}

struct PreparedRecord {
    indicator: String,
    source: String,
    value: String,
    unit: String,
    timezone: String,
    /// UTC instant of the record
    record_time: NaiveDateTime,
    start_ms: Option<i64>,
    end_ms: Option<i64>,
    source_id: Option<String>,
    task_id: Option<String>,
    custom_comment: Option<String>,
}

impl NormalizationPipeline {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Process one canonical batch for its user. Returns the aggregate
    /// outcome; storage failure of either store marks the batch failed.
    pub async fn process(&self, data: &PulseData) -> ProcessOutcome {
        let user_id = &data.meta_info.user_id;
        let meta_timezone = &data.meta_info.timezone;
        info!(user_id, count = data.health_data.len(), "Processing batch");

        let mut series_rows = Vec::new();
        let mut summary_rows = Vec::new();
        let mut skipped = 0usize;

        for record in &data.health_data {
            let Some(prepared) = self.prepare_record(record, meta_timezone) else {
                skipped += 1;
                continue;
            };

            if catalog::is_series(&prepared.indicator) {
                series_rows.push(SeriesRecord {
                    user_id: user_id.clone(),
                    indicator: prepared.indicator.clone(),
                    source: prepared.source.clone(),
                    time: prepared.record_time,
                    value: prepared.value.clone(),
                    timezone: prepared.timezone.clone(),
                    task_id: prepared.task_id.clone(),
                    source_id: prepared.source_id.clone(),
                });
            }

            if catalog::is_summary(&prepared.indicator) {
                if let Some(summary) = self.prepare_summary(user_id, &prepared) {
                    summary_rows.push(summary);
                }
            }
        }

        if skipped > 0 {
            warn!(user_id, skipped, "Skipped records during classification");
        }

        let series_count = series_rows.len();
        let summary_count = summary_rows.len();

        let series_ok = match self.db.save_series_records(&series_rows).await {
            Ok(_) => true,
            Err(e) => {
                warn!(user_id, error = %e, "Failed to save series batch");
                false
            }
        };
        let summary_ok = match self.db.save_summary_records(&summary_rows).await {
            Ok(_) => true,
            Err(e) => {
                warn!(user_id, error = %e, "Failed to save summary batch");
                false
            }
        };

        info!(
            user_id,
            series = series_count,
            summary = summary_count,
            skipped,
            "Batch processed"
        );

        ProcessOutcome {
            success: series_ok && summary_ok,
            series_count,
            summary_count,
            skipped_count: skipped,
        }
    }

    /// Trigger the best-effort cascade delete of rows derived from one raw
    /// payload: series rows by source id (both the key-based and the legacy
    /// formats), and, when the owning user is known, the summary rows that
    /// reference the payload.
    pub async fn cascade_delete(&self, user_id: Option<&str>, source_table_id: &str) {
        if let Err(e) = self.db.delete_series_by_source_id(source_table_id).await {
            warn!(source_table_id, error = %e, "Series cascade delete failed");
        }
        if let Some(user_id) = user_id {
            if let Err(e) = self
                .db
                .soft_delete_summary_by_source(user_id, "", source_table_id)
                .await
            {
                warn!(user_id, source_table_id, error = %e, "Summary cascade delete failed");
            }
        }
    }

    fn prepare_record(&self, record: &records::PulseRecord, meta_timezone: &str) -> Option<PreparedRecord> {
        let indicator = record.indicator.clone();
        if !catalog::is_valid(&indicator) {
            warn!(indicator, "Unknown indicator, dropping record");
            return None;
        }

        // Record timezone wins; "UTC" defers to the batch timezone.
        let timezone = if record.timezone.is_empty() || record.timezone == "UTC" {
            if meta_timezone.is_empty() {
                "UTC".to_string()
            } else {
                meta_timezone.to_string()
            }
        } else {
            record.timezone.clone()
        };

        let source = record.source.to_lowercase();

        let (value, unit) = match record.value.as_f64() {
            Some(mut numeric) => {
                if record.unit == "%" && source == FRACTIONAL_PERCENT_SOURCE {
                    numeric *= 100.0;
                }
                let (converted, unit) = catalog::convert(&indicator, numeric, &record.unit);
                (format_numeric(converted), unit)
            }
            // Label values pass through untouched.
            None => (record.value.to_string(), record.unit.clone()),
        };

        let record_time = DateTime::<Utc>::from_timestamp_millis(record.timestamp)?.naive_utc();

        Some(PreparedRecord {
            indicator,
            source,
            value,
            unit,
            timezone,
            record_time,
            start_ms: record.start_time,
            end_ms: record.end_time,
            source_id: record.source_id.clone(),
            task_id: record.task_id.clone(),
            custom_comment: record.comment.clone(),
        })
    }

    fn prepare_summary(&self, user_id: &str, prepared: &PreparedRecord) -> Option<SummaryRecord> {
        let (start_time, end_time) = summary_time_range(prepared)?;
        if start_time > end_time {
            warn!(
                user_id,
                indicator = prepared.indicator,
                "Summary interval inverted, dropping record"
            );
            return None;
        }

        let system_comment = format!(
            "Source: {}, Unit: {}, timezone: {}",
            prepared.source, prepared.unit, prepared.timezone
        );
        let comment = match &prepared.custom_comment {
            Some(custom) if !custom.is_empty() => format!("{}, {}", system_comment, custom),
            _ => system_comment,
        };

        Some(SummaryRecord {
            user_id: user_id.to_string(),
            indicator: prepared.indicator.clone(),
            value: prepared.value.clone(),
            start_time,
            end_time,
            source: prepared.source.clone(),
            source_table: String::new(),
            source_table_id: prepared.source_id.clone().unwrap_or_default(),
            comment,
            task_id: prepared.task_id.clone(),
        })
    }
}

/// Render a normalized numeric value without a trailing `.0` for integers,
/// matching how sources report whole counts.
fn format_numeric(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

/// Convert a UTC instant to the user's local wall clock. Unknown zones fall
/// back to UTC with a warning.
fn to_local(utc: DateTime<Utc>, timezone: &str) -> NaiveDateTime {
    if timezone == "UTC" || timezone.is_empty() {
        return utc.naive_utc();
    }
    match timezone.parse::<Tz>() {
        Ok(tz) => utc.with_timezone(&tz).naive_local(),
        Err(_) => {
            warn!(timezone, "Unknown timezone, falling back to UTC");
            utc.naive_utc()
        }
    }
}

/// Compute the `[start, end]` local-time interval of a summary record.
///
/// Explicit `startTime`/`endTime` win; otherwise the interval is inferred
/// from the indicator identifier via the catalog (`daily*` day bounds,
/// `weekly*` Monday–Sunday, `hourly*` hour bounds, else point-in-time).
fn summary_time_range(prepared: &PreparedRecord) -> Option<(NaiveDateTime, NaiveDateTime)> {
    if let (Some(start_ms), Some(end_ms)) = (prepared.start_ms, prepared.end_ms) {
        let start_utc = DateTime::<Utc>::from_timestamp_millis(start_ms)?;
        let end_utc = DateTime::<Utc>::from_timestamp_millis(end_ms)?;
        return Some((
            to_local(start_utc, &prepared.timezone),
            to_local(end_utc, &prepared.timezone),
        ));
    }

    let base = to_local(prepared.record_time.and_utc(), &prepared.timezone);

    let range = match catalog::summary_window(&prepared.indicator) {
        SummaryWindow::Daily => {
            let start = base.date().and_hms_opt(0, 0, 0)?;
            let end = base.date().and_hms_micro_opt(23, 59, 59, 999_999)?;
            (start, end)
        }
        SummaryWindow::Weekly => {
            let days_since_monday = base.weekday().num_days_from_monday() as i64;
            let monday = base.date() - TimeDelta::days(days_since_monday);
            let start = monday.and_hms_opt(0, 0, 0)?;
            let end = (monday + TimeDelta::days(6)).and_hms_micro_opt(23, 59, 59, 999_999)?;
            (start, end)
        }
        SummaryWindow::Hourly => {
            let start = base.date().and_hms_opt(base.hour(), 0, 0)?;
            let end = base
                .date()
                .and_hms_micro_opt(base.hour(), 59, 59, 999_999)?;
            (start, end)
        }
        SummaryWindow::Point => (base, base),
    };

    Some(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::records::{PulseMetaInfo, PulseRecord};

    fn meta(user: &str, timezone: &str) -> PulseMetaInfo {
        PulseMetaInfo {
            user_id: user.to_string(),
            request_id: "req-1".to_string(),
            source: "test".to_string(),
            timezone: timezone.to_string(),
            task_id: None,
        }
    }

    fn record(indicator: &str, timestamp: i64, value: f64, unit: &str) -> PulseRecord {
        PulseRecord {
            source: "theta.whoop".to_string(),
            indicator: indicator.to_string(),
            timestamp,
            unit: unit.to_string(),
            value: RecordValue::Number(value),
            timezone: "UTC".to_string(),
            start_time: None,
            end_time: None,
            source_id: Some("msg-1".to_string()),
            task_id: None,
            comment: None,
        }
    }

    fn pipeline() -> (NormalizationPipeline, Database) {
        let db = Database::open_in_memory().unwrap();
        (NormalizationPipeline::new(db.clone()), db)
    }

    #[tokio::test]
    async fn test_series_record_lands_in_series_store() {
        let (pipeline, db) = pipeline();
        let data = PulseData {
            meta_info: meta("u1", "UTC"),
            // 2023-11-14T22:13:20Z
            health_data: vec![record("heartRate", 1_700_000_000_000, 72.0, "bpm")],
        };

        let outcome = pipeline.process(&data).await;
        assert!(outcome.success);
        assert_eq!(outcome.series_count, 1);
        assert_eq!(outcome.summary_count, 0);

        let rows = db.query_series("u1", "heartRate", None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "72");
        assert_eq!(
            rows[0].time,
            NaiveDateTime::parse_from_str("2023-11-14 22:13:20", "%Y-%m-%d %H:%M:%S").unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_indicator_dropped_and_counted() {
        let (pipeline, db) = pipeline();
        let data = PulseData {
            meta_info: meta("u1", "UTC"),
            health_data: vec![record("UNKNOWN_METRIC", 1_700_000_000_000, 1.0, "")],
        };

        let outcome = pipeline.process(&data).await;
        assert!(outcome.success);
        assert_eq!(outcome.skipped_count, 1);
        assert_eq!(outcome.series_count + outcome.summary_count, 0);
        assert!(db.query_series("u1", "UNKNOWN_METRIC", None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unit_normalized_to_standard() {
        let (pipeline, db) = pipeline();
        let data = PulseData {
            meta_info: meta("u1", "UTC"),
            health_data: vec![record("caloriesActive", 1_700_000_000_000, 418.4, "kJ")],
        };

        pipeline.process(&data).await;
        let rows = db.query_series("u1", "caloriesActive", None, None).await.unwrap();
        assert_eq!(rows[0].value, "100");
    }

    #[tokio::test]
    async fn test_daily_summary_window_in_local_time() {
        let (pipeline, db) = pipeline();
        let mut steps = record("dailySteps", 1_700_000_000_000, 8000.0, "count");
        steps.timezone = "America/Los_Angeles".to_string();
        let data = PulseData {
            meta_info: meta("U", "UTC"),
            health_data: vec![steps],
        };

        pipeline.process(&data).await;
        let rows = db.query_summary("U", "dailySteps", None).await.unwrap();
        assert_eq!(rows.len(), 1);
        // 2023-11-14T22:13:20Z is 14:13 local in Los Angeles; the day bounds
        // are the local calendar day.
        assert_eq!(rows[0].start_time.to_string(), "2023-11-14 00:00:00");
        assert_eq!(rows[0].end_time.date().to_string(), "2023-11-14");
        assert!(rows[0].comment.contains("timezone: America/Los_Angeles"));
    }

    #[tokio::test]
    async fn test_summary_merge_last_writer_wins() {
        let (pipeline, db) = pipeline();
        let start = 1_704_067_200_000; // 2024-01-01T00:00:00Z
        let end = 1_704_153_599_000; // 2024-01-01T23:59:59Z

        for value in [8000.0, 9500.0] {
            let mut steps = record("dailySteps", start, value, "count");
            steps.start_time = Some(start);
            steps.end_time = Some(end);
            let data = PulseData {
                meta_info: meta("U", "UTC"),
                health_data: vec![steps],
            };
            assert!(pipeline.process(&data).await.success);
        }

        let rows = db.query_summary("U", "dailySteps", None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, "9500");
    }

    #[tokio::test]
    async fn test_dual_kind_indicator_lands_in_both_stores() {
        let (pipeline, db) = pipeline();
        let mut sleep = record("totalSleep", 1_700_000_000_000, 420.0, "min");
        sleep.start_time = Some(1_700_000_000_000 - 420 * 60 * 1000);
        sleep.end_time = Some(1_700_000_000_000);
        let data = PulseData {
            meta_info: meta("u1", "UTC"),
            health_data: vec![sleep],
        };

        let outcome = pipeline.process(&data).await;
        assert_eq!(outcome.series_count, 1);
        assert_eq!(outcome.summary_count, 1);
        assert_eq!(db.query_series("u1", "totalSleep", None, None).await.unwrap().len(), 1);
        assert_eq!(db.query_summary("u1", "totalSleep", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_percentage_scaling_for_apple_source() {
        let (pipeline, db) = pipeline();
        let mut record = record("bloodOxygen", 1_700_000_000_000, 0.97, "%");
        record.source = "apple_health".to_string();
        let data = PulseData {
            meta_info: meta("u1", "UTC"),
            health_data: vec![record],
        };

        pipeline.process(&data).await;
        let rows = db.query_series("u1", "bloodOxygen", None, None).await.unwrap();
        assert_eq!(rows[0].value, "97");
    }

    #[tokio::test]
    async fn test_watch_source_percentage_not_rescaled() {
        let (pipeline, db) = pipeline();
        let mut record = record("bloodOxygen", 1_700_000_000_000, 0.97, "%");
        record.source = "apple_health_watch".to_string();
        let data = PulseData {
            meta_info: meta("u1", "UTC"),
            health_data: vec![record],
        };

        pipeline.process(&data).await;
        let rows = db.query_series("u1", "bloodOxygen", None, None).await.unwrap();
        assert_eq!(rows[0].value, "0.97");
    }

    #[tokio::test]
    async fn test_label_value_passthrough() {
        let (pipeline, db) = pipeline();
        let mut record = record("reproductiveOvulationTestResult", 1_700_000_000_000, 0.0, "");
        record.value = RecordValue::Text("positive".to_string());
        let data = PulseData {
            meta_info: meta("u1", "UTC"),
            health_data: vec![record],
        };

        pipeline.process(&data).await;
        let rows = db
            .query_series("u1", "reproductiveOvulationTestResult", None, None)
            .await
            .unwrap();
        assert_eq!(rows[0].value, "positive");
    }

    #[tokio::test]
    async fn test_cascade_delete_clears_both_stores() {
        let (pipeline, db) = pipeline();
        let mut sleep = record("totalSleep", 1_700_000_000_000, 420.0, "min");
        sleep.start_time = Some(1_700_000_000_000 - 420 * 60 * 1000);
        sleep.end_time = Some(1_700_000_000_000);
        sleep.source_id = Some("msg-del".to_string());
        let data = PulseData {
            meta_info: meta("u1", "UTC"),
            health_data: vec![sleep],
        };
        pipeline.process(&data).await;

        pipeline.cascade_delete(Some("u1"), "msg-del").await;

        assert!(db.query_series("u1", "totalSleep", None, None).await.unwrap().is_empty());
        assert!(db.query_summary("u1", "totalSleep", None).await.unwrap().is_empty());
    }

    #[test]
    fn test_weekly_window_is_monday_to_sunday() {
        let prepared = PreparedRecord {
            indicator: "weeklyWorkoutTime".to_string(),
            source: "theta.whoop".to_string(),
            value: "120".to_string(),
            unit: "min".to_string(),
            timezone: "UTC".to_string(),
            // Wednesday 2023-11-15
            record_time: NaiveDateTime::parse_from_str("2023-11-15 10:00:00", "%Y-%m-%d %H:%M:%S").unwrap(),
            start_ms: None,
            end_ms: None,
            source_id: None,
            task_id: None,
            custom_comment: None,
        };

        let (start, end) = summary_time_range(&prepared).unwrap();
        assert_eq!(start.to_string(), "2023-11-13 00:00:00");
        assert_eq!(end.date().to_string(), "2023-11-19");
    }
}
