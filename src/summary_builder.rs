use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use polars::prelude::*;
use std::collections::HashMap;

use crate::models::{
    summary_schema, BucketWindow, UsageSummaryRow, UNKNOWN_SERVICE_POINT, UNKNOWN_UTILITY,
};
use crate::standardizer::parse_flexible_timestamp;

#[derive(Default)]
struct BucketAccumulator {
    total: f64,
    count: i64,
    peak: Option<(f64, i64)>,
    pit: Option<(f64, i64)>,
}

/// Aggregate usage records into per-service-point time buckets. Rows
/// without a usable timestamp are skipped; rows without a usable value
/// still open their bucket but contribute nothing to the aggregates.
pub fn build_usage_summary(usage: &DataFrame, window: BucketWindow) -> Result<DataFrame> {
    if usage.height() == 0 {
        return empty_summary();
    }

    let millis = coerce_timestamp_millis(usage.column("interval_start_ts")?)?;
    let utilities = text_values(usage.column("utility_id")?)?;
    let service_points = text_values(usage.column("service_point_id")?)?;
    let value_cast = usage.column("value")?.cast(&DataType::Float64)?;
    let values: Vec<Option<f64>> = value_cast.f64()?.into_iter().collect();

    let mut groups: HashMap<(String, String, i64, i64), BucketAccumulator> = HashMap::new();
    for row in 0..usage.height() {
        let ms = match millis[row] {
            Some(ms) => ms,
            None => continue,
        };
        let (bucket_start, bucket_end) = match bucket_bounds(ms, window) {
            Some(bounds) => bounds,
            None => continue,
        };

        let key = (
            utilities[row]
                .clone()
                .unwrap_or_else(|| UNKNOWN_UTILITY.to_string()),
            service_points[row]
                .clone()
                .unwrap_or_else(|| UNKNOWN_SERVICE_POINT.to_string()),
            bucket_start,
            bucket_end,
        );
        let entry = groups.entry(key).or_default();

        if let Some(value) = values[row] {
            if !value.is_nan() {
                entry.total += value;
                entry.count += 1;
                match entry.peak {
                    Some((current, _)) if current >= value => {}
                    _ => entry.peak = Some((value, ms)),
                }
                match entry.pit {
                    Some((current, _)) if current <= value => {}
                    _ => entry.pit = Some((value, ms)),
                }
            }
        }
    }

    if groups.is_empty() {
        return empty_summary();
    }

    let mut entries: Vec<_> = groups.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut utility_ids = Vec::with_capacity(entries.len());
    let mut sp_ids = Vec::with_capacity(entries.len());
    let mut starts = Vec::with_capacity(entries.len());
    let mut ends = Vec::with_capacity(entries.len());
    let mut totals = Vec::with_capacity(entries.len());
    let mut counts = Vec::with_capacity(entries.len());
    let mut peak_values: Vec<Option<f64>> = Vec::with_capacity(entries.len());
    let mut peak_ts: Vec<Option<i64>> = Vec::with_capacity(entries.len());
    let mut pit_values: Vec<Option<f64>> = Vec::with_capacity(entries.len());
    let mut pit_ts: Vec<Option<i64>> = Vec::with_capacity(entries.len());

    for ((utility, service_point, bucket_start, bucket_end), acc) in entries {
        utility_ids.push(utility);
        sp_ids.push(service_point);
        starts.push(bucket_start);
        ends.push(bucket_end);
        totals.push(acc.total);
        counts.push(acc.count);
        peak_values.push(acc.peak.map(|(value, _)| value));
        peak_ts.push(acc.peak.map(|(_, ms)| ms));
        pit_values.push(acc.pit.map(|(value, _)| value));
        pit_ts.push(acc.pit.map(|(_, ms)| ms));
    }

    let datetime = DataType::Datetime(TimeUnit::Milliseconds, None);
    Ok(DataFrame::new(vec![
        Series::new("utility_id", utility_ids),
        Series::new("service_point_id", sp_ids),
        Series::new("bucket_start", starts).cast(&datetime)?,
        Series::new("bucket_end", ends).cast(&datetime)?,
        Series::new("total_usage", totals),
        Series::new("interval_count", counts),
        Series::new("peak_usage_value", peak_values),
        Series::new("peak_usage_ts", peak_ts).cast(&datetime)?,
        Series::new("pit_usage_value", pit_values),
        Series::new("pit_usage_ts", pit_ts).cast(&datetime)?,
    ])?)
}

fn empty_summary() -> Result<DataFrame> {
    let columns: Vec<Series> = summary_schema()
        .iter()
        .map(|(name, dtype)| Series::new_empty(name, dtype))
        .collect();
    Ok(DataFrame::new(columns)?)
}

/// Timestamps arrive as datetimes from the in-process pipeline but as
/// text when a summary is rebuilt from exported CSVs.
fn coerce_timestamp_millis(column: &Series) -> Result<Vec<Option<i64>>> {
    match column.dtype() {
        DataType::Datetime(_, _) => {
            let cast = column
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
                .cast(&DataType::Int64)?;
            Ok(cast.i64()?.into_iter().collect())
        }
        DataType::Date => {
            let cast = column
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
                .cast(&DataType::Int64)?;
            Ok(cast.i64()?.into_iter().collect())
        }
        _ => {
            let cast = column.cast(&DataType::Utf8)?;
            Ok(cast
                .utf8()?
                .into_iter()
                .map(|value| value.and_then(parse_flexible_timestamp))
                .collect())
        }
    }
}

fn text_values(column: &Series) -> Result<Vec<Option<String>>> {
    let cast = column.cast(&DataType::Utf8)?;
    Ok(cast
        .utf8()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

/// Inclusive bucket bounds for the timestamp: the bucket start and the
/// last millisecond before the next bucket begins.
fn bucket_bounds(ms: i64, window: BucketWindow) -> Option<(i64, i64)> {
    let dt = DateTime::<Utc>::from_timestamp_millis(ms)?.naive_utc();
    let (start, next) = match window {
        BucketWindow::Hourly => {
            let start = dt.date().and_hms_opt(dt.hour(), 0, 0)?;
            (start, start + Duration::hours(1))
        }
        BucketWindow::Daily => {
            let start = dt.date().and_hms_opt(0, 0, 0)?;
            (start, start + Duration::days(1))
        }
        BucketWindow::Weekly => {
            let monday = dt.date()
                - Duration::days(dt.date().weekday().num_days_from_monday() as i64);
            let start = monday.and_hms_opt(0, 0, 0)?;
            (start, start + Duration::days(7))
        }
        BucketWindow::Monthly => {
            let first = NaiveDate::from_ymd_opt(dt.year(), dt.month(), 1)?;
            let next_first = if dt.month() == 12 {
                NaiveDate::from_ymd_opt(dt.year() + 1, 1, 1)?
            } else {
                NaiveDate::from_ymd_opt(dt.year(), dt.month() + 1, 1)?
            };
            (first.and_hms_opt(0, 0, 0)?, next_first.and_hms_opt(0, 0, 0)?)
        }
    };
    Some((
        start.and_utc().timestamp_millis(),
        next.and_utc().timestamp_millis() - 1,
    ))
}

fn format_bucket_ts(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => ms.to_string(),
    }
}

/// Flatten a summary frame into serializable rows for report output.
pub fn summary_rows(summary: &DataFrame) -> Result<Vec<UsageSummaryRow>> {
    let utility = summary.column("utility_id")?.cast(&DataType::Utf8)?;
    let utilities = utility.utf8()?;
    let service_point = summary.column("service_point_id")?.cast(&DataType::Utf8)?;
    let service_points = service_point.utf8()?;
    let start_cast = summary.column("bucket_start")?.cast(&DataType::Int64)?;
    let starts = start_cast.i64()?;
    let end_cast = summary.column("bucket_end")?.cast(&DataType::Int64)?;
    let ends = end_cast.i64()?;
    let totals = summary.column("total_usage")?.f64()?;
    let counts = summary.column("interval_count")?.i64()?;
    let peak_values = summary.column("peak_usage_value")?.f64()?;
    let peak_cast = summary.column("peak_usage_ts")?.cast(&DataType::Int64)?;
    let peaks = peak_cast.i64()?;
    let pit_values = summary.column("pit_usage_value")?.f64()?;
    let pit_cast = summary.column("pit_usage_ts")?.cast(&DataType::Int64)?;
    let pits = pit_cast.i64()?;

    let mut rows = Vec::with_capacity(summary.height());
    for row in 0..summary.height() {
        rows.push(UsageSummaryRow {
            utility_id: utilities.get(row).unwrap_or("").to_string(),
            service_point_id: service_points.get(row).unwrap_or("").to_string(),
            bucket_start: format_bucket_ts(starts.get(row).unwrap_or(0)),
            bucket_end: format_bucket_ts(ends.get(row).unwrap_or(0)),
            total_usage: totals.get(row).unwrap_or(0.0),
            interval_count: counts.get(row).unwrap_or(0),
            peak_usage_value: peak_values.get(row),
            peak_usage_ts: peaks.get(row).map(format_bucket_ts),
            pit_usage_value: pit_values.get(row),
            pit_usage_ts: pits.get(row).map(format_bucket_ts),
        });
    }
    Ok(rows)
}
