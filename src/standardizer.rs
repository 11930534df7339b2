use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use rayon::prelude::*;
use std::collections::HashMap;

use crate::adapters::{apply_mapping, SourceAdapter};
use crate::landing::RawSourceTables;
use crate::models::{
    interval_schema, meter_schema, service_point_schema, UNKNOWN_UTILITY,
};

/// Canonical entity tables combined across every source.
#[derive(Debug)]
pub struct StandardizedTables {
    pub service_points: DataFrame,
    pub meters: DataFrame,
    pub intervals: DataFrame,
}

/// Run every adapter against its raw tables, combine the per-source
/// results, then dedup and backfill missing utility tags.
pub fn build_standardized(
    raw: &HashMap<String, RawSourceTables>,
    adapters: &[Box<dyn SourceAdapter>],
) -> Result<StandardizedTables> {
    let per_source: Vec<(DataFrame, DataFrame, DataFrame)> = adapters
        .par_iter()
        .map(|adapter| standardize_source(raw, adapter.as_ref()))
        .collect::<Result<Vec<_>>>()?;

    let mut sp_parts = Vec::with_capacity(per_source.len());
    let mut meter_parts = Vec::with_capacity(per_source.len());
    let mut interval_parts = Vec::with_capacity(per_source.len());
    for (service_points, meters, intervals) in per_source {
        sp_parts.push(service_points.lazy());
        meter_parts.push(meters.lazy());
        interval_parts.push(intervals.lazy());
    }

    let service_points = concat(sp_parts, UnionArgs::default())?.collect()?;
    let meters = concat(meter_parts, UnionArgs::default())?.collect()?;
    let intervals = concat(interval_parts, UnionArgs::default())?.collect()?;

    // Dedup before backfill so repeated exports collapse on the raw tag.
    let service_points = backfill_utility_tags(
        dedup_first(&service_points, &["utility_id", "service_point_id"])?,
        &["service_point_id"],
        adapters,
    )?;
    let meters = backfill_utility_tags(
        dedup_first(&meters, &["utility_id", "meter_id"])?,
        &["service_point_id", "meter_id"],
        adapters,
    )?;
    let intervals = backfill_utility_tags(
        dedup_first(
            &intervals,
            &[
                "utility_id",
                "service_point_id",
                "meter_id",
                "interval_start_ts",
                "channel",
            ],
        )?,
        &["service_point_id", "meter_id"],
        adapters,
    )?;

    Ok(StandardizedTables {
        service_points,
        meters,
        intervals,
    })
}

fn standardize_source(
    raw: &HashMap<String, RawSourceTables>,
    adapter: &dyn SourceAdapter,
) -> Result<(DataFrame, DataFrame, DataFrame)> {
    let source_id = adapter.source_id();
    let tables = raw
        .get(source_id)
        .ok_or_else(|| anyhow::anyhow!("no raw tables loaded for source '{}'", source_id))?;

    let service_points = select_canonical(
        apply_mapping(&tables.service_points, &adapter.service_point_mapping())?,
        &service_point_schema(),
    )?;
    let meters = select_canonical(
        apply_mapping(&tables.meters, &adapter.meter_mapping())?,
        &meter_schema(),
    )?;

    let mut intervals = apply_mapping(&tables.intervals, &adapter.interval_mapping())?;
    intervals = parse_timestamp_column(
        intervals,
        "interval_start_ts",
        &adapter.interval_timestamp_formats(),
    )?;
    if adapter.intervals_need_meter_linkage() {
        intervals = link_intervals_to_meters(intervals, &meters)?;
    }
    intervals = derive_interval_end(intervals)?;
    let intervals = select_canonical(intervals, &interval_schema())?;

    Ok((service_points, meters, intervals))
}

/// Project onto the canonical column order. Also catches any stage that
/// forgot to produce a column, since the selection fails by name.
fn select_canonical(df: DataFrame, schema: &[(&'static str, DataType)]) -> Result<DataFrame> {
    let exprs: Vec<Expr> = schema.iter().map(|(name, _)| col(name)).collect();
    Ok(df.lazy().select(exprs).collect()?)
}

/// Replace a textual timestamp column with parsed millisecond datetimes.
/// Source formats are tried first, then the flexible ISO-style parser.
/// Unparsable values become null rather than aborting the run.
fn parse_timestamp_column(
    mut df: DataFrame,
    name: &str,
    formats: &[&'static str],
) -> Result<DataFrame> {
    let raw = df.column(name)?.cast(&DataType::Utf8)?;
    let millis: Vec<Option<i64>> = raw
        .utf8()?
        .into_iter()
        .map(|value| value.and_then(|text| parse_timestamp(text, formats)))
        .collect();

    let parsed = Series::new(name, millis)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
    df.with_column(parsed)?;
    Ok(df)
}

fn parse_timestamp(text: &str, formats: &[&'static str]) -> Option<i64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    for format in formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
        }
    }
    parse_flexible_timestamp(trimmed)
}

const DATETIME_FORMATS: [&str; 6] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
];

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%m/%d/%Y"];

/// Best-effort parser for the timestamp shapes seen across exports.
/// Date-only values land at midnight.
pub(crate) fn parse_flexible_timestamp(text: &str) -> Option<i64> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp_millis());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt.and_utc().timestamp_millis());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis());
        }
    }
    None
}

/// Inherit the service point from the source's meter records. Readings
/// whose meter is unknown keep a null service point.
fn link_intervals_to_meters(intervals: DataFrame, meters: &DataFrame) -> Result<DataFrame> {
    let dropped = intervals.drop("service_point_id")?;

    // One linkage row per meter, or the join would multiply readings.
    let linkage_keys = vec!["utility_id".to_string(), "meter_id".to_string()];
    let linkage = meters
        .clone()
        .lazy()
        .select([col("utility_id"), col("meter_id"), col("service_point_id")])
        .collect()?
        .unique_stable(Some(&linkage_keys), UniqueKeepStrategy::First, None)?;

    let joined = dropped
        .lazy()
        .join(
            linkage.lazy(),
            [col("utility_id"), col("meter_id")],
            [col("utility_id"), col("meter_id")],
            JoinArgs::new(JoinType::Left),
        )
        .collect()?;
    Ok(joined)
}

/// interval_end_ts = interval_start_ts + duration_seconds. A null start
/// stays null; a null duration counts as zero.
fn derive_interval_end(mut df: DataFrame) -> Result<DataFrame> {
    let starts = df.column("interval_start_ts")?.cast(&DataType::Int64)?;
    let start_ms: Vec<Option<i64>> = starts.i64()?.into_iter().collect();
    let durations: Vec<Option<f64>> = df
        .column("duration_seconds")?
        .f64()?
        .into_iter()
        .collect();

    let mut end_ms: Vec<Option<i64>> = Vec::with_capacity(start_ms.len());
    for (start, duration) in start_ms.iter().zip(durations.iter()) {
        let end = start.map(|ms| ms + (duration.unwrap_or(0.0) * 1000.0) as i64);
        end_ms.push(end);
    }

    let ends = Series::new("interval_end_ts", end_ms)
        .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?;
    df.with_column(ends)?;
    Ok(df)
}

fn dedup_first(df: &DataFrame, keys: &[&str]) -> Result<DataFrame> {
    let subset: Vec<String> = keys.iter().map(|key| key.to_string()).collect();
    Ok(df.unique_stable(Some(&subset), UniqueKeepStrategy::First, None)?)
}

/// Fill null utility tags from identifier shape. Rows whose tag is
/// already set are never touched.
fn backfill_utility_tags(
    df: DataFrame,
    id_columns: &[&str],
    adapters: &[Box<dyn SourceAdapter>],
) -> Result<DataFrame> {
    if df.column("utility_id")?.null_count() == 0 {
        return Ok(df);
    }

    let tags: Vec<Option<String>> = df
        .column("utility_id")?
        .utf8()?
        .into_iter()
        .map(|tag| tag.map(str::to_string))
        .collect();

    let mut id_values: Vec<Vec<Option<String>>> = Vec::with_capacity(id_columns.len());
    for name in id_columns {
        let cast = df.column(name)?.cast(&DataType::Utf8)?;
        let values: Vec<Option<String>> = cast
            .utf8()?
            .into_iter()
            .map(|value| value.map(str::to_string))
            .collect();
        id_values.push(values);
    }

    let mut filled = Vec::with_capacity(df.height());
    for row in 0..df.height() {
        let tag = match &tags[row] {
            Some(tag) => tag.clone(),
            None => {
                let candidate = id_values
                    .iter()
                    .find_map(|column| column[row].clone())
                    .unwrap_or_default();
                infer_utility_tag(&candidate, adapters)
                    .unwrap_or(UNKNOWN_UTILITY)
                    .to_string()
            }
        };
        filled.push(tag);
    }

    let mut out = df;
    out.with_column(Series::new("utility_id", filled))?;
    Ok(out)
}

/// First adapter that claims the identifier wins, so registry order is
/// the precedence order.
pub fn infer_utility_tag(id: &str, adapters: &[Box<dyn SourceAdapter>]) -> Option<&'static str> {
    adapters
        .iter()
        .find(|adapter| adapter.claims_id(id))
        .map(|adapter| adapter.utility_tag())
}
