use anyhow::Result;
use polars::prelude::*;

use crate::models::{usage_base_columns, usage_location_columns, AccessLevel, UNKNOWN_UTILITY};
use crate::pii_masking::mask_pii;
use crate::standardizer::StandardizedTables;

/// Join readings with their meter and service point context into flat
/// usage records, fill unresolved utility tags with the unknown marker,
/// then apply the masking policy for the requested access level.
/// Unlinked readings keep a null service point in the record table; the
/// summary stage fills the marker when it groups.
pub fn build_usage_records(
    tables: &StandardizedTables,
    level: AccessLevel,
) -> Result<DataFrame> {
    // LazyFrame::join forwards only JoinArgs::how in this polars
    // version, so the collision suffixes have to go through the builder.
    let joined = tables
        .intervals
        .clone()
        .lazy()
        .join_builder()
        .with(tables.meters.clone().lazy())
        .left_on([col("utility_id"), col("meter_id")])
        .right_on([col("utility_id"), col("meter_id")])
        .how(JoinType::Left)
        .suffix("_meter")
        .finish()
        .join_builder()
        .with(tables.service_points.clone().lazy())
        .left_on([col("utility_id"), col("service_point_id")])
        .right_on([col("utility_id"), col("service_point_id")])
        .how(JoinType::Left)
        .suffix("_sp")
        .finish()
        .collect()?;

    let filled = fill_null_text(joined, "utility_id", UNKNOWN_UTILITY)?;
    let ordered = order_usage_columns(filled)?;
    mask_pii(&ordered, level)
}

fn fill_null_text(mut df: DataFrame, name: &str, filler: &str) -> Result<DataFrame> {
    if df.column(name)?.null_count() == 0 {
        return Ok(df);
    }
    let cast = df.column(name)?.cast(&DataType::Utf8)?;
    let values: Vec<String> = cast
        .utf8()?
        .into_iter()
        .map(|value| value.unwrap_or(filler).to_string())
        .collect();
    df.with_column(Series::new(name, values))?;
    Ok(df)
}

/// Reading columns first, then location, then whatever enrichment the
/// joins brought along in frame order.
fn order_usage_columns(df: DataFrame) -> Result<DataFrame> {
    let present: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut ordered: Vec<String> = Vec::with_capacity(present.len());
    for name in usage_base_columns() {
        if present.iter().any(|column| column == name) {
            ordered.push(name.to_string());
        }
    }
    for name in usage_location_columns() {
        if present.iter().any(|column| column == name) {
            ordered.push(name.to_string());
        }
    }
    for name in &present {
        if !ordered.contains(name) {
            ordered.push(name.clone());
        }
    }

    let exprs: Vec<Expr> = ordered.iter().map(|name| col(name)).collect();
    Ok(df.lazy().select(exprs).collect()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn millis(text: &str) -> i64 {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
            .unwrap()
            .and_utc()
            .timestamp_millis()
    }

    fn sample_tables() -> StandardizedTables {
        let intervals = DataFrame::new(vec![
            Series::new("utility_id", vec!["UTILITY1", "UTILITY1", "UTILITY2"]),
            Series::new(
                "service_point_id",
                vec![Some("SP-100"), Some("SP-100"), None],
            ),
            Series::new("meter_id", vec!["MTR-1", "MTR-1", "88001"]),
            Series::new(
                "interval_start_ts",
                vec![
                    Some(millis("2024-01-05 08:00:00")),
                    Some(millis("2024-01-05 14:00:00")),
                    Some(millis("2024-01-05 08:00:00")),
                ],
            )
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .unwrap(),
            Series::new("value", vec![10.0, 30.0, 7.5]),
            Series::new("channel", vec!["kwh", "kwh", "kwh"]),
            Series::new("quality", vec!["GOOD", "GOOD", "EST"]),
        ])
        .unwrap();

        let meters = DataFrame::new(vec![
            Series::new("utility_id", vec!["UTILITY1"]),
            Series::new("meter_id", vec!["MTR-1"]),
            Series::new("serial_number", vec!["MTR-1"]),
            Series::new("service_point_id", vec![Some("SP-100")]),
            Series::new("created_at", vec!["2020-01-01"]),
        ])
        .unwrap();

        let service_points = DataFrame::new(vec![
            Series::new("utility_id", vec!["UTILITY1"]),
            Series::new("service_point_id", vec!["SP-100"]),
            Series::new("street", vec!["1 Main St"]),
            Series::new("city", vec!["Albany"]),
            Series::new("zip", vec!["12207"]),
            Series::new("state", vec!["NY"]),
            Series::new("created_at", vec!["2019-12-31"]),
        ])
        .unwrap();

        StandardizedTables {
            service_points,
            meters,
            intervals,
        }
    }

    #[test]
    fn test_usage_records_enrich_with_meter_and_location() {
        let usage = build_usage_records(&sample_tables(), AccessLevel::Internal).unwrap();
        assert_eq!(usage.height(), 3);

        let names = usage.get_column_names();
        assert!(names.contains(&"serial_number"));
        assert!(names.contains(&"city"));

        assert_eq!(
            usage.column("city").unwrap().utf8().unwrap().get(0),
            Some("Albany")
        );
    }

    #[test]
    fn test_join_collisions_carry_meter_and_sp_suffixes() {
        let usage = build_usage_records(&sample_tables(), AccessLevel::Internal).unwrap();
        let names = usage.get_column_names();

        // Both tables carry a service point id and a created_at stamp;
        // the joined sides stay tellable apart.
        assert!(names.contains(&"service_point_id_meter"));
        assert!(names.contains(&"created_at"));
        assert!(names.contains(&"created_at_sp"));
        assert!(!names.iter().any(|name| name.ends_with("_right")));

        assert_eq!(
            usage.column("created_at").unwrap().utf8().unwrap().get(0),
            Some("2020-01-01")
        );
        assert_eq!(
            usage.column("created_at_sp").unwrap().utf8().unwrap().get(0),
            Some("2019-12-31")
        );
    }

    #[test]
    fn test_unlinked_reading_keeps_null_service_point() {
        let usage = build_usage_records(&sample_tables(), AccessLevel::Internal).unwrap();
        assert_eq!(usage.column("utility_id").unwrap().null_count(), 0);

        let sp = usage.column("service_point_id").unwrap();
        assert_eq!(sp.null_count(), 1);
        assert_eq!(sp.utf8().unwrap().get(2), None);
        // Location stays null for the unlinked reading
        assert_eq!(usage.column("city").unwrap().utf8().unwrap().get(2), None);
    }

    #[test]
    fn test_untagged_reading_gets_unknown_utility() {
        let mut tables = sample_tables();
        tables.intervals = DataFrame::new(vec![
            Series::new("utility_id", vec![None::<&str>]),
            Series::new("service_point_id", vec!["SP-100"]),
            Series::new("meter_id", vec!["MTR-1"]),
            Series::new("value", vec![4.0]),
        ])
        .unwrap();

        let usage = build_usage_records(&tables, AccessLevel::Internal).unwrap();
        assert_eq!(
            usage.column("utility_id").unwrap().utf8().unwrap().get(0),
            Some(UNKNOWN_UTILITY)
        );
        // The service point key is left alone
        assert_eq!(
            usage.column("service_point_id").unwrap().utf8().unwrap().get(0),
            Some("SP-100")
        );
    }

    #[test]
    fn test_reading_columns_lead_the_frame() {
        let usage = build_usage_records(&sample_tables(), AccessLevel::Internal).unwrap();
        let names = usage.get_column_names();
        assert_eq!(names[0], "utility_id");
        assert_eq!(names[1], "service_point_id");
        assert_eq!(names[2], "meter_id");
        assert_eq!(names[3], "interval_start_ts");

        let city_at = names.iter().position(|n| *n == "city").unwrap();
        let serial_at = names.iter().position(|n| *n == "serial_number").unwrap();
        assert!(city_at < serial_at);
    }

    #[test]
    fn test_external_usage_is_masked() {
        let usage = build_usage_records(&sample_tables(), AccessLevel::External).unwrap();
        let street = usage.column("street").unwrap();
        assert_eq!(street.utf8().unwrap().get(0), Some("***MASKED***"));
        assert_eq!(
            usage.column("zip").unwrap().utf8().unwrap().get(0),
            Some("122**")
        );
        // Values are untouched
        assert_eq!(usage.column("value").unwrap().f64().unwrap().get(1), Some(30.0));
    }
}
