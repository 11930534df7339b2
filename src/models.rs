use anyhow::Result;
use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Marker used when a record's owning utility cannot be determined.
pub const UNKNOWN_UTILITY: &str = "UNKNOWN_UTILITY";
/// Marker used when a usage record carries no service point linkage.
pub const UNKNOWN_SERVICE_POINT: &str = "UNKNOWN_SERVICE_POINT";
/// Sentinel written over redacted PII values.
pub const MASKED_VALUE: &str = "***MASKED***";

/// Canonical service point columns, in output order.
pub fn service_point_schema() -> Vec<(&'static str, DataType)> {
    vec![
        ("utility_id", DataType::Utf8),
        ("service_point_id", DataType::Utf8),
        ("service_point_number", DataType::Utf8),
        ("house_num", DataType::Utf8),
        ("street", DataType::Utf8),
        ("house_supp", DataType::Utf8),
        ("city", DataType::Utf8),
        ("zip", DataType::Utf8),
        ("state", DataType::Utf8),
        ("installed_at", DataType::Utf8),
        ("removed_at", DataType::Utf8),
        ("created_at", DataType::Utf8),
        ("updated_at", DataType::Utf8),
    ]
}

/// Canonical meter columns, in output order.
pub fn meter_schema() -> Vec<(&'static str, DataType)> {
    vec![
        ("utility_id", DataType::Utf8),
        ("meter_id", DataType::Utf8),
        ("serial_number", DataType::Utf8),
        ("meter_type", DataType::Utf8),
        ("meter_category", DataType::Utf8),
        ("service_point_id", DataType::Utf8),
        ("installed_at", DataType::Utf8),
        ("removed_at", DataType::Utf8),
        ("created_at", DataType::Utf8),
        ("updated_at", DataType::Utf8),
    ]
}

/// Canonical interval reading columns, in output order.
/// `interval_end_ts` is derived from start + duration during standardization.
pub fn interval_schema() -> Vec<(&'static str, DataType)> {
    vec![
        ("utility_id", DataType::Utf8),
        ("service_point_id", DataType::Utf8),
        ("meter_id", DataType::Utf8),
        (
            "interval_start_ts",
            DataType::Datetime(TimeUnit::Milliseconds, None),
        ),
        (
            "interval_end_ts",
            DataType::Datetime(TimeUnit::Milliseconds, None),
        ),
        ("duration_seconds", DataType::Float64),
        ("value", DataType::Float64),
        ("quality", DataType::Utf8),
        ("channel", DataType::Utf8),
        ("last_update_time", DataType::Utf8),
        ("exported_at", DataType::Utf8),
    ]
}

/// Usage summary columns, in output order.
pub fn summary_schema() -> Vec<(&'static str, DataType)> {
    vec![
        ("utility_id", DataType::Utf8),
        ("service_point_id", DataType::Utf8),
        (
            "bucket_start",
            DataType::Datetime(TimeUnit::Milliseconds, None),
        ),
        (
            "bucket_end",
            DataType::Datetime(TimeUnit::Milliseconds, None),
        ),
        ("total_usage", DataType::Float64),
        ("interval_count", DataType::Int64),
        ("peak_usage_value", DataType::Float64),
        (
            "peak_usage_ts",
            DataType::Datetime(TimeUnit::Milliseconds, None),
        ),
        ("pit_usage_value", DataType::Float64),
        (
            "pit_usage_ts",
            DataType::Datetime(TimeUnit::Milliseconds, None),
        ),
    ]
}

/// Leading columns of the joined usage record table.
pub fn usage_base_columns() -> Vec<&'static str> {
    vec![
        "utility_id",
        "service_point_id",
        "meter_id",
        "interval_start_ts",
        "interval_end_ts",
        "duration_seconds",
        "value",
        "channel",
        "quality",
    ]
}

/// Location columns placed right after the base columns.
pub fn usage_location_columns() -> Vec<&'static str> {
    vec!["city", "zip", "state"]
}

/// Consumer access level for PII columns. Only the exact string
/// "internal" unmasks; case and whitespace variants stay external, so
/// masking is the default whenever callers pass anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    Internal,
    External,
}

impl AccessLevel {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "internal" => AccessLevel::Internal,
            _ => AccessLevel::External,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Internal => "internal",
            AccessLevel::External => "external",
        }
    }
}

/// Calendar-aligned aggregation window. An unrecognized window string is a
/// configuration error, unlike access levels where the masked default is safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketWindow {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl BucketWindow {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "hourly" | "hour" | "h" => Ok(BucketWindow::Hourly),
            "daily" | "day" | "d" => Ok(BucketWindow::Daily),
            "weekly" | "week" | "w" => Ok(BucketWindow::Weekly),
            "monthly" | "month" | "m" => Ok(BucketWindow::Monthly),
            other => Err(anyhow::anyhow!(
                "unsupported aggregation window '{}' (expected hourly, daily, weekly or monthly)",
                other
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BucketWindow::Hourly => "hourly",
            BucketWindow::Daily => "daily",
            BucketWindow::Weekly => "weekly",
            BucketWindow::Monthly => "monthly",
        }
    }
}

impl Default for BucketWindow {
    fn default() -> Self {
        BucketWindow::Daily
    }
}

/// Row projection of the usage summary table, used for JSON/CSV output.
/// Timestamps are rendered as text so the serialized form is stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummaryRow {
    pub utility_id: String,
    pub service_point_id: String,
    pub bucket_start: String,
    pub bucket_end: String,
    pub total_usage: f64,
    pub interval_count: i64,
    pub peak_usage_value: Option<f64>,
    pub peak_usage_ts: Option<String>,
    pub pit_usage_value: Option<f64>,
    pub pit_usage_ts: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_requires_exact_internal() {
        assert_eq!(AccessLevel::parse("internal"), AccessLevel::Internal);
        assert_eq!(AccessLevel::parse("INTERNAL"), AccessLevel::External);
        assert_eq!(AccessLevel::parse("Internal"), AccessLevel::External);
        assert_eq!(AccessLevel::parse(" internal "), AccessLevel::External);
        assert_eq!(AccessLevel::parse("external"), AccessLevel::External);
        assert_eq!(AccessLevel::parse("admin"), AccessLevel::External);
        assert_eq!(AccessLevel::parse(""), AccessLevel::External);
    }

    #[test]
    fn test_window_parse() {
        assert_eq!(BucketWindow::parse("daily").unwrap(), BucketWindow::Daily);
        assert_eq!(BucketWindow::parse("D").unwrap(), BucketWindow::Daily);
        assert_eq!(BucketWindow::parse("Monthly").unwrap(), BucketWindow::Monthly);
        assert!(BucketWindow::parse("fortnight").is_err());
    }

    #[test]
    fn test_summary_schema_has_ten_columns() {
        let schema = summary_schema();
        assert_eq!(schema.len(), 10);
        assert_eq!(schema[0].0, "utility_id");
        assert_eq!(schema[9].0, "pit_usage_ts");
    }
}
