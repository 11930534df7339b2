use anyhow::Result;
use polars::prelude::*;
use regex::Regex;

/// Where a canonical column gets its data from in a raw source table.
#[derive(Debug, Clone)]
pub enum FieldSource {
    /// Copy from this raw column; abort the run if it is absent.
    Required(&'static str),
    /// Copy from this raw column when present, otherwise fill with nulls.
    Optional(&'static str),
    /// Stamp every row with this constant.
    Constant(&'static str),
    /// The source has no counterpart; fill with nulls.
    Null,
}

/// Declarative column mapping for one raw table of one source system.
/// Fields are listed in canonical output order.
#[derive(Debug, Clone)]
pub struct TableMapping {
    pub table: &'static str,
    pub fields: Vec<(&'static str, FieldSource)>,
}

/// One upstream utility export format. New sources register an adapter
/// here instead of adding per-utility branches to the pipeline stages.
pub trait SourceAdapter: Send + Sync {
    /// Directory and file prefix of the raw export.
    fn source_id(&self) -> &'static str;

    /// Utility tag stamped on every standardized row.
    fn utility_tag(&self) -> &'static str;

    fn service_point_mapping(&self) -> TableMapping;
    fn meter_mapping(&self) -> TableMapping;
    fn interval_mapping(&self) -> TableMapping;

    /// Explicit formats tried first for interval timestamps. An empty list
    /// means the flexible ISO-style parser alone.
    fn interval_timestamp_formats(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// True when readings carry no service point of their own and must
    /// inherit it from the source's meter records.
    fn intervals_need_meter_linkage(&self) -> bool {
        false
    }

    /// Whether an identifier looks like it was issued by this source.
    /// Consulted only by the fallback tag inference, never to override
    /// a tag that is already present.
    fn claims_id(&self, id: &str) -> bool;
}

/// All registered source adapters, in combination order. Utility 2 claims
/// any identifier, so it must stay last.
pub fn adapter_registry() -> Result<Vec<Box<dyn SourceAdapter>>> {
    Ok(vec![
        Box::new(Utility1Adapter::new()?),
        Box::new(Utility2Adapter::new()),
    ])
}

/// Utility 1: service-point oriented export. Readings reference their
/// service point directly and timestamps are ISO-style text.
pub struct Utility1Adapter {
    id_pattern: Regex,
}

impl Utility1Adapter {
    pub fn new() -> Result<Self> {
        Ok(Self {
            id_pattern: Regex::new(r"^(SP|MTR)-")?,
        })
    }
}

impl SourceAdapter for Utility1Adapter {
    fn source_id(&self) -> &'static str {
        "utility1"
    }

    fn utility_tag(&self) -> &'static str {
        "UTILITY1"
    }

    fn service_point_mapping(&self) -> TableMapping {
        TableMapping {
            table: "utility1_service_points",
            fields: vec![
                ("utility_id", FieldSource::Constant("UTILITY1")),
                ("service_point_id", FieldSource::Required("service_point_id")),
                (
                    "service_point_number",
                    FieldSource::Required("service_point_number"),
                ),
                ("house_num", FieldSource::Null),
                ("street", FieldSource::Required("service_point_street")),
                ("house_supp", FieldSource::Null),
                ("city", FieldSource::Required("service_point_city")),
                ("zip", FieldSource::Required("service_point_zip")),
                ("state", FieldSource::Required("service_point_state")),
                ("installed_at", FieldSource::Optional("installed_at")),
                ("removed_at", FieldSource::Optional("removed_at")),
                ("created_at", FieldSource::Optional("created")),
                ("updated_at", FieldSource::Optional("updated")),
            ],
        }
    }

    fn meter_mapping(&self) -> TableMapping {
        // The raw meter file is reading-shaped; only identity and
        // classification columns are meaningful here.
        TableMapping {
            table: "utility1_meters",
            fields: vec![
                ("utility_id", FieldSource::Constant("UTILITY1")),
                ("meter_id", FieldSource::Required("meter_id")),
                ("serial_number", FieldSource::Required("meter_id")),
                ("meter_type", FieldSource::Optional("meter_type")),
                ("meter_category", FieldSource::Optional("meter_category")),
                ("service_point_id", FieldSource::Null),
                ("installed_at", FieldSource::Null),
                ("removed_at", FieldSource::Null),
                ("created_at", FieldSource::Null),
                ("updated_at", FieldSource::Null),
            ],
        }
    }

    fn interval_mapping(&self) -> TableMapping {
        TableMapping {
            table: "utility1_intervals",
            fields: vec![
                ("utility_id", FieldSource::Constant("UTILITY1")),
                (
                    "service_point_id",
                    FieldSource::Required("service_delivery_point_id"),
                ),
                ("meter_id", FieldSource::Required("meter_id")),
                ("interval_start_ts", FieldSource::Required("timestamp")),
                ("duration_seconds", FieldSource::Required("duration")),
                ("value", FieldSource::Required("value")),
                ("quality", FieldSource::Required("quality")),
                ("channel", FieldSource::Required("channel")),
                ("last_update_time", FieldSource::Optional("last_update_time")),
                ("exported_at", FieldSource::Optional("exported_at")),
            ],
        }
    }

    fn claims_id(&self, id: &str) -> bool {
        self.id_pattern.is_match(id)
    }
}

/// Utility 2: premise oriented export. Readings carry no service point
/// (it is inherited via the meter's premise) and timestamps arrive in a
/// compact numeric form.
pub struct Utility2Adapter;

impl Utility2Adapter {
    pub fn new() -> Self {
        Self
    }
}

impl SourceAdapter for Utility2Adapter {
    fn source_id(&self) -> &'static str {
        "utility2"
    }

    fn utility_tag(&self) -> &'static str {
        "UTILITY2"
    }

    fn service_point_mapping(&self) -> TableMapping {
        TableMapping {
            table: "utility2_service_points",
            fields: vec![
                ("utility_id", FieldSource::Constant("UTILITY2")),
                ("service_point_id", FieldSource::Required("premise_id")),
                ("service_point_number", FieldSource::Null),
                ("house_num", FieldSource::Required("premise_house_num")),
                ("street", FieldSource::Required("premise_street")),
                ("house_supp", FieldSource::Optional("premise_house_supp")),
                ("city", FieldSource::Required("premise_city")),
                ("zip", FieldSource::Required("premise_zip")),
                ("state", FieldSource::Required("premise_region")),
                ("installed_at", FieldSource::Null),
                ("removed_at", FieldSource::Null),
                ("created_at", FieldSource::Optional("created_date")),
                ("updated_at", FieldSource::Null),
            ],
        }
    }

    fn meter_mapping(&self) -> TableMapping {
        TableMapping {
            table: "utility2_meters",
            fields: vec![
                ("utility_id", FieldSource::Constant("UTILITY2")),
                ("meter_id", FieldSource::Required("meter_id")),
                ("serial_number", FieldSource::Required("meter_number")),
                ("meter_type", FieldSource::Required("meter_type")),
                ("meter_category", FieldSource::Optional("meter_channel")),
                ("service_point_id", FieldSource::Required("premise_id")),
                ("installed_at", FieldSource::Optional("installed_at")),
                ("removed_at", FieldSource::Optional("removed_at")),
                ("created_at", FieldSource::Optional("created")),
                ("updated_at", FieldSource::Optional("updated")),
            ],
        }
    }

    fn interval_mapping(&self) -> TableMapping {
        TableMapping {
            table: "utility2_intervals",
            fields: vec![
                ("utility_id", FieldSource::Constant("UTILITY2")),
                ("service_point_id", FieldSource::Null),
                ("meter_id", FieldSource::Required("meter_id")),
                ("interval_start_ts", FieldSource::Required("timestamp")),
                ("duration_seconds", FieldSource::Required("duration")),
                ("value", FieldSource::Required("value")),
                ("quality", FieldSource::Required("quality")),
                ("channel", FieldSource::Required("channel")),
                ("last_update_time", FieldSource::Null),
                ("exported_at", FieldSource::Null),
            ],
        }
    }

    fn interval_timestamp_formats(&self) -> Vec<&'static str> {
        vec!["%Y%m%d%H%M%S", "%Y%m%d"]
    }

    fn intervals_need_meter_linkage(&self) -> bool {
        true
    }

    fn claims_id(&self, _id: &str) -> bool {
        true
    }
}

/// Lowercase and trim raw column names so header casing and stray
/// whitespace never break the mappings.
pub fn normalize_columns(raw: &DataFrame) -> Result<DataFrame> {
    let mut out = raw.clone();
    let names: Vec<String> = out
        .get_column_names()
        .iter()
        .map(|name| name.trim().to_lowercase())
        .collect();
    out.set_column_names(&names)?;
    Ok(out)
}

/// Apply a table mapping to one raw table, producing a canonical frame.
/// Identifier and text columns are cast to Utf8; numeric reading columns
/// to Float64 with unparsable values becoming null.
pub fn apply_mapping(raw: &DataFrame, mapping: &TableMapping) -> Result<DataFrame> {
    let df = normalize_columns(raw)?;
    let height = df.height();
    let mut columns = Vec::with_capacity(mapping.fields.len());

    for (canonical, source) in &mapping.fields {
        let series = match source {
            FieldSource::Required(raw_name) => {
                if !has_column(&df, raw_name) {
                    return Err(anyhow::anyhow!(
                        "{}: required column '{}' is missing",
                        mapping.table,
                        raw_name
                    ));
                }
                coerce_field(df.column(raw_name)?, canonical)?
            }
            FieldSource::Optional(raw_name) => {
                if has_column(&df, raw_name) {
                    coerce_field(df.column(raw_name)?, canonical)?
                } else {
                    null_field(canonical, height)
                }
            }
            FieldSource::Constant(value) => Series::new(canonical, vec![Some(*value); height]),
            FieldSource::Null => null_field(canonical, height),
        };
        columns.push(series);
    }

    Ok(DataFrame::new(columns)?)
}

fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_names().contains(&name)
}

fn is_numeric_field(canonical: &str) -> bool {
    matches!(canonical, "duration_seconds" | "value")
}

fn coerce_field(source: &Series, canonical: &str) -> Result<Series> {
    let target = if is_numeric_field(canonical) {
        DataType::Float64
    } else {
        DataType::Utf8
    };
    let mut out = source.cast(&target)?;
    out.rename(canonical);
    Ok(out)
}

fn null_field(canonical: &str, height: usize) -> Series {
    if is_numeric_field(canonical) {
        Series::new(canonical, vec![None::<f64>; height])
    } else {
        Series::new(canonical, vec![None::<&str>; height])
    }
}
