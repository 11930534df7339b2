use anyhow::{Context, Result};
use polars::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::adapters::SourceAdapter;

/// The three raw tables of one source export, exactly as landed.
#[derive(Debug)]
pub struct RawSourceTables {
    pub service_points: DataFrame,
    pub meters: DataFrame,
    pub intervals: DataFrame,
}

/// Path of one raw table: `<data_dir>/<source_id>/<source_id>_<table>.csv`.
pub fn raw_table_path(data_dir: &Path, source_id: &str, table: &str) -> PathBuf {
    data_dir
        .join(source_id)
        .join(format!("{}_{}.csv", source_id, table))
}

/// Read one raw CSV without coercing types. Schema inference runs over the
/// whole file so a column that turns textual halfway through still lands
/// as text instead of a parse failure.
pub fn read_raw_csv(path: &Path) -> Result<DataFrame> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("missing raw table: {}", path.display()))?;

    CsvReader::new(file)
        .has_header(true)
        .infer_schema(None)
        .finish()
        .with_context(|| format!("failed to read raw table: {}", path.display()))
}

/// Load the full raw export of one source.
pub fn load_source_raw(data_dir: &Path, source_id: &str) -> Result<RawSourceTables> {
    Ok(RawSourceTables {
        service_points: read_raw_csv(&raw_table_path(data_dir, source_id, "service_points"))?,
        meters: read_raw_csv(&raw_table_path(data_dir, source_id, "meters"))?,
        intervals: read_raw_csv(&raw_table_path(data_dir, source_id, "intervals"))?,
    })
}

/// Load the raw exports of every registered source, keyed by source id.
/// Any missing table aborts the run; a partial landing zone is not
/// something the later stages can repair.
pub fn load_all_raw(
    data_dir: &Path,
    adapters: &[Box<dyn SourceAdapter>],
) -> Result<HashMap<String, RawSourceTables>> {
    let mut raw = HashMap::new();
    for adapter in adapters {
        let source_id = adapter.source_id();
        let tables = load_source_raw(data_dir, source_id)?;
        raw.insert(source_id.to_string(), tables);
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_raw(dir: &Path, source_id: &str, table: &str, contents: &str) {
        let source_dir = dir.join(source_id);
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(
            source_dir.join(format!("{}_{}.csv", source_id, table)),
            contents,
        )
        .unwrap();
    }

    #[test]
    fn test_read_raw_csv_keeps_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        write_raw(
            dir.path(),
            "utility1",
            "meters",
            "meter_id,meter_type\nMTR-1,smart\nMTR-2,analog\n",
        );

        let df =
            read_raw_csv(&raw_table_path(dir.path(), "utility1", "meters")).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 2);
    }

    #[test]
    fn test_read_raw_csv_widens_mixed_column_to_text() {
        let dir = tempfile::tempdir().unwrap();
        // Numeric for the first rows, textual later on. Full-file inference
        // must settle on text rather than fail at the switch.
        write_raw(
            dir.path(),
            "utility2",
            "meters",
            "meter_id,meter_number\n1001,77\n1002,A-77\n",
        );

        let df =
            read_raw_csv(&raw_table_path(dir.path(), "utility2", "meters")).unwrap();
        assert_eq!(df.column("meter_number").unwrap().dtype(), &DataType::Utf8);
    }

    #[test]
    fn test_missing_table_error_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_source_raw(dir.path(), "utility1").unwrap_err();
        assert!(format!("{:#}", err).contains("utility1_service_points.csv"));
    }

    #[test]
    fn test_load_source_raw_reads_all_three_tables() {
        let dir = tempfile::tempdir().unwrap();
        write_raw(
            dir.path(),
            "utility1",
            "service_points",
            "service_point_id\nSP-1\n",
        );
        write_raw(dir.path(), "utility1", "meters", "meter_id\nMTR-1\n");
        write_raw(
            dir.path(),
            "utility1",
            "intervals",
            "meter_id,value\nMTR-1,1.5\n",
        );

        let tables = load_source_raw(dir.path(), "utility1").unwrap();
        assert_eq!(tables.service_points.height(), 1);
        assert_eq!(tables.meters.height(), 1);
        assert_eq!(tables.intervals.height(), 1);
    }
}
