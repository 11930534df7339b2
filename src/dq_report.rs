use anyhow::Result;
use chrono::{DateTime, Utc};
use glob::glob;
use polars::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::standardizer::StandardizedTables;

/// Print the run's data quality snapshot: per-utility counts,
/// referential checks, and the reading time range.
pub fn print_dq_snapshot(
    tables: &StandardizedTables,
    usage: &DataFrame,
    summary: &DataFrame,
) -> Result<()> {
    println!("\n{}", "=".repeat(60));
    println!("DATA QUALITY SUMMARY");
    println!("{}", "=".repeat(60));

    println!("\n📊 Standardized table counts:");
    let tables_by_name = [
        ("service_points", &tables.service_points),
        ("meters", &tables.meters),
        ("intervals", &tables.intervals),
    ];
    for (label, df) in tables_by_name {
        println!("  {}: {} rows", label, df.height());
        for (tag, count) in count_by_utility(df)? {
            println!("    {}: {}", tag, count);
        }
    }

    let known: HashSet<(String, String)> = {
        let tags = text_column(&tables.service_points, "utility_id")?;
        let ids = text_column(&tables.service_points, "service_point_id")?;
        tags.into_iter()
            .zip(ids)
            .map(|(tag, id)| (tag.unwrap_or_default(), id.unwrap_or_default()))
            .collect()
    };

    let interval_tags = text_column(&tables.intervals, "utility_id")?;
    let interval_sps = text_column(&tables.intervals, "service_point_id")?;

    let mut orphan_ids: HashSet<String> = HashSet::new();
    let mut orphan_rows = 0usize;
    let mut unlinked_rows = 0usize;
    for (tag, sp) in interval_tags.iter().zip(interval_sps.iter()) {
        match sp {
            Some(sp) => {
                let key = (tag.clone().unwrap_or_default(), sp.clone());
                if !known.contains(&key) {
                    orphan_ids.insert(sp.clone());
                    orphan_rows += 1;
                }
            }
            None => unlinked_rows += 1,
        }
    }

    println!("\n🔗 Referential checks:");
    if orphan_ids.is_empty() {
        println!("  ✅ Every linked reading has a known service point");
    } else {
        println!(
            "  ❌ {} orphan service point ids across {} readings",
            orphan_ids.len(),
            orphan_rows
        );
        let mut sample: Vec<&String> = orphan_ids.iter().collect();
        sample.sort();
        for id in sample.iter().take(5) {
            println!("     - {}", id);
        }
    }
    println!("  Readings without a service point: {}", unlinked_rows);
    println!(
        "  Readings without a parsed timestamp: {}",
        tables.intervals.column("interval_start_ts")?.null_count()
    );

    let start_cast = tables
        .intervals
        .column("interval_start_ts")?
        .cast(&DataType::Int64)?;
    let starts = start_cast.i64()?;
    if let (Some(min), Some(max)) = (starts.min(), starts.max()) {
        println!(
            "\n🕐 Reading time range: {} to {}",
            format_ts(min),
            format_ts(max)
        );
    }

    println!(
        "\n📦 Usage records: {} rows x {} columns",
        usage.height(),
        usage.width()
    );
    println!("📈 Summary buckets: {} rows", summary.height());
    if summary.height() > 0 {
        let bucket_cast = summary.column("bucket_start")?.cast(&DataType::Int64)?;
        let buckets = bucket_cast.i64()?;
        if let (Some(min), Some(max)) = (buckets.min(), buckets.max()) {
            println!("  Bucket range: {} to {}", format_ts(min), format_ts(max));
        }
        let counts = summary.column("interval_count")?.i64()?;
        if let (Some(min), Some(max), Some(mean)) = (counts.min(), counts.max(), counts.mean()) {
            println!(
                "  Readings per bucket: min {} / mean {:.1} / max {}",
                min, mean, max
            );
        }
    }

    println!("\n{}", "=".repeat(60));
    Ok(())
}

fn count_by_utility(df: &DataFrame) -> Result<Vec<(String, usize)>> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let cast = df.column("utility_id")?.cast(&DataType::Utf8)?;
    for value in cast.utf8()? {
        let key = value.unwrap_or("(null)").to_string();
        *counts.entry(key).or_insert(0) += 1;
    }
    let mut entries: Vec<(String, usize)> = counts.into_iter().collect();
    entries.sort();
    Ok(entries)
}

fn text_column(df: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    let cast = df.column(name)?.cast(&DataType::Utf8)?;
    Ok(cast
        .utf8()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

fn format_ts(ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.naive_utc().format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

struct TableChecks {
    dedup_keys: Vec<&'static str>,
    required_keys: Vec<&'static str>,
}

/// Key columns checked per output table. Standardized intervals and
/// usage records keep legitimately null service points, so only the
/// tag is required there.
fn checks_for(stem: &str) -> Option<TableChecks> {
    match stem {
        "standardized_service_points" => Some(TableChecks {
            dedup_keys: vec!["utility_id", "service_point_id"],
            required_keys: vec!["utility_id", "service_point_id"],
        }),
        "standardized_meters" => Some(TableChecks {
            dedup_keys: vec!["utility_id", "meter_id"],
            required_keys: vec!["utility_id", "meter_id"],
        }),
        "standardized_intervals" => Some(TableChecks {
            dedup_keys: vec![
                "utility_id",
                "service_point_id",
                "meter_id",
                "interval_start_ts",
                "channel",
            ],
            required_keys: vec!["utility_id"],
        }),
        "usage_records" => Some(TableChecks {
            dedup_keys: vec![
                "utility_id",
                "service_point_id",
                "meter_id",
                "interval_start_ts",
                "channel",
            ],
            required_keys: vec!["utility_id"],
        }),
        "usage_summary" => Some(TableChecks {
            dedup_keys: vec!["utility_id", "service_point_id", "bucket_start"],
            required_keys: vec!["utility_id", "service_point_id", "bucket_start"],
        }),
        _ => None,
    }
}

/// Re-read every parquet output and check key uniqueness and required
/// key population. Returns the number of issues found.
pub fn verify_outputs(output_dir: &Path) -> Result<usize> {
    println!("\n🔍 Output Verification");
    println!("{}", "=".repeat(60));

    let pattern = format!("{}/*.parquet", output_dir.display());
    let files: Vec<PathBuf> = glob(&pattern)?.filter_map(Result::ok).collect();

    if files.is_empty() {
        println!(
            "⚠️  No parquet outputs found under {}",
            output_dir.display()
        );
        return Ok(0);
    }

    let mut total_issues = 0;

    for file in files {
        println!(
            "\n  Verifying: {}",
            file.file_name().unwrap().to_str().unwrap()
        );

        let stem = match file.file_stem().and_then(|stem| stem.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };
        let checks = match checks_for(&stem) {
            Some(checks) => checks,
            None => {
                println!("    ⚠️  No key columns registered, skipping");
                continue;
            }
        };

        let df = LazyFrame::scan_parquet(&file, Default::default())?.collect()?;

        let key_exprs: Vec<Expr> = checks.dedup_keys.iter().map(|key| col(key)).collect();
        let duplicate_check = df
            .clone()
            .lazy()
            .group_by(key_exprs)
            .agg([col(checks.dedup_keys[0]).count().alias("count")])
            .filter(col("count").gt(1))
            .collect()?;

        if duplicate_check.height() > 0 {
            println!("    ❌ Found {} duplicate keys", duplicate_check.height());
            total_issues += duplicate_check.height();
        } else {
            println!("    ✅ No duplicate keys");
        }

        let mut null_keys = 0usize;
        for key in &checks.required_keys {
            null_keys += df.column(key)?.null_count();
        }
        if null_keys > 0 {
            println!("    ❌ {} null values across required keys", null_keys);
            total_issues += 1;
        } else {
            println!("    ✅ Required keys fully populated");
        }

        println!("    📊 Total records: {}", df.height());
    }

    println!("\n{}", "=".repeat(60));
    if total_issues == 0 {
        println!("✅ Output verification passed! No issues found.");
    } else {
        println!("⚠️  Output verification found {} issues", total_issues);
    }

    Ok(total_issues)
}
