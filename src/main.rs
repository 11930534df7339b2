use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use polars::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use gridflow_processor::landing::load_source_raw;
use gridflow_processor::{
    adapter_registry, build_standardized, build_usage_records, build_usage_summary,
    load_all_raw, print_dq_snapshot, summary_rows, verify_outputs, AccessLevel,
    BucketWindow, StandardizedTables, UsageSummaryRow,
};

#[derive(Parser)]
#[command(name = "gridflow_processor")]
#[command(about = "Harmonize multi-utility meter exports into usage records and summaries")]
struct Args {
    /// Directory holding the raw source exports
    #[arg(long, default_value = "data/raw")]
    data_dir: PathBuf,

    /// Directory for pipeline outputs
    #[arg(long, default_value = "gridflow_output")]
    output_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build and save the standardized entity tables
    Standardize,
    /// Build flat usage records on top of the standardized tables
    Usage {
        /// Access level for PII masking (internal or external)
        #[arg(long, default_value = "external")]
        access_level: String,
    },
    /// Aggregate usage records into per-service-point time buckets
    Summary {
        /// Access level for PII masking (internal or external)
        #[arg(long, default_value = "external")]
        access_level: String,

        /// Bucket window (hourly, daily, weekly, monthly)
        #[arg(long, default_value = "daily")]
        window: String,

        /// Report format
        #[arg(short, long, value_enum, default_value = "table")]
        output: OutputFormat,
    },
    /// Run the pipeline unmasked and print the data quality snapshot
    DqSnapshot,
    /// Check saved outputs for duplicate and null keys
    Verify,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

fn main() -> Result<()> {
    env_logger::init();

    // Set Rayon to use all available cores
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_cpus::get())
        .build_global()
        .unwrap();

    let args = Args::parse();
    fs::create_dir_all(&args.output_dir)?;

    match &args.command {
        Command::Standardize => {
            run_standardize(&args.data_dir, &args.output_dir)?;
        }
        Command::Usage { access_level } => {
            run_usage(&args.data_dir, &args.output_dir, access_level)?;
        }
        Command::Summary {
            access_level,
            window,
            output,
        } => {
            run_summary(&args.data_dir, &args.output_dir, access_level, window, output)?;
        }
        Command::DqSnapshot => {
            run_dq_snapshot(&args.data_dir)?;
        }
        Command::Verify => {
            verify_outputs(&args.output_dir)?;
        }
    }

    Ok(())
}

fn run_standardize(data_dir: &Path, output_dir: &Path) -> Result<StandardizedTables> {
    println!("\n{}", "=".repeat(60));
    println!("BUILDING STANDARDIZED TABLES");
    println!("{}", "=".repeat(60));
    println!("Using {} CPU cores", num_cpus::get());

    let adapters = adapter_registry()?;

    println!("\n[1/2] Loading raw source exports...");
    let pb = ProgressBar::new(adapters.len() as u64);
    pb.set_style(ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .unwrap());

    let mut raw = HashMap::new();
    for adapter in &adapters {
        let tables = load_source_raw(data_dir, adapter.source_id())?;
        info!("loaded raw tables for {}", adapter.source_id());
        println!(
            "  📁 {}: {} service points, {} meters, {} readings",
            adapter.source_id(),
            tables.service_points.height(),
            tables.meters.height(),
            tables.intervals.height()
        );
        raw.insert(adapter.source_id().to_string(), tables);
        pb.inc(1);
    }
    pb.finish_with_message("Raw exports loaded");

    println!("\n[2/2] Standardizing across sources...");
    let tables = build_standardized(&raw, &adapters)?;

    println!("\n📊 Standardized output:");
    println!("  service_points: {} rows", tables.service_points.height());
    println!("  meters: {} rows", tables.meters.height());
    println!("  intervals: {} rows", tables.intervals.height());

    save_table(&tables.service_points, output_dir, "standardized_service_points")?;
    save_table(&tables.meters, output_dir, "standardized_meters")?;
    save_table(&tables.intervals, output_dir, "standardized_intervals")?;

    Ok(tables)
}

fn run_usage(data_dir: &Path, output_dir: &Path, access_level: &str) -> Result<DataFrame> {
    let tables = run_standardize(data_dir, output_dir)?;
    let level = AccessLevel::parse(access_level);
    info!("building usage records at {} access", level.as_str());

    println!("\n{}", "=".repeat(60));
    println!("BUILDING USAGE RECORDS ({})", level.as_str().to_uppercase());
    println!("{}", "=".repeat(60));

    let usage = build_usage_records(&tables, level)?;
    println!("  📦 {} usage records x {} columns", usage.height(), usage.width());

    save_table(&usage, output_dir, "usage_records")?;
    Ok(usage)
}

fn run_summary(
    data_dir: &Path,
    output_dir: &Path,
    access_level: &str,
    window_raw: &str,
    format: &OutputFormat,
) -> Result<()> {
    // Reject a bad window before any pipeline work happens
    let window = BucketWindow::parse(window_raw)?;
    let usage = run_usage(data_dir, output_dir, access_level)?;

    println!("\n{}", "=".repeat(60));
    println!("BUILDING USAGE SUMMARY ({})", window.as_str().to_uppercase());
    println!("{}", "=".repeat(60));

    let summary = build_usage_summary(&usage, window)?;
    println!("  📈 {} summary buckets", summary.height());
    save_table(&summary, output_dir, "usage_summary")?;

    let rows = summary_rows(&summary)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Csv => print_summary_csv(&rows),
        OutputFormat::Table => print_summary_table(&rows),
    }
    Ok(())
}

fn run_dq_snapshot(data_dir: &Path) -> Result<()> {
    let adapters = adapter_registry()?;
    let raw = load_all_raw(data_dir, &adapters)?;
    let tables = build_standardized(&raw, &adapters)?;
    let usage = build_usage_records(&tables, AccessLevel::Internal)?;
    let summary = build_usage_summary(&usage, BucketWindow::default())?;
    print_dq_snapshot(&tables, &usage, &summary)
}

fn save_table(df: &DataFrame, output_dir: &Path, base_name: &str) -> Result<()> {
    println!("    💾 Saving {}...", base_name);

    // Save in parallel
    rayon::scope(|s| {
        // CSV
        let csv_path = output_dir.join(format!("{}.csv", base_name));
        let df_csv = df.clone();
        s.spawn(move |_| {
            if let Ok(file) = fs::File::create(&csv_path) {
                let mut df_mut = df_csv.clone();
                if CsvWriter::new(file).finish(&mut df_mut).is_ok() {
                    println!("      ✓ Saved CSV: {}", csv_path.display());
                }
            }
        });

        // Parquet
        let parquet_path = output_dir.join(format!("{}.parquet", base_name));
        let df_parquet = df.clone();
        s.spawn(move |_| {
            if let Ok(file) = fs::File::create(&parquet_path) {
                let mut df_mut = df_parquet.clone();
                if ParquetWriter::new(file).finish(&mut df_mut).is_ok() {
                    println!("      ✓ Saved Parquet: {}", parquet_path.display());
                }
            }
        });

        // Arrow
        let arrow_path = output_dir.join(format!("{}.arrow", base_name));
        let df_arrow = df.clone();
        s.spawn(move |_| {
            if let Ok(file) = fs::File::create(&arrow_path) {
                let mut df_mut = df_arrow.clone();
                if IpcWriter::new(file).finish(&mut df_mut).is_ok() {
                    println!("      ✓ Saved Arrow: {}", arrow_path.display());
                }
            }
        });
    });

    Ok(())
}

fn fmt_opt_value(value: Option<f64>) -> String {
    value.map(|v| format!("{:.3}", v)).unwrap_or_default()
}

fn print_summary_csv(rows: &[UsageSummaryRow]) {
    println!(
        "utility_id,service_point_id,bucket_start,bucket_end,total_usage,\
         interval_count,peak_usage_value,peak_usage_ts,pit_usage_value,pit_usage_ts"
    );
    for row in rows {
        println!(
            "{},{},{},{},{:.3},{},{},{},{},{}",
            row.utility_id,
            row.service_point_id,
            row.bucket_start,
            row.bucket_end,
            row.total_usage,
            row.interval_count,
            fmt_opt_value(row.peak_usage_value),
            row.peak_usage_ts.clone().unwrap_or_default(),
            fmt_opt_value(row.pit_usage_value),
            row.pit_usage_ts.clone().unwrap_or_default(),
        );
    }
}

fn print_summary_table(rows: &[UsageSummaryRow]) {
    println!(
        "\n{:<10} {:<22} {:<24} {:>12} {:>8} {:>12} {:>12}",
        "utility", "service_point", "bucket_start", "total", "count", "peak", "pit"
    );
    println!("{}", "-".repeat(106));
    for row in rows {
        println!(
            "{:<10} {:<22} {:<24} {:>12.3} {:>8} {:>12} {:>12}",
            row.utility_id,
            row.service_point_id,
            row.bucket_start,
            row.total_usage,
            row.interval_count,
            fmt_opt_value(row.peak_usage_value),
            fmt_opt_value(row.pit_usage_value),
        );
    }
    println!("{}", "-".repeat(106));
    println!("{} buckets", rows.len());
}
