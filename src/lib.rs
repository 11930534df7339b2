pub mod adapters;
pub mod dq_report;
pub mod landing;
pub mod models;
pub mod pii_masking;
pub mod standardizer;
pub mod summary_builder;
pub mod usage_builder;

pub use adapters::{adapter_registry, SourceAdapter};
pub use dq_report::{print_dq_snapshot, verify_outputs};
pub use landing::{load_all_raw, RawSourceTables};
pub use models::{AccessLevel, BucketWindow, UsageSummaryRow};
pub use pii_masking::mask_pii;
pub use standardizer::{build_standardized, StandardizedTables};
pub use summary_builder::{build_usage_summary, summary_rows};
pub use usage_builder::build_usage_records;
