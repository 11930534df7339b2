use anyhow::Result;
use polars::prelude::*;

use crate::models::{AccessLevel, MASKED_VALUE};

/// How a PII column is rewritten for external consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskStrategy {
    /// Replace every non-null value with the masked marker.
    Redact,
    /// Keep the first three characters of the zip, blank the rest.
    ZipPrefix,
}

/// The masking policy. Adding a column here is the whole change needed
/// to protect a new attribute.
pub fn masking_rules() -> Vec<(&'static str, MaskStrategy)> {
    vec![
        ("street", MaskStrategy::Redact),
        ("house_num", MaskStrategy::Redact),
        ("house_supp", MaskStrategy::Redact),
        ("zip", MaskStrategy::ZipPrefix),
    ]
}

/// Columns audited as personally identifying.
pub fn pii_columns() -> Vec<&'static str> {
    masking_rules().iter().map(|(name, _)| *name).collect()
}

/// Apply the masking policy for the given access level. Internal access
/// passes records through untouched; external access rewrites every PII
/// column that is present. Masking twice changes nothing.
pub fn mask_pii(records: &DataFrame, level: AccessLevel) -> Result<DataFrame> {
    if level == AccessLevel::Internal {
        return Ok(records.clone());
    }

    let mut out = records.clone();
    for (name, strategy) in masking_rules() {
        if !out.get_column_names().contains(&name) {
            continue;
        }
        let cast = out.column(name)?.cast(&DataType::Utf8)?;
        let masked: Vec<Option<String>> = cast
            .utf8()?
            .into_iter()
            .map(|value| value.map(|text| apply_strategy(text, strategy)))
            .collect();
        out.with_column(Series::new(name, masked))?;
    }
    Ok(out)
}

fn apply_strategy(value: &str, strategy: MaskStrategy) -> String {
    match strategy {
        MaskStrategy::Redact => MASKED_VALUE.to_string(),
        MaskStrategy::ZipPrefix => {
            // Already-masked zips pass through so re-masking is a no-op
            if value.ends_with("**") {
                value.to_string()
            } else {
                let prefix: String = value.chars().take(3).collect();
                format!("{}**", prefix)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_records() -> DataFrame {
        DataFrame::new(vec![
            Series::new("service_point_id", vec!["SP-1", "SP-2", "SP-3"]),
            Series::new("street", vec![Some("1 Main St"), Some("2 Oak Ave"), None]),
            Series::new("zip", vec![Some("12207"), Some("10"), None]),
            Series::new("value", vec![10.0, 30.0, 5.0]),
        ])
        .unwrap()
    }

    #[test]
    fn test_external_masking_redacts_streets_and_keeps_nulls() {
        let masked = mask_pii(&sample_records(), AccessLevel::External).unwrap();
        let street = masked.column("street").unwrap();
        assert_eq!(street.utf8().unwrap().get(0), Some(MASKED_VALUE));
        assert_eq!(street.utf8().unwrap().get(1), Some(MASKED_VALUE));
        assert_eq!(street.utf8().unwrap().get(2), None);
    }

    #[test]
    fn test_external_masking_keeps_zip_prefix() {
        let masked = mask_pii(&sample_records(), AccessLevel::External).unwrap();
        let zip = masked.column("zip").unwrap();
        assert_eq!(zip.utf8().unwrap().get(0), Some("122**"));
        assert_eq!(zip.utf8().unwrap().get(1), Some("10**"));
    }

    #[test]
    fn test_masking_is_idempotent() {
        let once = mask_pii(&sample_records(), AccessLevel::External).unwrap();
        let twice = mask_pii(&once, AccessLevel::External).unwrap();
        assert!(once.frame_equal_missing(&twice));
    }

    #[test]
    fn test_internal_access_passes_through() {
        let records = sample_records();
        let out = mask_pii(&records, AccessLevel::Internal).unwrap();
        assert!(out.frame_equal_missing(&records));
    }

    #[test]
    fn test_near_internal_level_strings_still_mask() {
        for level in ["Internal ", "INTERNAL", "internal\n"] {
            let masked = mask_pii(&sample_records(), AccessLevel::parse(level)).unwrap();
            assert_eq!(
                masked.column("street").unwrap().utf8().unwrap().get(0),
                Some(MASKED_VALUE),
                "level string {:?} must not unmask",
                level
            );
        }
    }

    #[test]
    fn test_absent_pii_columns_are_skipped() {
        let records = DataFrame::new(vec![
            Series::new("service_point_id", vec!["SP-1"]),
            Series::new("value", vec![10.0]),
        ])
        .unwrap();
        let out = mask_pii(&records, AccessLevel::External).unwrap();
        assert!(out.frame_equal_missing(&records));
    }

    #[test]
    fn test_non_pii_columns_survive_masking() {
        let masked = mask_pii(&sample_records(), AccessLevel::External).unwrap();
        assert_eq!(
            masked.column("value").unwrap().f64().unwrap().get(1),
            Some(30.0)
        );
        assert_eq!(
            masked.column("service_point_id").unwrap().utf8().unwrap().get(0),
            Some("SP-1")
        );
    }
}
