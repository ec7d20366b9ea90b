//! Feature-map validation against the resolved concept set.
//!
//! Every row of the mapping CSV gets a line in the report, so the curation
//! spreadsheet can be reconciled in one pass: rows that matched, rows whose
//! concept fell outside the subset, rows whose id never parsed, and rows not
//! flagged for mapping at all.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{info, warn};

use crate::SubsetError;
use crate::models::FeatureMapRecord;

/// Classification of one feature-map row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStatus {
    /// Flagged for mapping and the concept is in the final subset.
    Matched,
    /// Flagged for mapping with a well-formed id that is not in the subset.
    UnmatchedAbsent,
    /// Flagged for mapping but the concept id is blank or not a number.
    UnmatchedMalformed,
    /// Not flagged for mapping.
    Skipped,
}

impl MappingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingStatus::Matched => "matched",
            MappingStatus::UnmatchedAbsent => "unmatched_absent",
            MappingStatus::UnmatchedMalformed => "unmatched_malformed",
            MappingStatus::Skipped => "skipped",
        }
    }

    fn is_unmatched(self) -> bool {
        matches!(
            self,
            MappingStatus::UnmatchedAbsent | MappingStatus::UnmatchedMalformed
        )
    }
}

/// One line of the validation report.
#[derive(Debug, Clone)]
pub struct ValidationRow {
    pub feature_key: String,
    pub concept_id: String,
    pub status: MappingStatus,
    pub note: String,
}

/// The validator's verdict over the whole mapping file.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub rows: Vec<ValidationRow>,
    pub matched: usize,
    pub unmatched: usize,
}

/// Check every mapping row against the final concept set.
pub fn validate_feature_map(
    records: &[FeatureMapRecord],
    concept_ids: &BTreeSet<i64>,
) -> ValidationOutcome {
    let mut rows = Vec::with_capacity(records.len());
    let mut matched = 0usize;
    let mut unmatched = 0usize;

    for record in records {
        let (status, note) = if !record.wants_mapping() {
            (MappingStatus::Skipped, record.note.clone())
        } else {
            match record.parsed_concept_id() {
                Some(id) if concept_ids.contains(&id) => {
                    (MappingStatus::Matched, record.note.clone())
                }
                Some(_) => (
                    MappingStatus::UnmatchedAbsent,
                    "concept absent from subset".to_string(),
                ),
                None => (
                    MappingStatus::UnmatchedMalformed,
                    "concept id is not a valid SCTID".to_string(),
                ),
            }
        };

        if status == MappingStatus::Matched {
            matched += 1;
        } else if status.is_unmatched() {
            unmatched += 1;
            warn!(
                feature_key = %record.feature_key,
                concept_id = %record.concept_id,
                status = status.as_str(),
                "feature-map row did not match the subset"
            );
        }

        rows.push(ValidationRow {
            feature_key: record.feature_key.clone(),
            concept_id: record.concept_id.clone(),
            status,
            note,
        });
    }

    info!(matched, unmatched, total = rows.len(), "feature map validated");
    ValidationOutcome {
        rows,
        matched,
        unmatched,
    }
}

/// Write the validation report as a CSV, one row per input feature key.
pub fn write_validation_report(
    path: &Path,
    outcome: &ValidationOutcome,
) -> Result<(), SubsetError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["feature_key", "concept_id", "status", "note"])?;
    for row in &outcome.rows {
        writer.write_record([
            row.feature_key.as_str(),
            row.concept_id.as_str(),
            row.status.as_str(),
            row.note.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn record(feature_key: &str, flag: &str, concept_id: &str) -> FeatureMapRecord {
        FeatureMapRecord {
            feature_key: feature_key.to_string(),
            map_to_snomed: flag.to_string(),
            concept_id: concept_id.to_string(),
            note: String::new(),
        }
    }

    #[test]
    fn rows_are_classified_against_the_final_concept_set() {
        let records = vec![
            record("sick.hpi.fever", "true", "100"),
            record("sick.pe.ear.red", "true", "999"),
            record("sick.pe.skin.rash", "true", ""),
            record("sick.plan.other", "false", "200"),
        ];
        let concept_ids = BTreeSet::from([100, 200]);

        let outcome = validate_feature_map(&records, &concept_ids);

        let statuses: Vec<MappingStatus> = outcome.rows.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                MappingStatus::Matched,
                MappingStatus::UnmatchedAbsent,
                MappingStatus::UnmatchedMalformed,
                MappingStatus::Skipped,
            ]
        );
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.unmatched, 2);
    }

    #[test]
    fn report_lists_every_input_row() {
        let records = vec![
            record("sick.hpi.fever", "true", "100"),
            record("sick.pe.ear.red", "true", "999"),
        ];
        let outcome = validate_feature_map(&records, &BTreeSet::from([100]));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        write_validation_report(&path, &outcome).unwrap();

        let report = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "feature_key,concept_id,status,note");
        assert_eq!(lines[1], "sick.hpi.fever,100,matched,");
        assert_eq!(lines[2], "sick.pe.ear.red,999,unmatched_absent,concept absent from subset");
        assert_eq!(lines.len(), 3);
    }
}
