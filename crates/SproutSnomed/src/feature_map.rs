//! Feature-map ingestion and seed-list derivation.
//!
//! The curation CSV maps stable application feature keys (e.g.
//! `sick.pe.lungs.wheezing`) to SNOMED concept ids. It is the upstream source
//! of truth for the subset: every row flagged for mapping that carries a
//! well-formed concept id contributes that id to the seed set. The seed file
//! on disk is a cached, inspectable derivative, and regenerating it from the
//! same CSV is byte-identical.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::SubsetError;
use crate::models::FeatureMapRecord;
use crate::release::check_skip_ratio;

/// Read the feature-mapping CSV.
///
/// Unknown columns are ignored; malformed rows are skipped under the shared
/// skip-ratio policy. Duplicate feature keys keep the later row, matching the
/// last-write-wins semantics of the output table's primary key. An empty map
/// is fatal: a build that was pointed at one expects mappings.
pub fn load_feature_map(path: &Path) -> Result<Vec<FeatureMapRecord>, SubsetError> {
    if !path.is_file() {
        return Err(SubsetError::InputMissing(path.to_path_buf()));
    }

    let mut reader = csv::Reader::from_path(path)?;
    let mut records: Vec<FeatureMapRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut total = 0usize;
    let mut skipped = 0usize;

    for row in reader.deserialize() {
        total += 1;
        let record: FeatureMapRecord = match row {
            Ok(record) => record,
            Err(err) => {
                skipped += 1;
                debug!(%err, "skipping malformed feature-map row");
                continue;
            }
        };
        if record.feature_key.trim().is_empty() {
            skipped += 1;
            continue;
        }
        match index.get(&record.feature_key) {
            Some(&at) => {
                warn!(feature_key = %record.feature_key, "duplicate feature key, keeping the later row");
                records[at] = record;
            }
            None => {
                index.insert(record.feature_key.clone(), records.len());
                records.push(record);
            }
        }
    }

    check_skip_ratio(path, skipped, total)?;
    if records.is_empty() {
        return Err(SubsetError::EmptyFeatureMap(path.to_path_buf()));
    }
    Ok(records)
}

/// The seed concept-id set derived from the feature map: rows flagged for
/// mapping whose concept id is a well-formed run of decimal digits.
pub fn derive_seed_ids(records: &[FeatureMapRecord]) -> BTreeSet<i64> {
    records
        .iter()
        .filter(|record| record.wants_mapping())
        .filter_map(FeatureMapRecord::parsed_concept_id)
        .collect()
}

/// Write the seed list: one id per line, ascending. Deterministic, so
/// regenerating from an unchanged CSV rewrites the file byte-identically.
pub fn write_seed_file(path: &Path, ids: &BTreeSet<i64>) -> Result<(), SubsetError> {
    let mut out = String::new();
    for id in ids {
        out.push_str(&id.to_string());
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

/// Read a seed list: one concept id per line, `#` starts a comment, blank
/// lines are ignored. Anything else that is not a run of decimal digits is
/// fatal: the file is machine-written, so damage means a stale or
/// hand-mangled cache.
pub fn load_seed_file(path: &Path) -> Result<BTreeSet<i64>, SubsetError> {
    if !path.is_file() {
        return Err(SubsetError::InputMissing(path.to_path_buf()));
    }

    let text = fs::read_to_string(path)?;
    let mut ids = BTreeSet::new();
    for raw in text.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if !line.bytes().all(|b| b.is_ascii_digit()) {
            return Err(SubsetError::InvalidSeedLine {
                line: raw.to_string(),
            });
        }
        let id = line.parse().map_err(|_| SubsetError::InvalidSeedLine {
            line: raw.to_string(),
        })?;
        ids.insert(id);
    }
    Ok(ids)
}
