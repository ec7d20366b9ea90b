//! # SNOMED CT subset builder
//!
//! An offline batch pipeline that reduces an RF2-style SNOMED CT release, a
//! seed concept list, and a feature-key → concept mapping CSV into a small,
//! internally consistent SQLite database the consuming application can ship
//! and query read-only.
//!
//! ## Pipeline
//!
//! Stages run in strict dependency order; a failed stage aborts the build:
//!
//! 1. **Release reader** ([`release`]): streams the four component files,
//!    snapshot-reduces each versioned history to its current rows, and
//!    projects active `|Is a|` relationships to hierarchy edges.
//! 2. **Seed loader** ([`feature_map`]): derives the seed concept set from
//!    the mapping CSV (regenerating the cached seed file) or reads the seed
//!    file directly.
//! 3. **Subset resolver** ([`closure`]): collects every ancestor of every
//!    seed so subsumption queries can be answered from the subset alone.
//! 4. **Integrity filter** ([`subset`]): restricts descriptions, language
//!    refset members, and edges to rows whose references resolve inside the
//!    retained concept set.
//! 5. **Feature-map validator** ([`validate`]): reconciles the mapping CSV
//!    against the resolved subset and writes a report.
//! 6. **Database writer** ([`writer`]): serializes the tables into a fresh
//!    artifact, atomically.
//! 7. **Post-build verifier** ([`verify`]): re-opens the artifact and
//!    asserts its structural invariants before the build reports success.
//!
//! Every build is a full recomputation from the inputs; nothing is updated
//! incrementally, so rebuilding from unchanged inputs reproduces the same
//! row sets.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use sprout_snomed_lib::{BuildConfig, run_build};
//!
//! let mut config = BuildConfig::new(
//!     "releases/SnomedCT_InternationalRF2_PRODUCTION_20250301T120000Z",
//!     "seeds.txt",
//!     "sql/snomed_subset_schema.sql",
//!     "snomed.sqlite",
//! );
//! config.feature_map = Some("sick_token_map.csv".into());
//! config.validate_feature_map = true;
//!
//! let report = run_build(&config)?;
//! println!("kept {} concepts", report.kept_concepts);
//! # Ok::<(), sprout_snomed_lib::SubsetError>(())
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::info;

pub mod closure;
pub mod feature_map;
pub mod models;
pub mod release;
pub mod subset;
pub mod validate;
pub mod verify;
pub mod writer;

pub use models::{BuildConfig, BuildReport, FeatureMapRecord, FeatureMapRow, SCHEMA_VERSION};
pub use writer::SNOMED_SUBSET_SCHEMA;

/// Everything that can end a build.
///
/// Every variant maps to the same process exit code (2); the distinctions
/// exist so operators and tests can tell a bad input from a bad artifact.
#[derive(Debug, Error)]
pub enum SubsetError {
    /// A required input file or directory does not exist.
    #[error("required input not found: {}", .0.display())]
    InputMissing(PathBuf),

    /// No file under the release root matched a component pattern.
    #[error("no release file matching `{pattern}` under {}", .root.display())]
    ReleaseFileNotFound { root: PathBuf, pattern: String },

    /// A component file's header lacks a required column.
    #[error("{}: required column `{column}` missing from header", .file.display())]
    MissingColumn { file: PathBuf, column: String },

    /// Too many malformed rows: the input is a truncated or wrong-format
    /// export, not a release with a few bad lines.
    #[error("{}: {skipped} of {total} rows malformed, input looks corrupt", .file.display())]
    CorruptInput {
        file: PathBuf,
        skipped: usize,
        total: usize,
    },

    /// A seed-file line is not a concept id.
    #[error("invalid concept id in seed file: {line:?}")]
    InvalidSeedLine { line: String },

    /// The feature map was supplied but contains no usable rows.
    #[error("feature map {} contains no usable rows", .0.display())]
    EmptyFeatureMap(PathBuf),

    /// Unmatched feature-map rows under `--fail-on-feature-map-mismatch`.
    #[error("{unmatched} feature-map rows did not match the resolved subset")]
    FeatureMapMismatch { unmatched: usize },

    /// The filtered edge set is not a DAG; the build corrupted it.
    #[error("is-a hierarchy contains a cycle involving concept {concept_id}")]
    HierarchyCycle { concept_id: i64 },

    /// A structural database operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The mapping CSV or the validation report could not be processed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The finished artifact failed its post-build checks. The artifact is
    /// left in place for inspection.
    #[error("post-build verification failed: {0}")]
    Verification(String),
}

/// Run the whole pipeline.
///
/// Returns the build report on success. On any error the output path holds
/// no new artifact, with one exception: [`SubsetError::Verification`] leaves
/// the rejected artifact in place for inspection.
pub fn run_build(config: &BuildConfig) -> Result<BuildReport, SubsetError> {
    if !config.schema_path.is_file() {
        return Err(SubsetError::InputMissing(config.schema_path.clone()));
    }

    // The feature map is the source of truth for the seed list; the seed
    // file is a cache regenerated from it. Without a feature map the seed
    // file is read as-is.
    let feature_map = match &config.feature_map {
        Some(path) => Some(feature_map::load_feature_map(path)?),
        None => None,
    };
    let seeds = match &feature_map {
        Some(records) => {
            let ids = feature_map::derive_seed_ids(records);
            feature_map::write_seed_file(&config.seed_path, &ids)?;
            info!(
                seeds = ids.len(),
                path = %config.seed_path.display(),
                "seed list regenerated from feature map"
            );
            ids
        }
        None => feature_map::load_seed_file(&config.seed_path)?,
    };

    let files = release::ReleaseFiles::locate(&config.release_root, &config.lang)?;
    let snapshot = release::ReleaseSnapshot::load(&files)?;

    let (seeds, seeds_excluded) = closure::resolve_seeds(&seeds, &snapshot.concepts);
    let parents = closure::parent_index(&snapshot.isa_edges);
    let retained = closure::ancestor_closure(&seeds, &parents);
    info!(
        seeds = seeds.len(),
        seeds_excluded,
        retained = retained.len(),
        "ancestor closure resolved"
    );

    let tables = subset::build_subset(&snapshot, &retained, config);
    if let Some(concept_id) = closure::find_cycle(&tables.isa_edges) {
        return Err(SubsetError::HierarchyCycle { concept_id });
    }

    // Validate before writing so a fatal mismatch aborts without leaving an
    // artifact behind.
    let concept_ids = tables.concept_ids();
    let validation = match (&feature_map, config.validate_feature_map) {
        (Some(records), true) => {
            let outcome = validate::validate_feature_map(records, &concept_ids);
            if let Some(report_path) = &config.feature_map_report {
                validate::write_validation_report(report_path, &outcome)?;
                info!(path = %report_path.display(), "feature-map report written");
            }
            if config.fail_on_feature_map_mismatch && outcome.unmatched > 0 {
                return Err(SubsetError::FeatureMapMismatch {
                    unmatched: outcome.unmatched,
                });
            }
            Some(outcome)
        }
        _ => None,
    };

    let release_id = config
        .release_id
        .clone()
        .or_else(|| release::infer_release_id(&config.release_root))
        .unwrap_or_else(|| "unknown".to_string());
    let built_at = Utc::now().to_rfc3339();
    let schema_sql = fs::read_to_string(&config.schema_path)?;

    let mut db = writer::SubsetWriter::create(&config.out_path)?;
    db.init_schema(&schema_sql)?;
    db.insert_concepts(&tables.concepts)?;
    db.insert_descriptions(&tables.descriptions)?;
    db.insert_language_refset(&tables.language_refset)?;
    db.insert_isa_edges(&tables.isa_edges)?;
    if let Some(records) = &feature_map {
        db.insert_feature_map(&candidate_rows(records), &built_at)?;
    }
    db.write_meta(&meta_rows(config, &release_id, &built_at))?;
    let out_path = db.finalize()?;

    verify::verify_artifact(&out_path, feature_map.is_some())?;

    Ok(BuildReport {
        release_id,
        out_path,
        seed_count: seeds.len(),
        seeds_excluded,
        kept_concepts: tables.concepts.len(),
        kept_descriptions: tables.descriptions.len(),
        kept_langrefset: tables.language_refset.len(),
        kept_isa_edges: tables.isa_edges.len(),
        dropped_descriptions: tables.dropped.descriptions,
        dropped_langrefset: tables.dropped.language_refset,
        dropped_isa_edges: tables.dropped.isa_edges,
        feature_map_matched: validation.as_ref().map(|outcome| outcome.matched),
        feature_map_unmatched: validation.as_ref().map(|outcome| outcome.unmatched),
    })
}

/// Rows for the `feature_snomed_map` table: every row flagged for mapping
/// with a well-formed concept id. In the default permissive mode unmatched
/// candidates are written too, so curation can iterate without blocking
/// builds.
fn candidate_rows(records: &[FeatureMapRecord]) -> Vec<FeatureMapRow> {
    records
        .iter()
        .filter(|record| record.wants_mapping())
        .filter_map(|record| {
            record.parsed_concept_id().map(|concept_id| FeatureMapRow {
                feature_key: record.feature_key.clone(),
                concept_id,
                active: true,
                note: if record.note.is_empty() {
                    None
                } else {
                    Some(record.note.clone())
                },
            })
        })
        .collect()
}

fn meta_rows(
    config: &BuildConfig,
    release_id: &str,
    built_at: &str,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("schema_version".to_string(), SCHEMA_VERSION.to_string()),
        ("rf2_release".to_string(), release_id.to_string()),
        ("subset_name".to_string(), config.subset_name.clone()),
        ("subset_version".to_string(), config.subset_version.clone()),
        ("built_at".to_string(), built_at.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeatureMapRecord;

    fn record(feature_key: &str, flag: &str, concept_id: &str, note: &str) -> FeatureMapRecord {
        FeatureMapRecord {
            feature_key: feature_key.to_string(),
            map_to_snomed: flag.to_string(),
            concept_id: concept_id.to_string(),
            note: note.to_string(),
        }
    }

    #[test]
    fn candidate_rows_take_only_flagged_well_formed_mappings() {
        let records = vec![
            record("a", "true", "100", "fever"),
            record("b", "false", "200", ""),
            record("c", "true", "pending", ""),
            record("d", "yes", "300", ""),
        ];

        let rows = candidate_rows(&records);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].feature_key, "a");
        assert_eq!(rows[0].concept_id, 100);
        assert_eq!(rows[0].note.as_deref(), Some("fever"));
        assert_eq!(rows[1].feature_key, "d");
        assert_eq!(rows[1].note, None);
    }

    #[test]
    fn meta_rows_carry_the_build_identity() {
        let mut config = BuildConfig::new("release", "seeds", "schema", "out");
        config.subset_name = "pediatric_core".to_string();
        config.subset_version = "2025-03-01".to_string();

        let meta = meta_rows(&config, "20250301", "2025-03-02T00:00:00Z");
        assert_eq!(meta["schema_version"], SCHEMA_VERSION);
        assert_eq!(meta["rf2_release"], "20250301");
        assert_eq!(meta["subset_name"], "pediatric_core");
        assert_eq!(meta["subset_version"], "2025-03-01");
        assert_eq!(meta["built_at"], "2025-03-02T00:00:00Z");
    }
}
