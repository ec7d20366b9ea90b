//! Core data model for the subset builder.
//!
//! Row types mirror the output schema one-to-one; identifiers are SCTIDs
//! (64-bit integers). The [`BuildConfig`] struct is the single configuration
//! surface: it is constructed once at the entry point and passed by reference
//! through every stage, so no stage reads ambient state.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// SCTID of the `|Is a|` relationship type.
pub const IS_A: i64 = 116680003;

/// SCTID of the fully-specified-name description type.
pub const FSN_TYPE_ID: i64 = 900000000000003001;

/// SCTID of the synonym description type.
pub const SYNONYM_TYPE_ID: i64 = 900000000000013009;

/// SCTID of the en-GB language reference set.
pub const EN_GB_LANG_REFSET: i64 = 900000000000508004;

/// SCTID of the en-US language reference set.
pub const EN_US_LANG_REFSET: i64 = 900000000000509007;

/// SCTID of the `preferred` acceptability value.
pub const PREFERRED: i64 = 900000000000548007;

/// SCTID of the `acceptable` acceptability value.
pub const ACCEPTABLE: i64 = 900000000000549004;

/// Version string recorded under the `schema_version` meta key.
pub const SCHEMA_VERSION: &str = "1.0";

/// One current concept row after snapshot reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConceptRow {
    pub concept_id: i64,
    pub active: bool,
    pub effective_time: String,
    pub module_id: i64,
    pub definition_status_id: i64,
}

/// One current description row after snapshot reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionRow {
    pub description_id: i64,
    pub concept_id: i64,
    pub active: bool,
    pub effective_time: String,
    pub module_id: i64,
    pub language_code: String,
    pub type_id: i64,
    pub term: String,
    pub case_significance_id: i64,
}

/// One current language-refset member row after snapshot reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LangRefsetRow {
    pub langrefset_id: i64,
    pub active: bool,
    pub effective_time: String,
    pub module_id: i64,
    pub refset_id: i64,
    pub referenced_component_id: i64,
    pub acceptability_id: i64,
}

/// A directed hierarchy edge: child |is a| parent. The pair is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IsaEdge {
    pub child: i64,
    pub parent: i64,
}

/// One row of the feature-mapping CSV.
///
/// Only the columns the pipeline consumes are named here; any other columns
/// the curation spreadsheet carries are ignored. The concept id stays a raw
/// string because upstream authors leave it blank or provisional while a
/// mapping is pending.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeatureMapRecord {
    #[serde(rename = "token")]
    pub feature_key: String,

    #[serde(rename = "map_to_snomed", default)]
    pub map_to_snomed: String,

    #[serde(rename = "snomed_concept_id", default)]
    pub concept_id: String,

    #[serde(rename = "notes", default)]
    pub note: String,
}

impl FeatureMapRecord {
    /// Whether the row is flagged for mapping into the vocabulary.
    pub fn wants_mapping(&self) -> bool {
        parse_bool_flag(&self.map_to_snomed)
    }

    /// The concept id, if it is a well-formed run of decimal digits.
    pub fn parsed_concept_id(&self) -> Option<i64> {
        let id = self.concept_id.trim();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        id.parse().ok()
    }
}

/// Parse a boolean-like spreadsheet flag. Accepts the common true spellings
/// (`true`, `1`, `yes`, `y`) case-insensitively; everything else is false.
pub fn parse_bool_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y"
    )
}

/// One row destined for the `feature_snomed_map` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureMapRow {
    pub feature_key: String,
    pub concept_id: i64,
    pub active: bool,
    pub note: Option<String>,
}

/// Configuration for one build, assembled once from the CLI arguments.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Root of the extracted RF2 release.
    pub release_root: PathBuf,

    /// Seed concept-id list. Regenerated from the feature map when one is
    /// supplied, read as-is otherwise.
    pub seed_path: PathBuf,

    /// DDL file defining the output schema.
    pub schema_path: PathBuf,

    /// Output database path.
    pub out_path: PathBuf,

    /// Release identifier recorded in the meta table. Inferred from the
    /// release folder name when absent.
    pub release_id: Option<String>,

    /// Subset name recorded in the meta table.
    pub subset_name: String,

    /// Subset version recorded in the meta table.
    pub subset_version: String,

    /// Feature-key → concept mapping CSV.
    pub feature_map: Option<PathBuf>,

    /// Run the feature-map validator stage.
    pub validate_feature_map: bool,

    /// Where to write the validation report.
    pub feature_map_report: Option<PathBuf>,

    /// Treat any unmatched feature-map row as fatal.
    pub fail_on_feature_map_mismatch: bool,

    /// Description language tag used to pick release files.
    pub lang: String,

    /// Restrict descriptions to these type ids; `None` keeps every type.
    pub description_types: Option<BTreeSet<i64>>,

    /// Restrict language-refset rows to these refset ids; `None` keeps all.
    pub lang_refsets: Option<BTreeSet<i64>>,

    /// Cap the number of descriptions kept (0 = unlimited). Dev builds only.
    pub limit_descriptions: usize,
}

impl BuildConfig {
    /// A configuration with the default filters: FSN + synonym descriptions,
    /// en-GB + en-US language refsets, no description cap.
    pub fn new(
        release_root: impl Into<PathBuf>,
        seed_path: impl Into<PathBuf>,
        schema_path: impl Into<PathBuf>,
        out_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            release_root: release_root.into(),
            seed_path: seed_path.into(),
            schema_path: schema_path.into(),
            out_path: out_path.into(),
            release_id: None,
            subset_name: "custom_subset".to_string(),
            subset_version: "dev".to_string(),
            feature_map: None,
            validate_feature_map: false,
            feature_map_report: None,
            fail_on_feature_map_mismatch: false,
            lang: "en".to_string(),
            description_types: Some(BTreeSet::from([FSN_TYPE_ID, SYNONYM_TYPE_ID])),
            lang_refsets: Some(BTreeSet::from([EN_GB_LANG_REFSET, EN_US_LANG_REFSET])),
            limit_descriptions: 0,
        }
    }
}

/// Counts reported by a completed build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub release_id: String,
    pub out_path: PathBuf,
    pub seed_count: usize,
    pub seeds_excluded: usize,
    pub kept_concepts: usize,
    pub kept_descriptions: usize,
    pub kept_langrefset: usize,
    pub kept_isa_edges: usize,
    pub dropped_descriptions: usize,
    pub dropped_langrefset: usize,
    pub dropped_isa_edges: usize,
    /// Matched / unmatched candidate counts, when the validator ran.
    pub feature_map_matched: Option<usize>,
    pub feature_map_unmatched: Option<usize>,
}
