//! # Candidate concept search for unmapped feature keys
//!
//! Curation helper for the feature-map CSV: for every row flagged for mapping
//! whose concept id is still blank (or not a number), derive a search phrase
//! from the feature key and scan the release's active descriptions for
//! plausible concepts. The output is a review CSV, one block of ranked
//! candidates per feature key; it never touches the subset database.
//!
//! A feature key like `sick.pe.lungs.crackles_r` turns into the phrase
//! `lungs crackles` (the last two dot-separated segments, underscores to
//! spaces, common field abbreviations expanded, trailing laterality markers
//! stripped). A description matches when every word of the phrase occurs in
//! its normalized term; fully-specified names rank first.
//!
//! ```bash
//! sprout-snomed-candidates \
//!     --release ~/releases/SnomedCT_InternationalRF2_PRODUCTION_20250301T120000Z \
//!     --feature-map sick_token_map.csv \
//!     --out candidates.csv
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;
use sprout_snomed_lib::feature_map::load_feature_map;
use sprout_snomed_lib::models::FSN_TYPE_ID;
use sprout_snomed_lib::release::{ReleaseFiles, parse_concepts, parse_descriptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sprout-snomed-candidates")]
#[command(about = "Propose SNOMED concept candidates for unmapped feature keys")]
struct Args {
    /// Root of the extracted RF2 release
    #[arg(long)]
    release: PathBuf,

    /// Feature-key → concept mapping CSV
    #[arg(long)]
    feature_map: PathBuf,

    /// Output CSV of candidate concepts
    #[arg(long)]
    out: PathBuf,

    /// Maximum candidates per feature key
    #[arg(long, default_value_t = 15)]
    top: usize,

    /// Description language tag used to pick release files
    #[arg(long, default_value = "en")]
    lang: String,
}

/// Folds terms and search phrases into a comparable form: lowercase,
/// punctuation to spaces, whitespace collapsed.
struct Normalizer {
    punctuation: Regex,
    whitespace: Regex,
}

impl Normalizer {
    fn new() -> Result<Self> {
        Ok(Self {
            punctuation: Regex::new(r"[()\[\],;:/\-]+")?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    fn normalize(&self, text: &str) -> String {
        let lowered = text.trim().to_lowercase();
        let stripped = self.punctuation.replace_all(&lowered, " ");
        self.whitespace
            .replace_all(stripped.trim(), " ")
            .into_owned()
    }
}

/// Build the search phrase for a feature key from its last two segments,
/// e.g. `sick.pe.lungs.crackles_r` → `lungs crackles`.
fn search_phrase(feature_key: &str, laterality: &Regex) -> String {
    let parts: Vec<&str> = feature_key.split('.').filter(|part| !part.is_empty()).collect();
    if parts.len() < 2 {
        return feature_key.trim().to_string();
    }

    let field = parts[parts.len() - 2];
    let value = parts[parts.len() - 1];

    let field_phrase = match field {
        "ent" => "ear nose throat",
        "msk" => "musculoskeletal",
        "gi" => "gastrointestinal",
        other => other,
    };
    let value_phrase = value.replace('_', " ");
    // Laterality markers describe the exam side, not the concept.
    let value_phrase = laterality.replace(&value_phrase, "");

    format!("{field_phrase} {}", value_phrase.trim())
        .trim()
        .to_string()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let records = load_feature_map(&args.feature_map)
        .with_context(|| format!("reading feature map {}", args.feature_map.display()))?;
    let targets: Vec<_> = records
        .iter()
        .filter(|record| record.wants_mapping() && record.parsed_concept_id().is_none())
        .collect();

    let normalizer = Normalizer::new()?;
    let laterality = Regex::new(r"\b[lr]\b\s*$")?;
    let queries: Vec<Vec<String>> = targets
        .iter()
        .map(|record| {
            let phrase = search_phrase(&record.feature_key, &laterality);
            normalizer
                .normalize(&phrase)
                .split(' ')
                .filter(|word| !word.is_empty())
                .map(str::to_string)
                .collect()
        })
        .collect();

    let mut writer = csv::Writer::from_path(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;
    writer.write_record([
        "feature_key",
        "search_phrase",
        "existing_concept_id",
        "candidate_concept_id",
        "candidate_concept_active",
        "type_id",
        "term",
    ])?;

    if targets.is_empty() {
        writer.flush()?;
        info!(out = %args.out.display(), "every flagged feature key already has a concept id");
        return Ok(());
    }

    let files = ReleaseFiles::locate(&args.release, &args.lang)?;
    let concepts = parse_concepts(&files.concepts)?;
    let descriptions = parse_descriptions(&files.descriptions)?;
    info!(
        targets = targets.len(),
        descriptions = descriptions.len(),
        "scanning descriptions for candidates"
    );

    // One pass over the descriptions, matching every query against each term.
    let mut hits: Vec<Vec<(i64, i64, String)>> = vec![Vec::new(); targets.len()];
    for description in descriptions.values().filter(|d| d.active) {
        let term = normalizer.normalize(&description.term);
        for (i, words) in queries.iter().enumerate() {
            if !words.is_empty() && words.iter().all(|word| term.contains(word.as_str())) {
                hits[i].push((
                    description.concept_id,
                    description.type_id,
                    description.term.clone(),
                ));
            }
        }
    }

    let mut total = 0usize;
    for (i, record) in targets.iter().enumerate() {
        let phrase = queries[i].join(" ");
        let mut candidates = std::mem::take(&mut hits[i]);

        let mut seen = BTreeSet::new();
        candidates.retain(|(concept_id, _, term)| seen.insert((*concept_id, term.clone())));
        candidates.sort_by_key(|(_, type_id, term)| {
            (i32::from(*type_id != FSN_TYPE_ID), term.to_lowercase())
        });

        for (concept_id, type_id, term) in candidates.into_iter().take(args.top) {
            let active = concepts
                .get(&concept_id)
                .map(|concept| if concept.active { "1" } else { "0" })
                .unwrap_or("?");
            writer.write_record([
                record.feature_key.as_str(),
                phrase.as_str(),
                record.concept_id.as_str(),
                concept_id.to_string().as_str(),
                active,
                type_id.to_string().as_str(),
                term.as_str(),
            ])?;
            total += 1;
        }
    }

    writer.flush()?;
    info!(candidates = total, out = %args.out.display(), "candidate report written");
    Ok(())
}
