//! # Subset database builder CLI
//!
//! Builds the shippable SNOMED CT subset SQLite database from an RF2 release,
//! a seed concept list, and (optionally) the feature-key mapping CSV.
//!
//! ## Command line options
//!
//! ```text
//! --release <DIR>                  Root of the extracted RF2 release (required)
//! --seed <FILE>                    Seed concept-id list (required; regenerated
//!                                  from the feature map when one is given)
//! --schema <FILE>                  DDL file defining the output schema (required)
//! --out <FILE>                     Output database path (required; any prior
//!                                  artifact and its sidecars are deleted first)
//! --release-id <STRING>            Release id for the meta table (default:
//!                                  inferred from the release folder name)
//! --subset-name <STRING>           Subset name for the meta table
//! --subset-version <STRING>        Subset version for the meta table (default:
//!                                  today's date)
//! --feature-map <FILE>             Feature-key → concept mapping CSV
//! --validate-feature-map           Validate the feature map against the subset
//! --feature-map-report <FILE>      Where to write the validation report
//! --fail-on-feature-map-mismatch   Treat unmatched feature-map rows as fatal
//! --limit <N>                      Cap the number of descriptions kept (0 = all)
//! --lang <TAG>                     Description language tag (default: en)
//! ```
//!
//! ## Usage examples
//!
//! ```bash
//! sprout-snomed-build \
//!     --release ~/releases/SnomedCT_InternationalRF2_PRODUCTION_20250301T120000Z \
//!     --seed seeds.txt \
//!     --schema snomed_subset_schema.sql \
//!     --out snomed.sqlite \
//!     --subset-name pediatric_core \
//!     --feature-map sick_token_map.csv \
//!     --validate-feature-map \
//!     --feature-map-report feature_map_report.csv
//! ```
//!
//! Exit codes: `0` on success; `2` for any build failure (missing input,
//! corrupt release, fatal feature-map mismatch, write or verification
//! failure), so calling scripts can gate on the artifact being trustworthy.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use sprout_snomed_lib::{BuildConfig, run_build};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sprout-snomed-build")]
#[command(about = "Build a SNOMED CT subset SQLite database from an RF2 release")]
struct Args {
    /// Root of the extracted RF2 release
    #[arg(long)]
    release: PathBuf,

    /// Seed concept-id list (regenerated from the feature map when one is given)
    #[arg(long)]
    seed: PathBuf,

    /// DDL file defining the output schema
    #[arg(long)]
    schema: PathBuf,

    /// Output database path
    #[arg(long)]
    out: PathBuf,

    /// Release identifier recorded in the meta table (inferred from the
    /// release folder name when omitted)
    #[arg(long)]
    release_id: Option<String>,

    /// Subset name recorded in the meta table
    #[arg(long, default_value = "custom_subset")]
    subset_name: String,

    /// Subset version recorded in the meta table (defaults to today's date)
    #[arg(long)]
    subset_version: Option<String>,

    /// Feature-key → concept mapping CSV
    #[arg(long)]
    feature_map: Option<PathBuf>,

    /// Validate the feature map against the resolved subset
    #[arg(long, requires = "feature_map")]
    validate_feature_map: bool,

    /// Where to write the validation report
    #[arg(long, requires = "validate_feature_map")]
    feature_map_report: Option<PathBuf>,

    /// Treat any unmatched feature-map row as a fatal error
    #[arg(long, requires = "validate_feature_map")]
    fail_on_feature_map_mismatch: bool,

    /// Cap the number of descriptions kept (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Description language tag used to pick release files
    #[arg(long, default_value = "en")]
    lang: String,
}

impl Args {
    fn into_config(self) -> BuildConfig {
        let mut config = BuildConfig::new(self.release, self.seed, self.schema, self.out);
        config.release_id = self.release_id;
        config.subset_name = self.subset_name;
        config.subset_version = self
            .subset_version
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
        config.feature_map = self.feature_map;
        config.validate_feature_map = self.validate_feature_map;
        config.feature_map_report = self.feature_map_report;
        config.fail_on_feature_map_mismatch = self.fail_on_feature_map_mismatch;
        config.limit_descriptions = self.limit;
        config.lang = self.lang;
        config
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Args::parse().into_config();

    match run_build(&config) {
        Ok(report) => {
            info!(
                release_id = %report.release_id,
                concepts = report.kept_concepts,
                descriptions = report.kept_descriptions,
                langrefset = report.kept_langrefset,
                isa_edges = report.kept_isa_edges,
                out = %report.out_path.display(),
                "subset build complete"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("build failed: {err}");
            ExitCode::from(2)
        }
    }
}
