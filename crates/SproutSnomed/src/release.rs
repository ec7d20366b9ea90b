//! RF2 release reading and snapshot reduction.
//!
//! A release is a directory tree containing one tab-delimited file per
//! component type (concepts, descriptions, language refset members,
//! relationships). Each file is a versioned history export: the same
//! identifier may appear on several rows at different effective times.
//! Reading a file streams it once and keeps only the row with the greatest
//! effective time per identifier ("snapshot reduction"); on an equal
//! effective time the row appearing later in the file wins, so reduction is
//! reproducible across runs. Already-reduced `Snapshot` exports pass through
//! unchanged.
//!
//! The four component parses are independent and run under `rayon::join`,
//! each building its own map with no shared mutable state.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rayon::join;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::SubsetError;
use crate::models::{ConceptRow, DescriptionRow, IS_A, IsaEdge, LangRefsetRow};

/// Fraction of malformed data rows a component file may contain before the
/// whole input is treated as corrupt and the build aborts.
pub const MAX_SKIP_RATIO: f64 = 0.01;

/// Paths to the four component files of a release.
#[derive(Debug, Clone)]
pub struct ReleaseFiles {
    pub concepts: PathBuf,
    pub descriptions: PathBuf,
    pub language_refset: PathBuf,
    pub relationships: PathBuf,
}

impl ReleaseFiles {
    /// Locate the component files under a release root.
    ///
    /// Files are matched by their RF2 naming conventions; both `Full` and
    /// `Snapshot` exports match. When several files match (some releases
    /// carry more than one edition) the lexicographically last path wins,
    /// which prefers the newest release date embedded in the name. For
    /// descriptions and the language refset a file tagged with `lang` is
    /// preferred over an untagged one.
    pub fn locate(root: &Path, lang: &str) -> Result<Self, SubsetError> {
        if !root.is_dir() {
            return Err(SubsetError::InputMissing(root.to_path_buf()));
        }

        let mut files = Vec::new();
        walk_files(root, &mut files)?;
        files.sort();

        let concepts = pick_last(&files, |name| {
            name.starts_with("sct2_Concept_") && name.ends_with(".txt")
        })
        .ok_or_else(|| not_found(root, "sct2_Concept_*.txt"))?;

        let lang_dash = format!("-{lang}_");
        let lang_under = format!("_{lang}_");
        let tagged = |name: &str| name.contains(&lang_dash) || name.contains(&lang_under);

        let descriptions = pick_last(&files, |name| {
            name.starts_with("sct2_Description_") && name.ends_with(".txt") && tagged(name)
        })
        .or_else(|| {
            pick_last(&files, |name| {
                name.starts_with("sct2_Description_") && name.ends_with(".txt")
            })
        })
        .ok_or_else(|| not_found(root, "sct2_Description_*.txt"))?;

        let language_refset = pick_last(&files, |name| {
            name.starts_with("der2_cRefset_Language") && name.ends_with(".txt") && tagged(name)
        })
        .or_else(|| {
            pick_last(&files, |name| {
                name.starts_with("der2_cRefset_Language") && name.ends_with(".txt")
            })
        })
        .ok_or_else(|| not_found(root, "der2_cRefset_Language*.txt"))?;

        // The trailing underscore keeps sct2_StatedRelationship_* and
        // sct2_RelationshipConcreteValues_* out of the match.
        let relationships = pick_last(&files, |name| {
            name.starts_with("sct2_Relationship_") && name.ends_with(".txt")
        })
        .ok_or_else(|| not_found(root, "sct2_Relationship_*.txt"))?;

        Ok(Self {
            concepts,
            descriptions,
            language_refset,
            relationships,
        })
    }
}

fn not_found(root: &Path, pattern: &str) -> SubsetError {
    SubsetError::ReleaseFileNotFound {
        root: root.to_path_buf(),
        pattern: pattern.to_string(),
    }
}

fn walk_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn pick_last(files: &[PathBuf], matches: impl Fn(&str) -> bool) -> Option<PathBuf> {
    files
        .iter()
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(&matches)
        })
        .next_back()
        .cloned()
}

/// Try to infer a `YYYYMMDD` release id from the release folder name.
pub fn infer_release_id(root: &Path) -> Option<String> {
    let name = root.file_name()?.to_str()?;
    let re = Regex::new(r"20\d{6}").ok()?;
    re.find(name).map(|m| m.as_str().to_string())
}

/// The reduced, current state of a release.
#[derive(Debug, Default)]
pub struct ReleaseSnapshot {
    pub concepts: HashMap<i64, ConceptRow>,
    pub descriptions: HashMap<i64, DescriptionRow>,
    pub language_refset: HashMap<i64, LangRefsetRow>,
    /// Active is-a edges, deduplicated and sorted (child, parent).
    pub isa_edges: Vec<IsaEdge>,
}

impl ReleaseSnapshot {
    /// Parse and reduce all four component files.
    pub fn load(files: &ReleaseFiles) -> Result<Self, SubsetError> {
        let ((concepts, descriptions), (language_refset, isa_edges)) = join(
            || {
                join(
                    || parse_concepts(&files.concepts),
                    || parse_descriptions(&files.descriptions),
                )
            },
            || {
                join(
                    || parse_language_refset(&files.language_refset),
                    || parse_relationships(&files.relationships),
                )
            },
        );

        let snapshot = Self {
            concepts: concepts?,
            descriptions: descriptions?,
            language_refset: language_refset?,
            isa_edges: isa_edges?,
        };
        info!(
            concepts = snapshot.concepts.len(),
            descriptions = snapshot.descriptions.len(),
            language_refset = snapshot.language_refset.len(),
            isa_edges = snapshot.isa_edges.len(),
            "release snapshot reduced"
        );
        Ok(snapshot)
    }
}

/// Parse the concept component file.
pub fn parse_concepts(path: &Path) -> Result<HashMap<i64, ConceptRow>, SubsetError> {
    let (reader, columns) = open_component(path)?;
    let active = column_index(&columns, path, "active")?;
    let module_id = column_index(&columns, path, "moduleId")?;
    let definition_status_id = column_index(&columns, path, "definitionStatusId")?;

    reduce_latest(path, &columns, reader, |id, effective_time, fields| {
        Some(ConceptRow {
            concept_id: id,
            active: parse_active(fields[active])?,
            effective_time: effective_time.to_string(),
            module_id: fields[module_id].parse().ok()?,
            definition_status_id: fields[definition_status_id].parse().ok()?,
        })
    })
}

/// Parse the description component file.
pub fn parse_descriptions(path: &Path) -> Result<HashMap<i64, DescriptionRow>, SubsetError> {
    let (reader, columns) = open_component(path)?;
    let active = column_index(&columns, path, "active")?;
    let module_id = column_index(&columns, path, "moduleId")?;
    let concept_id = column_index(&columns, path, "conceptId")?;
    let language_code = column_index(&columns, path, "languageCode")?;
    let type_id = column_index(&columns, path, "typeId")?;
    let term = column_index(&columns, path, "term")?;
    let case_significance_id = column_index(&columns, path, "caseSignificanceId")?;

    reduce_latest(path, &columns, reader, |id, effective_time, fields| {
        Some(DescriptionRow {
            description_id: id,
            concept_id: fields[concept_id].parse().ok()?,
            active: parse_active(fields[active])?,
            effective_time: effective_time.to_string(),
            module_id: fields[module_id].parse().ok()?,
            language_code: fields[language_code].to_string(),
            type_id: fields[type_id].parse().ok()?,
            term: fields[term].to_string(),
            case_significance_id: fields[case_significance_id].parse().ok()?,
        })
    })
}

/// Parse the language-refset component file.
pub fn parse_language_refset(path: &Path) -> Result<HashMap<i64, LangRefsetRow>, SubsetError> {
    let (reader, columns) = open_component(path)?;
    let active = column_index(&columns, path, "active")?;
    let module_id = column_index(&columns, path, "moduleId")?;
    let refset_id = column_index(&columns, path, "refsetId")?;
    let referenced_component_id = column_index(&columns, path, "referencedComponentId")?;
    let acceptability_id = column_index(&columns, path, "acceptabilityId")?;

    reduce_latest(path, &columns, reader, |id, effective_time, fields| {
        Some(LangRefsetRow {
            langrefset_id: id,
            active: parse_active(fields[active])?,
            effective_time: effective_time.to_string(),
            module_id: fields[module_id].parse().ok()?,
            refset_id: fields[refset_id].parse().ok()?,
            referenced_component_id: fields[referenced_component_id].parse().ok()?,
            acceptability_id: fields[acceptability_id].parse().ok()?,
        })
    })
}

struct RelationshipRow {
    active: bool,
    source_id: i64,
    destination_id: i64,
    type_id: i64,
}

/// Parse the relationship component file and project it to is-a edges:
/// reduce to current rows, keep active rows whose type is `|Is a|`, and
/// deduplicate the (child, parent) pairs.
pub fn parse_relationships(path: &Path) -> Result<Vec<IsaEdge>, SubsetError> {
    let (reader, columns) = open_component(path)?;
    let active = column_index(&columns, path, "active")?;
    let source_id = column_index(&columns, path, "sourceId")?;
    let destination_id = column_index(&columns, path, "destinationId")?;
    let type_id = column_index(&columns, path, "typeId")?;

    let reduced = reduce_latest(path, &columns, reader, |_, _, fields| {
        Some(RelationshipRow {
            active: parse_active(fields[active])?,
            source_id: fields[source_id].parse().ok()?,
            destination_id: fields[destination_id].parse().ok()?,
            type_id: fields[type_id].parse().ok()?,
        })
    })?;

    let edges: BTreeSet<IsaEdge> = reduced
        .values()
        .filter(|row| row.active && row.type_id == IS_A)
        .map(|row| IsaEdge {
            child: row.source_id,
            parent: row.destination_id,
        })
        .collect();
    Ok(edges.into_iter().collect())
}

fn open_component(path: &Path) -> Result<(BufReader<File>, Vec<String>), SubsetError> {
    if !path.is_file() {
        return Err(SubsetError::InputMissing(path.to_path_buf()));
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut header = String::new();
    reader.read_line(&mut header)?;
    let columns = header
        .trim_end_matches(['\r', '\n'])
        .split('\t')
        .map(str::to_owned)
        .collect();
    Ok((reader, columns))
}

fn column_index(columns: &[String], path: &Path, name: &str) -> Result<usize, SubsetError> {
    columns
        .iter()
        .position(|column| column == name)
        .ok_or_else(|| SubsetError::MissingColumn {
            file: path.to_path_buf(),
            column: name.to_string(),
        })
}

fn parse_active(value: &str) -> Option<bool> {
    match value {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

/// Stream a component file once, keeping the row with the greatest effective
/// time per identifier. Effective times are fixed-width `YYYYMMDD`, so byte
/// comparison is chronological. Rows whose effective time ties the current
/// winner replace it, which makes the later row in file order win.
///
/// `decode` receives the already-parsed identifier and effective time plus
/// the raw fields; returning `None` marks the row malformed. Malformed rows
/// are skipped and counted; a skip ratio above [`MAX_SKIP_RATIO`] is fatal.
fn reduce_latest<T, F>(
    path: &Path,
    columns: &[String],
    reader: BufReader<File>,
    decode: F,
) -> Result<HashMap<i64, T>, SubsetError>
where
    F: Fn(i64, &str, &[&str]) -> Option<T>,
{
    let id_col = column_index(columns, path, "id")?;
    let et_col = column_index(columns, path, "effectiveTime")?;
    let width = columns.len();

    let mut latest: HashMap<i64, (String, T)> = HashMap::new();
    let mut total = 0usize;
    let mut skipped = 0usize;

    for line in reader.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        total += 1;

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != width {
            skipped += 1;
            debug!(file = %path.display(), row = total, "wrong field count, row skipped");
            continue;
        }
        let Ok(id) = fields[id_col].parse::<i64>() else {
            skipped += 1;
            debug!(file = %path.display(), row = total, "non-numeric identifier, row skipped");
            continue;
        };
        let effective_time = fields[et_col];
        if let Some((current, _)) = latest.get(&id) {
            if effective_time < current.as_str() {
                continue;
            }
        }
        let Some(record) = decode(id, effective_time, &fields) else {
            skipped += 1;
            debug!(file = %path.display(), row = total, "unparsable row skipped");
            continue;
        };
        latest.insert(id, (effective_time.to_string(), record));
    }

    check_skip_ratio(path, skipped, total)?;
    Ok(latest
        .into_iter()
        .map(|(id, (_, record))| (id, record))
        .collect())
}

/// Shared malformed-row policy: skipping is recoverable up to
/// [`MAX_SKIP_RATIO`], beyond which the input is treated as corrupt.
pub(crate) fn check_skip_ratio(path: &Path, skipped: usize, total: usize) -> Result<(), SubsetError> {
    if skipped == 0 {
        return Ok(());
    }
    if skipped as f64 / total as f64 > MAX_SKIP_RATIO {
        return Err(SubsetError::CorruptInput {
            file: path.to_path_buf(),
            skipped,
            total,
        });
    }
    warn!(file = %path.display(), skipped, total, "skipped malformed rows");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const CONCEPT_HEADER: &str = "id\teffectiveTime\tactive\tmoduleId\tdefinitionStatusId";

    fn write_file(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        path
    }

    #[test]
    fn reduction_keeps_the_latest_effective_time() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            dir.path(),
            "sct2_Concept_Full_INT_20250101.txt",
            &[
                CONCEPT_HEADER,
                "100\t20250101\t1\t900000000000207008\t900000000000074008",
                "100\t20240101\t0\t900000000000207008\t900000000000074008",
            ],
        );

        let concepts = parse_concepts(&path).unwrap();
        assert_eq!(concepts.len(), 1);
        let row = &concepts[&100];
        assert_eq!(row.effective_time, "20250101");
        assert!(row.active, "later history row should win regardless of file order");
    }

    #[test]
    fn reduction_tie_prefers_the_later_row_in_file_order() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            dir.path(),
            "sct2_Concept_Full_INT_20250101.txt",
            &[
                CONCEPT_HEADER,
                "100\t20250101\t1\t900000000000207008\t900000000000074008",
                "100\t20250101\t0\t900000000000207008\t900000000000074008",
            ],
        );

        let concepts = parse_concepts(&path).unwrap();
        assert!(!concepts[&100].active);
    }

    #[test]
    fn malformed_rows_below_threshold_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut lines = vec![CONCEPT_HEADER.to_string()];
        for id in 0..200 {
            lines.push(format!(
                "{id}\t20250101\t1\t900000000000207008\t900000000000074008"
            ));
        }
        lines.push("not-a-number\t20250101\t1\t900000000000207008".to_string());
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let path = write_file(dir.path(), "sct2_Concept_Full_INT_20250101.txt", &refs);

        let concepts = parse_concepts(&path).unwrap();
        assert_eq!(concepts.len(), 200);
    }

    #[test]
    fn corrupt_file_aborts_the_parse() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            dir.path(),
            "sct2_Concept_Full_INT_20250101.txt",
            &[
                CONCEPT_HEADER,
                "100\t20250101\t1\t900000000000207008\t900000000000074008",
                "garbage line without tabs",
            ],
        );

        match parse_concepts(&path) {
            Err(SubsetError::CorruptInput { skipped, total, .. }) => {
                assert_eq!(skipped, 1);
                assert_eq!(total, 2);
            }
            other => panic!("expected CorruptInput, got {other:?}"),
        }
    }

    #[test]
    fn missing_required_column_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            dir.path(),
            "sct2_Concept_Full_INT_20250101.txt",
            &["id\teffectiveTime\tactive\tmoduleId", "100\t20250101\t1\t0"],
        );

        match parse_concepts(&path) {
            Err(SubsetError::MissingColumn { column, .. }) => {
                assert_eq!(column, "definitionStatusId");
            }
            other => panic!("expected MissingColumn, got {other:?}"),
        }
    }

    #[test]
    fn relationships_project_to_deduplicated_isa_edges() {
        let dir = TempDir::new().unwrap();
        let header = "id\teffectiveTime\tactive\tmoduleId\tsourceId\tdestinationId\trelationshipGroup\ttypeId\tcharacteristicTypeId\tmodifierId";
        let path = write_file(
            dir.path(),
            "sct2_Relationship_Full_INT_20250101.txt",
            &[
                header,
                // Active is-a edge.
                "1\t20250101\t1\t0\t200\t100\t0\t116680003\t0\t0",
                // Same edge under a different relationship id: deduplicated.
                "2\t20250101\t1\t0\t200\t100\t0\t116680003\t0\t0",
                // Non-is-a relationship type: dropped.
                "3\t20250101\t1\t0\t200\t100\t0\t363698007\t0\t0",
                // Inactive after reduction: dropped.
                "4\t20240101\t1\t0\t300\t200\t0\t116680003\t0\t0",
                "4\t20250101\t0\t0\t300\t200\t0\t116680003\t0\t0",
            ],
        );

        let edges = parse_relationships(&path).unwrap();
        assert_eq!(edges, vec![IsaEdge { child: 200, parent: 100 }]);
    }

    #[test]
    fn locate_prefers_language_tagged_and_newest_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write_file(root, "Terminology/sct2_Concept_Full_INT_20240101.txt", &[CONCEPT_HEADER]);
        write_file(root, "Terminology/sct2_Concept_Full_INT_20250101.txt", &[CONCEPT_HEADER]);
        write_file(root, "Terminology/sct2_Description_Full-en_INT_20250101.txt", &["id"]);
        write_file(root, "Terminology/sct2_Description_Full-es_INT_20250101.txt", &["id"]);
        write_file(root, "Terminology/sct2_Relationship_Full_INT_20250101.txt", &["id"]);
        write_file(root, "Terminology/sct2_StatedRelationship_Full_INT_20250101.txt", &["id"]);
        write_file(root, "Refset/der2_cRefset_LanguageFull-en_INT_20250101.txt", &["id"]);

        let files = ReleaseFiles::locate(root, "en").unwrap();
        assert!(files.concepts.ends_with("sct2_Concept_Full_INT_20250101.txt"));
        assert!(files.descriptions.ends_with("sct2_Description_Full-en_INT_20250101.txt"));
        assert!(files.relationships.ends_with("sct2_Relationship_Full_INT_20250101.txt"));
        assert!(files.language_refset.ends_with("der2_cRefset_LanguageFull-en_INT_20250101.txt"));
    }

    #[test]
    fn locate_reports_the_missing_component() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "sct2_Concept_Full_INT_20250101.txt", &[CONCEPT_HEADER]);

        match ReleaseFiles::locate(dir.path(), "en") {
            Err(SubsetError::ReleaseFileNotFound { pattern, .. }) => {
                assert_eq!(pattern, "sct2_Description_*.txt");
            }
            other => panic!("expected ReleaseFileNotFound, got {other:?}"),
        }
    }

    #[test]
    fn release_id_is_inferred_from_the_folder_name() {
        assert_eq!(
            infer_release_id(Path::new("/tmp/SnomedCT_InternationalRF2_PRODUCTION_20250301T120000Z")),
            Some("20250301".to_string())
        );
        assert_eq!(infer_release_id(Path::new("/tmp/no-date-here")), None);
    }
}
