//! SQLite artifact writing.
//!
//! The output is a single-file database meant to be copied around and opened
//! read-only by the consuming application, so the writer is strict about two
//! things: no stale artifact survives the start of a build, and no partial
//! artifact survives a failed one. The database is assembled at a temporary
//! sibling path and renamed over the final path only after a successful
//! finalize; an RAII guard deletes the temporary file on every other exit.
//!
//! PRAGMA policy, encoded as two result kinds: setup pragmas are best-effort
//! (a failure is logged and the build continues), structural statements
//! (DDL, inserts, commits, the final rename) are fatal.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use tracing::{info, warn};

use crate::SubsetError;
use crate::models::{ConceptRow, DescriptionRow, FeatureMapRow, IsaEdge, LangRefsetRow};

/// The canonical output DDL, also shipped as `sql/snomed_subset_schema.sql`.
pub const SNOMED_SUBSET_SCHEMA: &str = include_str!("../sql/snomed_subset_schema.sql");

/// Deletes the temporary artifact unless the writer finalized successfully.
struct TmpArtifact {
    path: PathBuf,
    keep: bool,
}

impl Drop for TmpArtifact {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Writes one subset database.
pub struct SubsetWriter {
    conn: Connection,
    tmp: TmpArtifact,
    out_path: PathBuf,
}

impl SubsetWriter {
    /// Remove any prior artifact (and its `-wal`/`-shm`/`-journal` sidecars)
    /// and open a fresh database at a temporary sibling path.
    pub fn create(out_path: &Path) -> Result<Self, SubsetError> {
        remove_artifact(out_path)?;

        let tmp_path = sibling_path(out_path, ".building");
        remove_artifact(&tmp_path)?;

        let conn = Connection::open(&tmp_path)?;
        for (pragma, value) in [
            ("foreign_keys", "ON"),
            ("journal_mode", "DELETE"),
            ("synchronous", "NORMAL"),
        ] {
            if let Err(err) = conn.pragma_update(None, pragma, value) {
                warn!(pragma, %err, "setup PRAGMA failed, continuing");
            }
        }

        Ok(Self {
            conn,
            tmp: TmpArtifact {
                path: tmp_path,
                keep: false,
            },
            out_path: out_path.to_path_buf(),
        })
    }

    /// Execute the schema DDL.
    pub fn init_schema(&self, schema_sql: &str) -> Result<(), SubsetError> {
        self.conn.execute_batch(schema_sql)?;
        Ok(())
    }

    pub fn insert_concepts(&mut self, rows: &[ConceptRow]) -> Result<(), SubsetError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO concept
                   (concept_id, active, effective_time, module_id, definition_status_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.concept_id,
                    row.active,
                    row.effective_time,
                    row.module_id,
                    row.definition_status_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_descriptions(&mut self, rows: &[DescriptionRow]) -> Result<(), SubsetError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO description
                   (description_id, concept_id, active, effective_time, module_id,
                    language_code, type_id, term, case_significance_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.description_id,
                    row.concept_id,
                    row.active,
                    row.effective_time,
                    row.module_id,
                    row.language_code,
                    row.type_id,
                    row.term,
                    row.case_significance_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_language_refset(&mut self, rows: &[LangRefsetRow]) -> Result<(), SubsetError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO langrefset
                   (langrefset_id, active, effective_time, module_id,
                    refset_id, referenced_component_id, acceptability_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.langrefset_id,
                    row.active,
                    row.effective_time,
                    row.module_id,
                    row.refset_id,
                    row.referenced_component_id,
                    row.acceptability_id,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_isa_edges(&mut self, edges: &[IsaEdge]) -> Result<(), SubsetError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO isa_edge (child_concept_id, parent_concept_id)
                 VALUES (?1, ?2)",
            )?;
            for edge in edges {
                stmt.execute(params![edge.child, edge.parent])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_feature_map(
        &mut self,
        rows: &[FeatureMapRow],
        updated_at: &str,
    ) -> Result<(), SubsetError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO feature_snomed_map
                   (feature_key, concept_id, active, note, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.feature_key,
                    row.concept_id,
                    row.active,
                    row.note,
                    updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn write_meta(&mut self, meta: &BTreeMap<String, String>) -> Result<(), SubsetError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)")?;
            for (key, value) in meta {
                stmt.execute(params![key, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Finalize the artifact and move it to its final path.
    ///
    /// Checkpoints any WAL and forces `journal_mode=DELETE` so the shipped
    /// file never needs `-wal`/`-shm` sidecars at runtime (both best-effort),
    /// closes the connection, and atomically renames the temporary file over
    /// the output path.
    pub fn finalize(self) -> Result<PathBuf, SubsetError> {
        let SubsetWriter {
            conn,
            mut tmp,
            out_path,
        } = self;

        if let Err(err) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
            warn!(%err, "WAL checkpoint failed, continuing");
        }
        if let Err(err) = conn.pragma_update(None, "journal_mode", "DELETE") {
            warn!(%err, "journal_mode reset failed, continuing");
        }
        conn.close().map_err(|(_, err)| SubsetError::Sqlite(err))?;

        fs::rename(&tmp.path, &out_path)?;
        tmp.keep = true;
        info!(path = %out_path.display(), "subset database written");
        Ok(out_path)
    }
}

/// Remove a database file and its SQLite sidecars if present.
fn remove_artifact(path: &Path) -> Result<(), SubsetError> {
    remove_if_present(path)?;
    for suffix in ["-wal", "-shm", "-journal"] {
        remove_if_present(&sibling_path(path, suffix))?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), SubsetError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// `path` with `suffix` appended to the full file name (`db.sqlite` →
/// `db.sqlite-wal`), as SQLite names its sidecars.
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
