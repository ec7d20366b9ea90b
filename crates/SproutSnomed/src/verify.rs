//! Post-build verification.
//!
//! An independent re-open of the finished artifact, deliberately ignorant of
//! the writer's in-memory state: if the file on disk is not a database the
//! consuming application could ship, the build must not report success.

use std::path::Path;

use rusqlite::{Connection, OpenFlags, params};
use tracing::info;

use crate::SubsetError;

/// Tables the consuming application requires.
pub const REQUIRED_TABLES: [&str; 6] = [
    "meta",
    "concept",
    "description",
    "langrefset",
    "isa_edge",
    "feature_snomed_map",
];

/// Row counts of the verified artifact.
#[derive(Debug, Clone, Copy)]
pub struct VerifyReport {
    pub concepts: i64,
    pub descriptions: i64,
    pub isa_edges: i64,
    pub feature_map_rows: i64,
}

/// Re-open the artifact read-only and assert its structural invariants:
/// `PRAGMA integrity_check` passes, all required tables exist, and the
/// feature map table is non-empty when a feature map was supplied.
pub fn verify_artifact(path: &Path, expect_feature_map: bool) -> Result<VerifyReport, SubsetError> {
    if !path.is_file() {
        return Err(SubsetError::Verification(format!(
            "artifact not found at {}",
            path.display()
        )));
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    if verdict != "ok" {
        return Err(SubsetError::Verification(format!(
            "integrity check failed: {verdict}"
        )));
    }

    for table in REQUIRED_TABLES {
        let present: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        if present == 0 {
            return Err(SubsetError::Verification(format!(
                "required table missing: {table}"
            )));
        }
    }

    let report = VerifyReport {
        concepts: count_rows(&conn, "concept")?,
        descriptions: count_rows(&conn, "description")?,
        isa_edges: count_rows(&conn, "isa_edge")?,
        feature_map_rows: count_rows(&conn, "feature_snomed_map")?,
    };

    if expect_feature_map && report.feature_map_rows == 0 {
        return Err(SubsetError::Verification(
            "feature_snomed_map is empty but a feature map was supplied".to_string(),
        ));
    }

    info!(
        concepts = report.concepts,
        descriptions = report.descriptions,
        isa_edges = report.isa_edges,
        feature_map_rows = report.feature_map_rows,
        "post-build verification passed"
    );
    Ok(report)
}

fn count_rows(conn: &Connection, table: &str) -> Result<i64, SubsetError> {
    let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}
