//! Guards against clobbering the match database with report output.
//!
//! `run --stats-json` and `report --output` write files chosen on the command
//! line. These checks reject paths that could be a SQLite store.

use anyhow::{bail, Result};
use std::path::Path;

const DATABASE_EXTENSIONS: [&str; 4] = ["db", "sqlite", "sqlite3", "db3"];

/// Validates that a JSON report path is safe to overwrite.
///
/// Checks:
/// - Output must have a `.json` extension
/// - Output cannot be the match database itself
/// - Output cannot carry a database extension (e.g. `matches.db.json` is fine, `matches.db` is not)
pub fn validate_report_path(output: &Path, database: &Path) -> Result<()> {
    let extension = output
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    if DATABASE_EXTENSIONS.contains(&extension.as_str()) {
        bail!(
            "Safety check failed: report '{}' looks like a database file",
            output.display()
        );
    }

    if extension != "json" {
        bail!(
            "Safety check failed: report '{}' must have a .json extension",
            output.display()
        );
    }

    if output == database || same_file(output, database) {
        bail!(
            "Safety check failed: report '{}' cannot be the same as database '{}'",
            output.display(),
            database.display()
        );
    }

    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_valid_report() {
        let output = PathBuf::from("/tmp/run-stats.json");
        let db = PathBuf::from("/data/trackmatch.db");
        assert!(validate_report_path(&output, &db).is_ok());
    }

    #[test]
    fn test_missing_json_extension() {
        let output = PathBuf::from("/tmp/run-stats.txt");
        let db = PathBuf::from("/data/trackmatch.db");
        let err = validate_report_path(&output, &db).unwrap_err();
        assert!(err.to_string().contains("must have a .json extension"));
    }

    #[test]
    fn test_database_extension_blocked() {
        let db = PathBuf::from("/data/trackmatch.db");
        for name in ["/tmp/out.db", "/tmp/out.sqlite3", "/tmp/out.SQLITE"] {
            let err = validate_report_path(Path::new(name), &db).unwrap_err();
            assert!(err.to_string().contains("looks like a database"));
        }
    }

    #[test]
    fn test_output_equals_database() {
        let path = PathBuf::from("/data/odd-name.json");
        let err = validate_report_path(&path, &path).unwrap_err();
        assert!(err.to_string().contains("cannot be the same as database"));
    }

    #[test]
    fn test_same_file_through_different_spelling() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("store.json");
        std::fs::write(&db, b"").unwrap();
        let dotted = dir.path().join(".").join("store.json");
        assert!(validate_report_path(&dotted, &db).is_err());
    }
}
