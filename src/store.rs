//! SQLite-backed candidate store.
//!
//! Holds the two catalog snapshots (tracks per provider, library files) and
//! the committed match state. Matching reads snapshots through `load_*` and
//! writes results only through [`Store::commit_run`], which replaces a run's
//! output in a single IMMEDIATE transaction.

use std::path::Path;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::error::{MatchError, Result};
use crate::models::{Confidence, Evidence, LibraryFile, Match, RunMode, Track, UnmatchedTrack};

/// Maximum bound parameters per IN-list statement
pub const PARAM_CHUNK: usize = 500;

/// Rows per transaction when importing snapshots
const WRITE_BATCH_SIZE: usize = 10_000;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tracks (
        provider TEXT NOT NULL,
        id TEXT NOT NULL,
        title TEXT NOT NULL,
        artist TEXT NOT NULL,
        album TEXT,
        year INTEGER,
        duration_ms INTEGER,
        isrc TEXT,
        normalized TEXT NOT NULL,
        PRIMARY KEY (provider, id)
    );
    CREATE INDEX IF NOT EXISTS idx_tracks_normalized ON tracks(provider, normalized);

    CREATE TABLE IF NOT EXISTS library_files (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        artist TEXT,
        title TEXT,
        album TEXT,
        year INTEGER,
        duration_ms INTEGER,
        bitrate INTEGER,
        isrc TEXT,
        normalized TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        modified_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_files_normalized ON library_files(normalized);

    CREATE TABLE IF NOT EXISTS matches (
        provider TEXT NOT NULL,
        track_id TEXT NOT NULL,
        file_id TEXT NOT NULL,
        score REAL NOT NULL,
        confidence TEXT NOT NULL,
        method TEXT NOT NULL,
        evidence TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (provider, track_id)
    );
    CREATE INDEX IF NOT EXISTS idx_matches_file ON matches(file_id);

    CREATE TABLE IF NOT EXISTS unmatched_tracks (
        provider TEXT NOT NULL,
        track_id TEXT NOT NULL,
        best_score REAL,
        best_file_id TEXT,
        recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
        PRIMARY KEY (provider, track_id)
    );
";

// ============================================================================
// Column conversions
// ============================================================================

impl ToSql for Confidence {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Confidence {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for Evidence {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Evidence {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        provider: row.get(0)?,
        id: row.get(1)?,
        title: row.get(2)?,
        artist: row.get(3)?,
        album: row.get(4)?,
        year: row.get(5)?,
        duration_ms: row.get(6)?,
        isrc: row.get(7)?,
        normalized: row.get(8)?,
    })
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<LibraryFile> {
    Ok(LibraryFile {
        id: row.get(0)?,
        path: row.get(1)?,
        artist: row.get(2)?,
        title: row.get(3)?,
        album: row.get(4)?,
        year: row.get(5)?,
        duration_ms: row.get(6)?,
        bitrate: row.get(7)?,
        isrc: row.get(8)?,
        normalized: row.get(9)?,
        size_bytes: row.get(10)?,
        modified_at: row.get(11)?,
    })
}

fn match_from_row(row: &Row<'_>) -> rusqlite::Result<Match> {
    Ok(Match {
        provider: row.get(0)?,
        track_id: row.get(1)?,
        file_id: row.get(2)?,
        score: row.get(3)?,
        confidence: row.get(4)?,
        method: row.get(5)?,
        evidence: row.get(6)?,
        created_at: row.get(7)?,
    })
}

const MATCH_COLUMNS: &str = "provider, track_id, file_id, score, confidence, method, evidence, created_at";

/// "?2, ?3, ..." for an IN-list whose first placeholder is `?{first}`
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Store
// ============================================================================

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(MatchError::Storage)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;",
        )
        .map_err(MatchError::Storage)?;
        debug!(target: "store", path = %path.display(), "opened store");
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(MatchError::Storage)?;
        Ok(Self { conn })
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA).map_err(MatchError::Storage)?;
        self.add_evidence_column().map_err(MatchError::Storage)
    }

    /// Stores created before evidence was recorded get the column, backfilled
    /// from the tier and method each row was committed with.
    fn add_evidence_column(&self) -> rusqlite::Result<()> {
        let present: bool = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('matches') WHERE name = 'evidence'",
            [],
            |row| row.get(0),
        )?;
        if present {
            return Ok(());
        }
        self.conn.execute_batch(
            "ALTER TABLE matches ADD COLUMN evidence TEXT NOT NULL DEFAULT 'similarity';
             UPDATE matches SET evidence = 'external_id' WHERE confidence = 'CERTAIN';
             UPDATE matches SET evidence = 'normalized_key'
                 WHERE method = 'sql_exact' AND confidence <> 'CERTAIN';",
        )?;
        info!(target: "store", "added evidence column to matches");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Snapshot import
    // ------------------------------------------------------------------------

    /// Insert or replace track snapshots. Missing normalized keys are computed.
    pub fn upsert_tracks(&mut self, tracks: &[Track]) -> Result<usize> {
        self.write_tracks(tracks).map_err(MatchError::Persistence)
    }

    fn write_tracks(&mut self, tracks: &[Track]) -> rusqlite::Result<usize> {
        for chunk in tracks.chunks(WRITE_BATCH_SIZE) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO tracks
                     (provider, id, title, artist, album, year, duration_ms, isrc, normalized)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for track in chunk {
                    let mut track = track.clone();
                    track.ensure_normalized();
                    stmt.execute(params![
                        track.provider,
                        track.id,
                        track.title,
                        track.artist,
                        track.album,
                        track.year,
                        track.duration_ms,
                        track.isrc,
                        track.normalized,
                    ])?;
                }
            }
            tx.commit()?;
        }
        info!(target: "store", tracks = tracks.len(), "imported tracks");
        Ok(tracks.len())
    }

    /// Insert or replace library file snapshots. Missing normalized keys are computed.
    pub fn upsert_files(&mut self, files: &[LibraryFile]) -> Result<usize> {
        self.write_files(files).map_err(MatchError::Persistence)
    }

    fn write_files(&mut self, files: &[LibraryFile]) -> rusqlite::Result<usize> {
        for chunk in files.chunks(WRITE_BATCH_SIZE) {
            let tx = self.conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO library_files
                     (id, path, artist, title, album, year, duration_ms, bitrate, isrc,
                      normalized, size_bytes, modified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                )?;
                for file in chunk {
                    let mut file = file.clone();
                    file.ensure_normalized();
                    stmt.execute(params![
                        file.id,
                        file.path,
                        file.artist,
                        file.title,
                        file.album,
                        file.year,
                        file.duration_ms,
                        file.bitrate,
                        file.isrc,
                        file.normalized,
                        file.size_bytes,
                        file.modified_at,
                    ])?;
                }
            }
            tx.commit()?;
        }
        info!(target: "store", files = files.len(), "imported library files");
        Ok(files.len())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// All tracks for `provider`, ordered by id.
    pub fn load_tracks(&self, provider: &str) -> Result<Vec<Track>> {
        self.query_tracks(provider).map_err(MatchError::Storage)
    }

    fn query_tracks(&self, provider: &str) -> rusqlite::Result<Vec<Track>> {
        let mut stmt = self.conn.prepare(
            "SELECT provider, id, title, artist, album, year, duration_ms, isrc, normalized
             FROM tracks WHERE provider = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([provider], track_from_row)?;
        rows.collect()
    }

    /// All library files, ordered by id.
    pub fn load_files(&self) -> Result<Vec<LibraryFile>> {
        self.query_files().map_err(MatchError::Storage)
    }

    fn query_files(&self) -> rusqlite::Result<Vec<LibraryFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, path, artist, title, album, year, duration_ms, bitrate, isrc,
                    normalized, size_bytes, modified_at
             FROM library_files ORDER BY id",
        )?;
        let rows = stmt.query_map([], file_from_row)?;
        rows.collect()
    }

    /// Track ids with a committed match for `provider`.
    pub fn matched_track_ids(&self, provider: &str) -> Result<FxHashSet<String>> {
        let query = || -> rusqlite::Result<FxHashSet<String>> {
            let mut stmt = self
                .conn
                .prepare("SELECT track_id FROM matches WHERE provider = ?1")?;
            let rows = stmt.query_map([provider], |row| row.get(0))?;
            rows.collect()
        };
        query().map_err(MatchError::Storage)
    }

    /// Committed matches for the given track ids, queried in chunks of
    /// [`PARAM_CHUNK`] ids. Ordered by track id.
    pub fn matches_for_tracks(&self, provider: &str, track_ids: &[String]) -> Result<Vec<Match>> {
        self.query_matches_for(provider, track_ids)
            .map_err(MatchError::Storage)
    }

    fn query_matches_for(&self, provider: &str, track_ids: &[String]) -> rusqlite::Result<Vec<Match>> {
        let mut out = Vec::new();
        for chunk in track_ids.chunks(PARAM_CHUNK) {
            let sql = format!(
                "SELECT {} FROM matches WHERE provider = ?1 AND track_id IN ({})",
                MATCH_COLUMNS,
                placeholders(2, chunk.len())
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 1);
            bound.push(&provider);
            bound.extend(chunk.iter().map(|id| id as &dyn ToSql));
            let rows = stmt.query_map(bound.as_slice(), match_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        out.sort_by(|a, b| a.track_id.cmp(&b.track_id));
        Ok(out)
    }

    /// All committed matches for `provider`, ordered by track id.
    pub fn load_matches(&self, provider: &str) -> Result<Vec<Match>> {
        let query = || -> rusqlite::Result<Vec<Match>> {
            let sql = format!(
                "SELECT {} FROM matches WHERE provider = ?1 ORDER BY track_id",
                MATCH_COLUMNS
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt.query_map([provider], match_from_row)?;
            rows.collect()
        };
        query().map_err(MatchError::Storage)
    }

    /// Tracks recorded as unmatched by the latest run, ordered by track id.
    pub fn load_unmatched(&self, provider: &str) -> Result<Vec<UnmatchedTrack>> {
        let query = || -> rusqlite::Result<Vec<UnmatchedTrack>> {
            let mut stmt = self.conn.prepare(
                "SELECT provider, track_id, best_score, best_file_id
                 FROM unmatched_tracks WHERE provider = ?1 ORDER BY track_id",
            )?;
            let rows = stmt.query_map([provider], |row| {
                Ok(UnmatchedTrack {
                    provider: row.get(0)?,
                    track_id: row.get(1)?,
                    best_score: row.get(2)?,
                    best_file_id: row.get(3)?,
                })
            })?;
            rows.collect()
        };
        query().map_err(MatchError::Storage)
    }

    // ------------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------------

    /// Persist one run's output atomically.
    ///
    /// Full mode supersedes every prior match and unmatched row for the
    /// provider. Incremental mode keeps prior matches, clears stale unmatched
    /// rows for newly matched tracks and replaces the rest. The write lock is
    /// taken up front so no other run can interleave its commit.
    pub fn commit_run(
        &mut self,
        provider: &str,
        mode: RunMode,
        matches: &[Match],
        unmatched: &[UnmatchedTrack],
    ) -> Result<()> {
        self.write_run(provider, mode, matches, unmatched)
            .map_err(MatchError::Persistence)?;
        info!(
            target: "store",
            provider,
            mode = mode.as_str(),
            matches = matches.len(),
            unmatched = unmatched.len(),
            "committed run"
        );
        Ok(())
    }

    fn write_run(
        &mut self,
        provider: &str,
        mode: RunMode,
        matches: &[Match],
        unmatched: &[UnmatchedTrack],
    ) -> rusqlite::Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        match mode {
            RunMode::Full => {
                tx.execute("DELETE FROM matches WHERE provider = ?1", [provider])?;
                tx.execute("DELETE FROM unmatched_tracks WHERE provider = ?1", [provider])?;
            }
            RunMode::Incremental => {
                let ids: Vec<&String> = matches.iter().map(|m| &m.track_id).collect();
                for chunk in ids.chunks(PARAM_CHUNK) {
                    let sql = format!(
                        "DELETE FROM unmatched_tracks WHERE provider = ?1 AND track_id IN ({})",
                        placeholders(2, chunk.len())
                    );
                    let mut bound: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 1);
                    bound.push(&provider);
                    bound.extend(chunk.iter().map(|id| *id as &dyn ToSql));
                    tx.execute(&sql, bound.as_slice())?;
                }
            }
        }

        {
            // Plain INSERT: the primary key rejects a second match per track
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT INTO matches ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                MATCH_COLUMNS
            ))?;
            for m in matches {
                stmt.execute(params![
                    m.provider,
                    m.track_id,
                    m.file_id,
                    m.score,
                    m.confidence,
                    m.method,
                    m.evidence,
                    m.created_at,
                ])?;
            }

            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO unmatched_tracks (provider, track_id, best_score, best_file_id)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for u in unmatched {
                stmt.execute(params![u.provider, u.track_id, u.best_score, u.best_file_id])?;
            }
        }

        tx.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        let store = Store::open_in_memory().unwrap();
        store.init_schema().unwrap();
        store
    }

    fn m(track_id: &str, file_id: &str) -> Match {
        Match {
            provider: "spotify".to_string(),
            track_id: track_id.to_string(),
            file_id: file_id.to_string(),
            score: 1.0,
            confidence: Confidence::High,
            method: "sql_exact".to_string(),
            evidence: Evidence::NormalizedKey,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn u(track_id: &str) -> UnmatchedTrack {
        UnmatchedTrack {
            provider: "spotify".to_string(),
            track_id: track_id.to_string(),
            best_score: Some(0.5),
            best_file_id: Some("f9".to_string()),
        }
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut store = store();
        let mut track = Track::new("spotify", "t1", "Daft Punk", "One More Time")
            .with_duration_ms(320_000)
            .with_isrc("GBDUW0000053");
        track.normalized.clear();
        store.upsert_tracks(&[track, Track::new("other", "t2", "A", "B")]).unwrap();
        store
            .upsert_files(&[LibraryFile::new("f1", "/a.flac", "Daft Punk", "One More Time")])
            .unwrap();

        let tracks = store.load_tracks("spotify").unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].normalized, "daft punk one more time");
        assert_eq!(tracks[0].isrc.as_deref(), Some("GBDUW0000053"));
        assert_eq!(store.load_files().unwrap()[0].id, "f1");
    }

    #[test]
    fn test_full_commit_supersedes() {
        let mut store = store();
        store
            .commit_run("spotify", RunMode::Full, &[m("t1", "f1"), m("t2", "f2")], &[u("t3")])
            .unwrap();
        store
            .commit_run("spotify", RunMode::Full, &[m("t3", "f3")], &[])
            .unwrap();

        let matches = store.load_matches("spotify").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].track_id, "t3");
        assert_eq!(matches[0].confidence, Confidence::High);
        assert!(store.load_unmatched("spotify").unwrap().is_empty());
    }

    #[test]
    fn test_incremental_commit_keeps_prior_and_clears_stale_unmatched() {
        let mut store = store();
        store
            .commit_run("spotify", RunMode::Full, &[m("t1", "f1")], &[u("t2"), u("t3")])
            .unwrap();
        store
            .commit_run("spotify", RunMode::Incremental, &[m("t2", "f2")], &[u("t3")])
            .unwrap();

        let ids: Vec<String> = store
            .load_matches("spotify")
            .unwrap()
            .into_iter()
            .map(|m| m.track_id)
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
        let unmatched = store.load_unmatched("spotify").unwrap();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].track_id, "t3");
    }

    #[test]
    fn test_failed_commit_leaves_prior_state() {
        let mut store = store();
        store
            .commit_run("spotify", RunMode::Full, &[m("t1", "f1")], &[])
            .unwrap();

        // Duplicate track id violates the primary key mid-transaction
        let err = store
            .commit_run("spotify", RunMode::Full, &[m("t2", "f2"), m("t2", "f3")], &[])
            .unwrap_err();
        assert!(matches!(err, MatchError::Persistence(_)));

        let matches = store.load_matches("spotify").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].track_id, "t1");
    }

    #[test]
    fn test_matches_for_tracks_chunks_large_id_lists() {
        let mut store = store();
        let matches: Vec<Match> = (0..1200).map(|i| m(&format!("t{:05}", i), "f1")).collect();
        store
            .commit_run("spotify", RunMode::Full, &matches, &[])
            .unwrap();

        let mut wanted: Vec<String> = (0..1200).step_by(2).map(|i| format!("t{:05}", i)).collect();
        wanted.push("missing".to_string());
        let found = store.matches_for_tracks("spotify", &wanted).unwrap();
        assert_eq!(found.len(), 600);
        assert_eq!(found[0].track_id, "t00000");
        assert_eq!(store.matched_track_ids("spotify").unwrap().len(), 1200);
    }

    #[test]
    fn test_incremental_chunked_unmatched_cleanup() {
        let mut store = store();
        let unmatched: Vec<UnmatchedTrack> = (0..1100).map(|i| u(&format!("t{}", i))).collect();
        store
            .commit_run("spotify", RunMode::Full, &[], &unmatched)
            .unwrap();

        let matches: Vec<Match> = (0..1100).map(|i| m(&format!("t{}", i), "f1")).collect();
        store
            .commit_run("spotify", RunMode::Incremental, &matches, &[])
            .unwrap();
        assert!(store.load_unmatched("spotify").unwrap().is_empty());
    }

    #[test]
    fn test_evidence_round_trips_and_reclassifies() {
        let mut store = store();
        let certain = Match {
            confidence: Confidence::Certain,
            evidence: Evidence::ExternalId,
            ..m("t1", "f1")
        };
        let fuzzy = Match {
            score: 0.8,
            confidence: Confidence::Moderate,
            method: "fuzzy".to_string(),
            evidence: Evidence::Similarity,
            ..m("t2", "f2")
        };
        store
            .commit_run("spotify", RunMode::Full, &[certain.clone(), fuzzy.clone()], &[])
            .unwrap();

        let loaded = store.load_matches("spotify").unwrap();
        assert_eq!(loaded, vec![certain, fuzzy]);
        for stored in &loaded {
            assert_eq!(crate::confidence::classify(stored.score, stored.evidence), stored.confidence);
        }
    }

    #[test]
    fn test_init_schema_backfills_evidence_on_old_stores() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .execute_batch(
                "CREATE TABLE matches (
                    provider TEXT NOT NULL,
                    track_id TEXT NOT NULL,
                    file_id TEXT NOT NULL,
                    score REAL NOT NULL,
                    confidence TEXT NOT NULL,
                    method TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (provider, track_id)
                );
                INSERT INTO matches VALUES
                    ('spotify', 't1', 'f1', 1.0, 'CERTAIN', 'sql_exact', '2024-01-01T00:00:00Z'),
                    ('spotify', 't2', 'f2', 1.0, 'HIGH', 'sql_exact', '2024-01-01T00:00:00Z'),
                    ('spotify', 't3', 'f3', 0.8, 'MODERATE', 'fuzzy', '2024-01-01T00:00:00Z');",
            )
            .unwrap();
        store.init_schema().unwrap();
        // Second call finds the column and leaves it alone
        store.init_schema().unwrap();

        let evidence: Vec<Evidence> = store
            .load_matches("spotify")
            .unwrap()
            .into_iter()
            .map(|m| m.evidence)
            .collect();
        assert_eq!(
            evidence,
            vec![Evidence::ExternalId, Evidence::NormalizedKey, Evidence::Similarity]
        );
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(2, 3), "?2, ?3, ?4");
    }
}
