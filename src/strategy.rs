//! The closed family of matching strategies.
//!
//! Strategies are selected by name from configuration and run in the
//! configured order. Each one sees the full catalogs plus the immutable set of
//! track ids resolved before it, and reports what it resolved. Nothing here
//! touches the store.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::config::MatchConfig;
use crate::duration_filter::{self, DurationGate};
use crate::exact;
use crate::fuzzy;
use crate::models::{Candidate, LibraryFile, NearMiss, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    SqlExact,
    DurationFilter,
    Fuzzy,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::SqlExact,
        StrategyKind::DurationFilter,
        StrategyKind::Fuzzy,
    ];

    /// Configuration name, also stored as the match method
    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::SqlExact => "sql_exact",
            StrategyKind::DurationFilter => "duration_filter",
            StrategyKind::Fuzzy => "fuzzy",
        }
    }

    pub fn run(self, input: &StrategyInput<'_>) -> Result<StrategyOutcome, StrategyFailure> {
        match self {
            StrategyKind::SqlExact => exact::run(input),
            StrategyKind::DurationFilter => duration_filter::run(input),
            StrategyKind::Fuzzy => fuzzy::run(input),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = StrategyKind::ALL.iter().map(|k| k.name()).collect();
                format!("unknown strategy '{}' (known: {})", s, known.join(", "))
            })
    }
}

/// Everything a strategy may read.
pub struct StrategyInput<'a> {
    pub tracks: &'a [Track],
    pub files: &'a [LibraryFile],
    pub already_matched: &'a FxHashSet<String>,
    pub config: &'a MatchConfig,
    /// Pruning gate left by an earlier `duration_filter`, if one ran
    pub gate: Option<&'a DurationGate>,
}

/// What a strategy hands back to the orchestrator.
#[derive(Debug, Default)]
pub struct StrategyOutcome {
    pub matches: Vec<Candidate>,
    /// Track ids covered by `matches`
    pub matched: FxHashSet<String>,
    pub gate: Option<DurationGate>,
    /// Best below-threshold candidate per track, for unmatched reporting
    pub near_misses: FxHashMap<String, NearMiss>,
    /// Entities skipped because they lacked data this strategy needs
    pub warnings: usize,
}

impl StrategyOutcome {
    pub fn push(&mut self, candidate: Candidate) {
        self.matched.insert(candidate.track_id.clone());
        self.matches.push(candidate);
    }
}

/// A strategy could not complete.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}")]
pub struct StrategyFailure {
    /// Tracks resolved before the failure
    pub resolved: usize,
    pub reason: String,
}

impl StrategyFailure {
    pub fn new(resolved: usize, reason: impl Into<String>) -> Self {
        Self {
            resolved,
            reason: reason.into(),
        }
    }
}

/// Reject snapshots with repeated track or file ids.
pub fn check_unique_ids(tracks: &[Track], files: &[LibraryFile]) -> Result<(), StrategyFailure> {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for track in tracks {
        if !seen.insert(track.id.as_str()) {
            return Err(StrategyFailure::new(0, format!("duplicate track id '{}'", track.id)));
        }
    }
    seen.clear();
    for file in files {
        if !seen.insert(file.id.as_str()) {
            return Err(StrategyFailure::new(0, format!("duplicate file id '{}'", file.id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.name().parse::<StrategyKind>().unwrap(), kind);
        }
        let err = "exact".parse::<StrategyKind>().unwrap_err();
        assert!(err.contains("unknown strategy 'exact'"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let tracks = vec![
            Track::new("p", "t1", "A", "B"),
            Track::new("p", "t1", "C", "D"),
        ];
        let err = check_unique_ids(&tracks, &[]).unwrap_err();
        assert!(err.reason.contains("t1"));

        let files = vec![
            LibraryFile::new("f1", "/a", "A", "B"),
            LibraryFile::new("f1", "/b", "A", "B"),
        ];
        assert!(check_unique_ids(&tracks[..1], &files).is_err());
    }
}
