//! Exact strategy: equi-join on normalized keys.
//!
//! Builds a key → files hash index once and probes it per track, so the cost
//! is linear in catalog size. Empty keys are never indexed or probed.

use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::models::{Candidate, Evidence, LibraryFile, Track};
use crate::scoring::duration_delta_ms;
use crate::strategy::{check_unique_ids, StrategyFailure, StrategyInput, StrategyKind, StrategyOutcome};

/// Index mapping normalized key to positions in the file slice
pub type KeyIndex<'a> = FxHashMap<&'a str, Vec<usize>>;

/// Index files by normalized key. Returns the index and the number of files
/// skipped for having an empty key.
pub fn build_key_index(files: &[LibraryFile]) -> (KeyIndex<'_>, usize) {
    let mut index: KeyIndex<'_> = FxHashMap::default();
    let mut skipped = 0;
    for (i, file) in files.iter().enumerate() {
        if file.normalized.trim().is_empty() {
            skipped += 1;
            continue;
        }
        index.entry(file.normalized.as_str()).or_default().push(i);
    }
    (index, skipped)
}

fn same_isrc(track: &Track, file: &LibraryFile) -> bool {
    match (&track.isrc, &file.isrc) {
        (Some(a), Some(b)) => {
            let a = a.trim();
            !a.is_empty() && a.eq_ignore_ascii_case(b.trim())
        }
        _ => false,
    }
}

/// Pick one file among key-equal candidates. ISRC corroboration wins, then
/// the closest known duration, then the smallest file id.
pub fn select_exact<'a>(track: &Track, candidates: &[usize], files: &'a [LibraryFile]) -> Option<&'a LibraryFile> {
    let rank = |file: &LibraryFile| {
        let delta = duration_delta_ms(track, file);
        (!same_isrc(track, file), delta.is_none(), delta.unwrap_or(0))
    };
    candidates
        .iter()
        .map(|&i| &files[i])
        .min_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.id.cmp(&b.id)))
}

pub fn run(input: &StrategyInput<'_>) -> Result<StrategyOutcome, StrategyFailure> {
    check_unique_ids(input.tracks, input.files)?;

    let (index, skipped_files) = build_key_index(input.files);
    let mut outcome = StrategyOutcome {
        warnings: skipped_files,
        ..Default::default()
    };
    let mut skipped_tracks = 0;

    for track in input.tracks {
        if input.already_matched.contains(&track.id) {
            continue;
        }
        if track.normalized.trim().is_empty() {
            skipped_tracks += 1;
            continue;
        }
        let Some(candidates) = index.get(track.normalized.as_str()) else {
            continue;
        };
        let Some(file) = select_exact(track, candidates, input.files) else {
            continue;
        };

        let short = track.normalized.chars().count() < input.config.short_key_length;
        let evidence = if same_isrc(track, file) && !short {
            Evidence::ExternalId
        } else {
            Evidence::NormalizedKey
        };
        outcome.push(Candidate {
            track_id: track.id.clone(),
            file_id: file.id.clone(),
            score: 1.0,
            method: StrategyKind::SqlExact,
            evidence,
        });
    }

    if skipped_files + skipped_tracks > 0 {
        warn!(
            target: "strategy",
            strategy = "sql_exact",
            files = skipped_files,
            tracks = skipped_tracks,
            "skipped entries with empty normalized key"
        );
    }
    outcome.warnings += skipped_tracks;
    outcome.matches.sort_by(|a, b| a.track_id.cmp(&b.track_id));

    debug!(
        target: "strategy",
        strategy = "sql_exact",
        keys = index.len(),
        matched = outcome.matches.len(),
        "exact join complete"
    );
    Ok(outcome)
}
