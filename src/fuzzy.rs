//! Fuzzy strategy: edit-distance similarity with bonuses and thresholding.
//!
//! Tracks are scored in parallel. Each track's pool is scored in full before
//! its single best candidate is chosen, so results do not depend on worker
//! scheduling.

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::MatchConfig;
use crate::models::{Candidate, Evidence, LibraryFile, NearMiss, Track};
use crate::progress::{create_progress_bar, log_progress};
use crate::scoring::{duration_delta_ms, fuzzy_score, meets_threshold, rank_candidates, RankKey};
use crate::strategy::{check_unique_ids, StrategyFailure, StrategyInput, StrategyKind, StrategyOutcome};

/// Best-scoring file for a track, before thresholding.
#[derive(Debug, Clone, PartialEq)]
pub struct BestCandidate {
    pub file_id: String,
    pub score: f64,
    pub duration_delta_ms: Option<u64>,
}

/// Score every file in `pool` against `track` and return the top-ranked one.
pub fn best_candidate<'a, I>(track: &Track, pool: I, config: &MatchConfig) -> Option<BestCandidate>
where
    I: IntoIterator<Item = &'a LibraryFile>,
{
    let mut best: Option<RankKey<'a>> = None;
    for file in pool {
        if file.normalized.trim().is_empty() {
            continue;
        }
        let breakdown = fuzzy_score(track, file, config);
        let key = RankKey {
            score: breakdown.total,
            similarity: breakdown.similarity,
            duration_delta_ms: duration_delta_ms(track, file),
            file_id: file.id.as_str(),
        };
        if best.map_or(true, |b| rank_candidates(&key, &b).is_lt()) {
            best = Some(key);
        }
    }
    best.map(|key| BestCandidate {
        file_id: key.file_id.to_string(),
        score: key.score,
        duration_delta_ms: key.duration_delta_ms,
    })
}

enum Verdict {
    Accepted(Candidate),
    Rejected(String, NearMiss),
    NoCandidates,
}

pub fn run(input: &StrategyInput<'_>) -> Result<StrategyOutcome, StrategyFailure> {
    check_unique_ids(input.tracks, input.files)?;
    if let Some(gate) = input.gate {
        if gate.file_count() != input.files.len() {
            return Err(StrategyFailure::new(
                0,
                format!(
                    "duration gate covers {} files but the catalog has {}",
                    gate.file_count(),
                    input.files.len()
                ),
            ));
        }
    }

    let config = input.config;
    let files = input.files;
    let scorable: Vec<&LibraryFile> = files
        .iter()
        .filter(|f| !f.normalized.trim().is_empty())
        .collect();
    let skipped_files = files.len() - scorable.len();

    let mut skipped_tracks = 0;
    let pending: Vec<&Track> = input
        .tracks
        .iter()
        .filter(|t| !input.already_matched.contains(&t.id))
        .filter(|t| {
            let usable = !t.normalized.trim().is_empty();
            if !usable {
                skipped_tracks += 1;
            }
            usable
        })
        .collect();

    if skipped_files + skipped_tracks > 0 {
        warn!(
            target: "strategy",
            strategy = "fuzzy",
            files = skipped_files,
            tracks = skipped_tracks,
            "skipped entries with empty normalized key"
        );
    }

    let total = pending.len() as u64;
    let pb = create_progress_bar(total, "Fuzzy scoring");
    let done = std::sync::atomic::AtomicU64::new(0);

    let verdicts: Vec<Verdict> = pending
        .par_iter()
        .map(|track| {
            let best = match (input.gate, track.duration_ms) {
                (Some(gate), Some(duration)) => {
                    best_candidate(track, gate.window(duration).map(|i| &files[i]), config)
                }
                _ => best_candidate(track, scorable.iter().copied(), config),
            };

            pb.inc(1);
            let n = done.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
            log_progress("fuzzy", n, total, 10_000);

            match best {
                Some(b) if meets_threshold(b.score, config.fuzzy_threshold) => {
                    Verdict::Accepted(Candidate {
                        track_id: track.id.clone(),
                        file_id: b.file_id,
                        score: b.score,
                        method: StrategyKind::Fuzzy,
                        evidence: Evidence::Similarity,
                    })
                }
                Some(b) => Verdict::Rejected(
                    track.id.clone(),
                    NearMiss {
                        file_id: b.file_id,
                        score: b.score,
                    },
                ),
                None => Verdict::NoCandidates,
            }
        })
        .collect();
    pb.finish_with_message("Fuzzy scoring done");

    let mut outcome = StrategyOutcome {
        warnings: skipped_files + skipped_tracks,
        ..Default::default()
    };
    let mut empty_pools = 0;
    for verdict in verdicts {
        match verdict {
            Verdict::Accepted(candidate) => outcome.push(candidate),
            Verdict::Rejected(track_id, near_miss) => {
                outcome.near_misses.insert(track_id, near_miss);
            }
            Verdict::NoCandidates => empty_pools += 1,
        }
    }
    outcome.matches.sort_by(|a, b| a.track_id.cmp(&b.track_id));

    debug!(
        target: "strategy",
        strategy = "fuzzy",
        evaluated = pending.len(),
        matched = outcome.matches.len(),
        below_threshold = outcome.near_misses.len(),
        empty_pools,
        "fuzzy scoring complete"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duration_filter::DurationGate;
    use rustc_hash::FxHashSet;

    fn run_fuzzy(
        tracks: &[Track],
        files: &[LibraryFile],
        config: &MatchConfig,
        gate: Option<&DurationGate>,
    ) -> StrategyOutcome {
        let matched = FxHashSet::default();
        let input = StrategyInput {
            tracks,
            files,
            already_matched: &matched,
            config,
            gate,
        };
        run(&input).unwrap()
    }

    #[test]
    fn test_picks_highest_scoring_file_above_threshold() {
        // Sigur Rós with no known duration: full candidate pool
        let tracks = vec![Track::new("p", "t1", "Sigur Rós", "Svefn-g-englar")];
        let files = vec![
            LibraryFile::new("far", "/far", "Sigur Ros", "Starálfur"),
            LibraryFile::new("close", "/close", "Sigur Ros", "Svefn g englar (live)"),
        ];
        let outcome = run_fuzzy(&tracks, &files, &MatchConfig::default(), None);
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].file_id, "close");
        assert_eq!(outcome.matches[0].method, StrategyKind::Fuzzy);
    }

    #[test]
    fn test_below_threshold_left_unmatched_with_near_miss() {
        let tracks = vec![Track::new("p", "t1", "Daft Punk", "One More Time")];
        let files = vec![LibraryFile::new("f1", "/x", "Radiohead", "Karma Police")];
        let outcome = run_fuzzy(&tracks, &files, &MatchConfig::default(), None);
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.near_misses["t1"].file_id, "f1");
    }

    #[test]
    fn test_threshold_equal_score_accepted() {
        let tracks = vec![Track::new("p", "t1", "Daft Punk", "One More Time")];
        let files = vec![LibraryFile::new("f1", "/x", "Daft Punk", "One More Tim")];
        let config = MatchConfig {
            exact_bonus: 0.0,
            ..Default::default()
        };
        let score = fuzzy_score(&tracks[0], &files[0], &config).total;
        assert!(score < 1.0);

        let at = MatchConfig {
            fuzzy_threshold: score,
            ..config.clone()
        };
        assert_eq!(run_fuzzy(&tracks, &files, &at, None).matches.len(), 1);

        let above = MatchConfig {
            fuzzy_threshold: score + 0.001,
            ..config
        };
        assert!(run_fuzzy(&tracks, &files, &above, None).matches.is_empty());
    }

    #[test]
    fn test_ties_break_by_duration_then_id() {
        let tracks = vec![Track::new("p", "t1", "Daft Punk", "One More Time").with_duration_ms(320_000)];
        let files = vec![
            LibraryFile::new("b", "/b", "Daft Punk", "One More Time").with_duration_ms(320_500),
            LibraryFile::new("a", "/a", "Daft Punk", "One More Time").with_duration_ms(321_000),
            LibraryFile::new("c", "/c", "Daft Punk", "One More Time").with_duration_ms(320_500),
        ];
        let outcome = run_fuzzy(&tracks, &files, &MatchConfig::default(), None);
        assert_eq!(outcome.matches[0].file_id, "b");
    }

    #[test]
    fn test_gate_excludes_files_outside_window() {
        let tracks = vec![Track::new("p", "t1", "Daft Punk", "One More Time").with_duration_ms(320_000)];
        let files = vec![
            LibraryFile::new("outside", "/o", "Daft Punk", "One More Time").with_duration_ms(322_001),
            LibraryFile::new("other", "/x", "Radiohead", "Karma Police").with_duration_ms(320_000),
        ];
        let gate = DurationGate::build(&files, 2000);
        let outcome = run_fuzzy(&tracks, &files, &MatchConfig::default(), Some(&gate));
        assert!(outcome.matches.is_empty());
        assert_eq!(outcome.near_misses["t1"].file_id, "other");

        // Without the gate the 2.001s file is eligible again
        let outcome = run_fuzzy(&tracks, &files, &MatchConfig::default(), None);
        assert_eq!(outcome.matches[0].file_id, "outside");
    }

    #[test]
    fn test_gate_keeps_files_without_duration() {
        let tracks = vec![Track::new("p", "t1", "Massive Attack", "Teardrop").with_duration_ms(330_000)];
        let files = vec![LibraryFile::new("f1", "/u", "Massive Attack", "Teardropp")];
        let gate = DurationGate::build(&files, 2000);
        let outcome = run_fuzzy(&tracks, &files, &MatchConfig::default(), Some(&gate));
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].file_id, "f1");
    }

    #[test]
    fn test_identical_key_beats_closer_near_exact() {
        let tracks = vec![Track::new("p", "t1", "Daft Punk", "One More Time").with_duration_ms(320_000)];
        let files = vec![
            LibraryFile::new("a-near", "/a", "Daft Punk", "One More Tim").with_duration_ms(320_000),
            LibraryFile::new("z-same", "/z", "Daft Punk", "One More Time").with_duration_ms(321_500),
        ];
        let config = MatchConfig::default();
        // Both capped at 1.0 by the exact bonus
        assert_eq!(fuzzy_score(&tracks[0], &files[0], &config).total, 1.0);
        assert_eq!(fuzzy_score(&tracks[0], &files[1], &config).total, 1.0);

        let outcome = run_fuzzy(&tracks, &files, &config, None);
        assert_eq!(outcome.matches[0].file_id, "z-same");
    }

    #[test]
    fn test_gate_for_other_catalog_rejected() {
        let tracks = vec![Track::new("p", "t1", "A", "B")];
        let files = vec![LibraryFile::new("f1", "/a", "A", "B")];
        let gate = DurationGate::build(&[], 2000);
        let config = MatchConfig::default();
        let matched = FxHashSet::default();
        let input = StrategyInput {
            tracks: &tracks,
            files: &files,
            already_matched: &matched,
            config: &config,
            gate: Some(&gate),
        };
        assert!(run(&input).is_err());
    }

    #[test]
    fn test_best_candidate_skips_empty_keys() {
        let track = Track::new("p", "t1", "A", "B");
        let files = vec![LibraryFile::new("f1", "/a", "", "")];
        assert!(best_candidate(&track, files.iter(), &MatchConfig::default()).is_none());
    }
}
