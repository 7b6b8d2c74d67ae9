//! Scoring functions for fuzzy matching.
//!
//! This module contains:
//! - Normalized edit-distance similarity
//! - Exact, album and year bonuses
//! - Threshold acceptance and candidate ranking

use std::cmp::Ordering;

use serde::Serialize;

use crate::config::MatchConfig;
use crate::models::{LibraryFile, Track};
use crate::normalize::normalize_text;

/// Float noise tolerated when comparing a score against a threshold
pub const SCORE_EPSILON: f64 = 1e-9;

// ============================================================================
// Similarity
// ============================================================================

/// Normalized Levenshtein similarity between two keys (1.0 = identical).
pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(a, b)
}

/// Absolute duration difference in milliseconds, if both sides are known.
pub fn duration_delta_ms(track: &Track, file: &LibraryFile) -> Option<u64> {
    match (track.duration_ms, file.duration_ms) {
        (Some(t), Some(f)) => Some(t.abs_diff(f)),
        _ => None,
    }
}

/// True if `score` meets `threshold`. A score equal to the threshold passes.
pub fn meets_threshold(score: f64, threshold: f64) -> bool {
    score + SCORE_EPSILON >= threshold
}

// ============================================================================
// Bonuses
// ============================================================================

/// Album agreement after normalization; both sides must be known.
pub fn album_matches(track: &Track, file: &LibraryFile) -> bool {
    match (&track.album, &file.album) {
        (Some(a), Some(b)) => {
            let a = normalize_text(a);
            !a.is_empty() && a == normalize_text(b)
        }
        _ => false,
    }
}

/// Track year reproduced in the file's tags or path.
pub fn year_matches(track: &Track, file: &LibraryFile) -> bool {
    let Some(year) = track.year else {
        return false;
    };
    if file.year == Some(year) {
        return true;
    }
    let needle = year.to_string();
    // Only whole four-digit runs count, so 1999 does not match inside 11999
    file.path
        .split(|c: char| !c.is_ascii_digit())
        .any(|run| run == needle)
}

/// Explained fuzzy score for one track/file pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub similarity: f64,
    pub exact_bonus: f64,
    pub album_bonus: f64,
    pub year_bonus: f64,
    /// Sum of the above, capped at 1.0
    pub total: f64,
}

/// Combined fuzzy score: similarity plus bonuses, capped at 1.0.
pub fn fuzzy_score(track: &Track, file: &LibraryFile, config: &MatchConfig) -> ScoreBreakdown {
    let sim = similarity(&track.normalized, &file.normalized);

    let exact_bonus = if sim >= config.near_exact_threshold && track.normalized != file.normalized {
        config.exact_bonus
    } else {
        0.0
    };
    let album_bonus = if album_matches(track, file) {
        config.album_match_bonus
    } else {
        0.0
    };
    let year_bonus = if config.use_year && year_matches(track, file) {
        config.year_bonus
    } else {
        0.0
    };

    let total = (sim + exact_bonus + album_bonus + year_bonus).min(1.0);
    ScoreBreakdown {
        similarity: sim,
        exact_bonus,
        album_bonus,
        year_bonus,
        total,
    }
}

// ============================================================================
// Ranking
// ============================================================================

/// What candidate selection compares, one per scored file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankKey<'a> {
    /// Combined score, capped at 1.0
    pub score: f64,
    /// Raw similarity before bonuses
    pub similarity: f64,
    pub duration_delta_ms: Option<u64>,
    pub file_id: &'a str,
}

/// Ordering for candidate selection: higher score first, then higher raw
/// similarity (a capped near-exact key never beats an identical one), then
/// smaller duration delta (unknown sorts last), then smaller file id.
pub fn rank_candidates(a: &RankKey<'_>, b: &RankKey<'_>) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.similarity.partial_cmp(&a.similarity).unwrap_or(Ordering::Equal))
        .then_with(|| match (a.duration_delta_ms, b.duration_delta_ms) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.file_id.cmp(b.file_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track() -> Track {
        Track::new("spotify", "t1", "Daft Punk", "One More Time")
            .with_duration_ms(320_000)
            .with_album("Discovery")
            .with_year(2001)
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("abc", "abc"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
        let s = similarity("daft punk one more time", "daft punk one more tim");
        assert!(s > 0.9 && s < 1.0);
    }

    #[test]
    fn test_threshold_boundary() {
        assert!(meets_threshold(0.78, 0.78));
        assert!(meets_threshold(0.9, 0.78));
        assert!(!meets_threshold(0.779, 0.78));
    }

    #[test]
    fn test_exact_bonus_only_for_near_identical() {
        let config = MatchConfig::default();
        let t = Track::new("p", "t1", "Daft Punk", "One More Time");

        let identical = LibraryFile::new("f1", "/a.flac", "Daft Punk", "One More Time");
        assert_eq!(fuzzy_score(&t, &identical, &config).exact_bonus, 0.0);

        let near = LibraryFile::new("f2", "/b.flac", "Daft Punk", "One More Tim");
        let breakdown = fuzzy_score(&t, &near, &config);
        assert_eq!(breakdown.exact_bonus, config.exact_bonus);
        assert!(breakdown.total <= 1.0);
    }

    #[test]
    fn test_album_bonus() {
        let config = MatchConfig::default();
        let file = LibraryFile::new("f1", "/x.flac", "Daft Punk", "One More Time (Radio)")
            .with_album("  DISCOVERY ");
        let breakdown = fuzzy_score(&track(), &file, &config);
        assert_eq!(breakdown.album_bonus, config.album_match_bonus);

        let other = file.clone().with_album("Homework");
        assert_eq!(fuzzy_score(&track(), &other, &config).album_bonus, 0.0);
    }

    #[test]
    fn test_year_bonus_requires_flag() {
        let file = LibraryFile::new("f1", "/music/2001 - Discovery/01.flac", "Daft Punk", "One More Tme");
        let off = MatchConfig::default();
        assert_eq!(fuzzy_score(&track(), &file, &off).year_bonus, 0.0);

        let on = MatchConfig {
            use_year: true,
            ..Default::default()
        };
        assert!(fuzzy_score(&track(), &file, &on).year_bonus > 0.0);
    }

    #[test]
    fn test_year_matches_whole_runs_only() {
        let file = LibraryFile::new("f1", "/music/12001/a.flac", "A", "B");
        assert!(!year_matches(&track(), &file));
        let tagged = file.with_year(2001);
        assert!(year_matches(&track(), &tagged));
    }

    #[test]
    fn test_score_capped_at_one() {
        let config = MatchConfig {
            exact_bonus: 0.5,
            album_match_bonus: 0.5,
            year_bonus: 0.5,
            use_year: true,
            ..Default::default()
        };
        let file = LibraryFile::new("f1", "/2001/x.flac", "Daft Punk", "One More Tim")
            .with_album("Discovery");
        assert_eq!(fuzzy_score(&track(), &file, &config).total, 1.0);
    }

    fn key(score: f64, similarity: f64, delta: Option<u64>, id: &str) -> RankKey<'_> {
        RankKey {
            score,
            similarity,
            duration_delta_ms: delta,
            file_id: id,
        }
    }

    #[test]
    fn test_rank_candidates_tie_breaks() {
        let mut items = vec![
            key(0.9, 0.9, Some(3000), "b"),
            key(0.9, 0.9, None, "a"),
            key(0.9, 0.9, Some(1000), "c"),
            key(0.95, 0.95, Some(9000), "z"),
            key(0.9, 0.9, Some(1000), "a2"),
        ];
        items.sort_by(rank_candidates);
        let order: Vec<&str> = items.iter().map(|k| k.file_id).collect();
        assert_eq!(order, vec!["z", "a2", "c", "b", "a"]);
    }

    #[test]
    fn test_identical_key_outranks_capped_near_exact() {
        let identical = key(1.0, 1.0, Some(1900), "z-identical");
        let near = key(1.0, 0.96, Some(0), "a-near");
        assert_eq!(rank_candidates(&identical, &near), Ordering::Less);
    }

    #[test]
    fn test_duration_delta() {
        let file = LibraryFile::new("f1", "/x", "A", "B").with_duration_ms(321_500);
        assert_eq!(duration_delta_ms(&track(), &file), Some(1500));
        let unknown = LibraryFile::new("f2", "/y", "A", "B");
        assert_eq!(duration_delta_ms(&track(), &unknown), None);

        let extreme = LibraryFile::new("f3", "/z", "A", "B").with_duration_ms(i64::MIN);
        let far = Track::new("p", "t9", "A", "B").with_duration_ms(i64::MAX);
        assert_eq!(duration_delta_ms(&far, &extreme), Some(u64::MAX));
    }
}
