//! Pipeline orchestrator.
//!
//! One pass per provider: load the snapshots, run each configured strategy in
//! order while threading the already-matched set between them, classify the
//! accepted candidates, then commit everything in one transaction. A run that
//! fails at any point before the commit leaves the store untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, warn};

use crate::confidence::classify;
use crate::config::MatchConfig;
use crate::duration_filter::DurationGate;
use crate::error::{MatchError, Result};
use crate::models::{
    Candidate, LibraryFile, Match, NearMiss, RunMode, RunSummary, StrategyCount, Track, UnmatchedTrack,
};
use crate::progress::{create_spinner, format_duration};
use crate::store::Store;
use crate::strategy::{StrategyInput, StrategyKind, StrategyOutcome};

/// In-memory result of running every strategy, before persistence.
#[derive(Debug, Clone)]
pub struct Evaluation {
    /// New matches, sorted by track id
    pub matches: Vec<Match>,
    /// Tracks left unmatched, sorted by track id
    pub unmatched: Vec<UnmatchedTrack>,
    pub per_strategy: Vec<StrategyCount>,
    pub integrity_warnings: usize,
    /// Catalog tracks already matched before this evaluation started
    pub carried_over: usize,
}

pub struct Pipeline {
    config: MatchConfig,
    order: Vec<StrategyKind>,
    cancel: Option<Arc<AtomicBool>>,
}

impl Pipeline {
    /// Validate the configuration and fix the strategy order. No I/O happens here.
    pub fn new(config: &MatchConfig) -> Result<Self> {
        let order = config.validate()?;
        Ok(Self {
            config: config.clone(),
            order,
            cancel: None,
        })
    }

    /// Abort at the next strategy boundary once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn order(&self) -> &[StrategyKind] {
        &self.order
    }

    fn check_cancelled(&self, completed: usize) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => {
                warn!(target: "pipeline", completed, "cancellation requested");
                Err(MatchError::Cancelled { completed })
            }
            _ => Ok(()),
        }
    }

    /// Run every strategy over the snapshots. `seed` holds track ids that are
    /// already matched and must not be re-evaluated (empty for a full run).
    pub fn evaluate(
        &self,
        provider: &str,
        tracks: &[Track],
        files: &[LibraryFile],
        seed: FxHashSet<String>,
    ) -> Result<Evaluation> {
        let mut matched = seed;
        let carried_over = tracks.iter().filter(|t| matched.contains(&t.id)).count();
        let track_ids: FxHashSet<&str> = tracks.iter().map(|t| t.id.as_str()).collect();
        let file_ids: FxHashSet<&str> = files.iter().map(|f| f.id.as_str()).collect();

        let mut accepted: Vec<Candidate> = Vec::new();
        let mut gate: Option<DurationGate> = None;
        let mut near_misses: FxHashMap<String, NearMiss> = FxHashMap::default();
        let mut per_strategy = Vec::with_capacity(self.order.len());
        let mut integrity_warnings = 0;

        for (completed, &kind) in self.order.iter().enumerate() {
            self.check_cancelled(completed)?;
            let started = Instant::now();

            let input = StrategyInput {
                tracks,
                files,
                already_matched: &matched,
                config: &self.config,
                gate: gate.as_ref(),
            };
            let outcome = kind
                .run(&input)
                .map_err(|failure| MatchError::StrategyExecution {
                    strategy: kind.name().to_string(),
                    resolved: failure.resolved,
                    reason: failure.reason,
                })?;
            verify_outcome(kind, &outcome, &matched, &track_ids, &file_ids)?;

            info!(
                target: "pipeline",
                strategy = kind.name(),
                matched = outcome.matches.len(),
                warnings = outcome.warnings,
                elapsed = %format_duration(started.elapsed()),
                "strategy finished"
            );

            per_strategy.push(StrategyCount {
                strategy: kind.name().to_string(),
                matched: outcome.matches.len(),
            });
            integrity_warnings += outcome.warnings;
            matched.extend(outcome.matched);
            if outcome.gate.is_some() {
                gate = outcome.gate;
            }
            for (track_id, miss) in outcome.near_misses {
                near_misses
                    .entry(track_id)
                    .and_modify(|best| {
                        if miss.score > best.score {
                            *best = miss.clone();
                        }
                    })
                    .or_insert(miss);
            }
            accepted.extend(outcome.matches);
        }

        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut matches: Vec<Match> = accepted
            .into_iter()
            .map(|c| Match {
                provider: provider.to_string(),
                confidence: classify(c.score, c.evidence),
                method: c.method.name().to_string(),
                evidence: c.evidence,
                track_id: c.track_id,
                file_id: c.file_id,
                score: c.score,
                created_at: created_at.clone(),
            })
            .collect();
        matches.sort_by(|a, b| a.track_id.cmp(&b.track_id));

        let mut unmatched: Vec<UnmatchedTrack> = tracks
            .iter()
            .filter(|t| !matched.contains(&t.id))
            .map(|t| {
                let miss = near_misses.remove(&t.id);
                UnmatchedTrack {
                    provider: provider.to_string(),
                    track_id: t.id.clone(),
                    best_score: miss.as_ref().map(|m| m.score),
                    best_file_id: miss.map(|m| m.file_id),
                }
            })
            .collect();
        unmatched.sort_by(|a, b| a.track_id.cmp(&b.track_id));

        Ok(Evaluation {
            matches,
            unmatched,
            per_strategy,
            integrity_warnings,
            carried_over,
        })
    }

    /// Load, evaluate and commit one provider.
    pub fn run(&self, store: &mut Store, provider: &str, mode: RunMode) -> Result<RunSummary> {
        let start = Instant::now();

        let spinner = create_spinner("Loading catalogs");
        let tracks = store.load_tracks(provider)?;
        let files = store.load_files()?;
        let seed = match mode {
            RunMode::Full => FxHashSet::default(),
            RunMode::Incremental => store.matched_track_ids(provider)?,
        };
        spinner.finish_and_clear();
        info!(
            target: "pipeline",
            provider,
            mode = mode.as_str(),
            tracks = tracks.len(),
            files = files.len(),
            previously_matched = seed.len(),
            "loaded catalogs"
        );

        let evaluation = self.evaluate(provider, &tracks, &files, seed)?;
        self.check_cancelled(self.order.len())?;
        store.commit_run(provider, mode, &evaluation.matches, &evaluation.unmatched)?;

        let mut summary = RunSummary::new(provider, mode);
        summary.tracks = tracks.len();
        summary.files = files.len();
        summary.matched = evaluation.matches.len();
        summary.unmatched = evaluation.unmatched.len();
        summary.carried_over = evaluation.carried_over;
        summary.per_strategy = evaluation.per_strategy;
        summary.integrity_warnings = evaluation.integrity_warnings;
        summary.record_confidences(&evaluation.matches);
        summary.elapsed_seconds = start.elapsed().as_secs_f64();

        info!(
            target: "pipeline",
            provider,
            matched = summary.matched,
            unmatched = summary.unmatched,
            rate = %format!("{:.1}%", summary.match_rate()),
            elapsed = %format_duration(start.elapsed()),
            "run complete"
        );
        Ok(summary)
    }
}

/// Reject outcomes that would break exclusivity or carry nonsense scores.
fn verify_outcome(
    kind: StrategyKind,
    outcome: &StrategyOutcome,
    already_matched: &FxHashSet<String>,
    track_ids: &FxHashSet<&str>,
    file_ids: &FxHashSet<&str>,
) -> Result<()> {
    let fail = |resolved: usize, reason: String| MatchError::StrategyExecution {
        strategy: kind.name().to_string(),
        resolved,
        reason,
    };

    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for (i, c) in outcome.matches.iter().enumerate() {
        if !track_ids.contains(c.track_id.as_str()) {
            return Err(fail(i, format!("candidate for unknown track '{}'", c.track_id)));
        }
        if !file_ids.contains(c.file_id.as_str()) {
            return Err(fail(i, format!("candidate references unknown file '{}'", c.file_id)));
        }
        if already_matched.contains(&c.track_id) {
            return Err(fail(i, format!("track '{}' was already matched", c.track_id)));
        }
        if !seen.insert(c.track_id.as_str()) {
            return Err(fail(i, format!("track '{}' matched twice", c.track_id)));
        }
        if !c.score.is_finite() || !(0.0..=1.0).contains(&c.score) {
            return Err(fail(i, format!("score {} for track '{}' is outside [0, 1]", c.score, c.track_id)));
        }
        if c.method != kind {
            return Err(fail(i, format!("candidate for '{}' reports method {}", c.track_id, c.method)));
        }
    }

    if outcome.matched.len() != seen.len() || !outcome.matched.iter().all(|id| seen.contains(id.as_str())) {
        return Err(fail(
            outcome.matches.len(),
            "reported track ids do not match its candidates".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, Evidence};

    fn catalog() -> (Vec<Track>, Vec<LibraryFile>) {
        let tracks = vec![
            Track::new("spotify", "t1", "Daft Punk", "One More Time").with_duration_ms(320_000),
            Track::new("spotify", "t2", "Daft Punk", "Digital Love (Remastered 2009)").with_duration_ms(301_000),
            Track::new("spotify", "t3", "Radiohead", "Karma Police").with_duration_ms(264_000),
        ];
        let files = vec![
            LibraryFile::new("f1", "/m/one.flac", "Daft Punk", "One More Time").with_duration_ms(320_000),
            LibraryFile::new("f2", "/m/love.flac", "Daft Punk", "Digital Lov").with_duration_ms(301_500),
        ];
        (tracks, files)
    }

    #[test]
    fn test_evaluate_threads_exclusion_set() {
        let (tracks, files) = catalog();
        let pipeline = Pipeline::new(&MatchConfig::default()).unwrap();
        let eval = pipeline
            .evaluate("spotify", &tracks, &files, FxHashSet::default())
            .unwrap();

        let pairs: Vec<(&str, &str, &str)> = eval
            .matches
            .iter()
            .map(|m| (m.track_id.as_str(), m.file_id.as_str(), m.method.as_str()))
            .collect();
        assert_eq!(pairs, vec![("t1", "f1", "sql_exact"), ("t2", "f2", "fuzzy")]);
        assert_eq!(eval.matches[0].confidence, Confidence::High);
        assert_eq!(eval.unmatched.len(), 1);
        assert_eq!(eval.unmatched[0].track_id, "t3");

        let counts: Vec<(String, usize)> = eval
            .per_strategy
            .into_iter()
            .map(|c| (c.strategy, c.matched))
            .collect();
        assert_eq!(
            counts,
            vec![
                ("sql_exact".to_string(), 1),
                ("duration_filter".to_string(), 0),
                ("fuzzy".to_string(), 1)
            ]
        );
    }

    #[test]
    fn test_seeded_tracks_are_carried_over() {
        let (tracks, files) = catalog();
        let pipeline = Pipeline::new(&MatchConfig::default()).unwrap();
        let seed: FxHashSet<String> = ["t1".to_string()].into_iter().collect();
        let eval = pipeline.evaluate("spotify", &tracks, &files, seed).unwrap();
        assert_eq!(eval.carried_over, 1);
        assert!(eval.matches.iter().all(|m| m.track_id != "t1"));
        assert!(eval.unmatched.iter().all(|u| u.track_id != "t1"));
    }

    #[test]
    fn test_cancelled_before_first_strategy() {
        let (tracks, files) = catalog();
        let flag = Arc::new(AtomicBool::new(true));
        let pipeline = Pipeline::new(&MatchConfig::default())
            .unwrap()
            .with_cancel_flag(flag);
        let err = pipeline
            .evaluate("spotify", &tracks, &files, FxHashSet::default())
            .unwrap_err();
        assert!(matches!(err, MatchError::Cancelled { completed: 0 }));
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let config = MatchConfig {
            strategies: vec!["sql_exact".into(), "soundex".into()],
            ..Default::default()
        };
        assert!(matches!(
            Pipeline::new(&config),
            Err(MatchError::Configuration { .. })
        ));
    }

    #[test]
    fn test_duplicate_track_ids_surface_strategy_error() {
        let (mut tracks, files) = catalog();
        tracks.push(Track::new("spotify", "t1", "Someone", "Else"));
        let pipeline = Pipeline::new(&MatchConfig::default()).unwrap();
        match pipeline.evaluate("spotify", &tracks, &files, FxHashSet::default()) {
            Err(MatchError::StrategyExecution { strategy, resolved, .. }) => {
                assert_eq!(strategy, "sql_exact");
                assert_eq!(resolved, 0);
            }
            other => panic!("expected strategy failure, got {:?}", other.map(|e| e.matches.len())),
        }
    }

    #[test]
    fn test_verify_rejects_candidate_for_matched_track() {
        let track_ids: FxHashSet<&str> = ["t1"].into_iter().collect();
        let file_ids: FxHashSet<&str> = ["f1"].into_iter().collect();
        let already: FxHashSet<String> = ["t1".to_string()].into_iter().collect();
        let mut outcome = StrategyOutcome::default();
        outcome.push(Candidate {
            track_id: "t1".into(),
            file_id: "f1".into(),
            score: 0.9,
            method: StrategyKind::Fuzzy,
            evidence: Evidence::Similarity,
        });
        let err = verify_outcome(StrategyKind::Fuzzy, &outcome, &already, &track_ids, &file_ids).unwrap_err();
        assert!(err.to_string().contains("already matched"));
    }

    #[test]
    fn test_verify_rejects_out_of_range_score() {
        let track_ids: FxHashSet<&str> = ["t1"].into_iter().collect();
        let file_ids: FxHashSet<&str> = ["f1"].into_iter().collect();
        let mut outcome = StrategyOutcome::default();
        outcome.push(Candidate {
            track_id: "t1".into(),
            file_id: "f1".into(),
            score: 1.2,
            method: StrategyKind::Fuzzy,
            evidence: Evidence::Similarity,
        });
        let err = verify_outcome(
            StrategyKind::Fuzzy,
            &outcome,
            &FxHashSet::default(),
            &track_ids,
            &file_ids,
        )
        .unwrap_err();
        assert!(err.to_string().contains("outside [0, 1]"));
    }
}
