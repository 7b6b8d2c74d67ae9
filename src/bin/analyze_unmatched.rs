//! Explain why tracks stayed unmatched.
//!
//! Re-scores every unmatched track against the whole library (no duration
//! gate) and buckets each one by the reason the configured strategy order
//! rejected it.
//!
//! Usage: analyze-unmatched <trackmatch.db> --provider spotify [--limit 20]

use anyhow::{Context, Result};
use clap::Parser;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use trackmatch::config::{self, MatchConfig};
use trackmatch::fuzzy::best_candidate;
use trackmatch::models::{LibraryFile, Track};
use trackmatch::scoring::{duration_delta_ms, fuzzy_score, meets_threshold, ScoreBreakdown};
use trackmatch::store::Store;
use trackmatch::StrategyKind;

#[derive(Parser)]
#[command(name = "analyze-unmatched")]
#[command(about = "Break down why unmatched tracks were rejected")]
struct Args {
    db: PathBuf,

    #[arg(long)]
    provider: String,

    /// Detailed rows to print
    #[arg(long, default_value = "20")]
    limit: usize,

    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Reason {
    EmptyKey,
    NoCandidates,
    OutsideDurationWindow,
    BelowThreshold,
    FuzzyNotConfigured,
    CatalogChanged,
}

impl Reason {
    fn label(self) -> &'static str {
        match self {
            Reason::EmptyKey => "empty normalized key",
            Reason::NoCandidates => "no scorable files",
            Reason::OutsideDurationWindow => "best file outside duration window",
            Reason::BelowThreshold => "best score below threshold",
            Reason::FuzzyNotConfigured => "fuzzy strategy not configured",
            Reason::CatalogChanged => "clears threshold now (catalog changed?)",
        }
    }
}

/// Where fuzzy scoring sits in the configured strategy order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuzzyStage {
    Absent,
    Ungated,
    /// duration_filter runs before fuzzy
    Gated,
}

fn fuzzy_stage(order: &[StrategyKind]) -> FuzzyStage {
    let position = |kind| order.iter().position(|k| *k == kind);
    match (position(StrategyKind::DurationFilter), position(StrategyKind::Fuzzy)) {
        (_, None) => FuzzyStage::Absent,
        (Some(d), Some(f)) if d < f => FuzzyStage::Gated,
        _ => FuzzyStage::Ungated,
    }
}

/// Reason a track with a scored best file stayed unmatched. The duration
/// window is only blamed when it was active and both durations are known.
fn rejection_reason(
    track: &Track,
    file: &LibraryFile,
    score: f64,
    config: &MatchConfig,
    stage: FuzzyStage,
) -> Reason {
    if !meets_threshold(score, config.fuzzy_threshold) {
        return Reason::BelowThreshold;
    }
    match stage {
        FuzzyStage::Absent => Reason::FuzzyNotConfigured,
        FuzzyStage::Gated => match duration_delta_ms(track, file) {
            Some(delta) if delta > config.duration_tolerance_ms().unsigned_abs() => {
                Reason::OutsideDurationWindow
            }
            _ => Reason::CatalogChanged,
        },
        FuzzyStage::Ungated => Reason::CatalogChanged,
    }
}

struct Analysis<'a> {
    track: &'a Track,
    reason: Reason,
    best: Option<(&'a LibraryFile, ScoreBreakdown)>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let start = Instant::now();

    let config = config::load(args.config.as_deref())?;
    let stage = fuzzy_stage(&config.validate()?);
    let tolerance_ms = config.duration_tolerance_ms();
    let store = Store::open(&args.db).with_context(|| format!("Failed to open {:?}", args.db))?;

    println!("Loading catalogs...");
    let unmatched = store.load_unmatched(&args.provider)?;
    let tracks: FxHashMap<String, Track> = store
        .load_tracks(&args.provider)?
        .into_iter()
        .map(|t| (t.id.clone(), t))
        .collect();
    let files = store.load_files()?;
    let by_id: FxHashMap<&str, &LibraryFile> = files.iter().map(|f| (f.id.as_str(), f)).collect();
    println!(
        "  {} unmatched of {} tracks, {} library files",
        unmatched.len(),
        tracks.len(),
        files.len()
    );

    let pending: Vec<&Track> = unmatched.iter().filter_map(|u| tracks.get(&u.track_id)).collect();
    let recoverable = AtomicUsize::new(0);

    let mut analyses: Vec<Analysis<'_>> = pending
        .par_iter()
        .map(|&track| {
            if track.normalized.trim().is_empty() {
                return Analysis { track, reason: Reason::EmptyKey, best: None };
            }
            let Some(best) = best_candidate(track, files.iter(), &config) else {
                return Analysis { track, reason: Reason::NoCandidates, best: None };
            };
            let Some(&file) = by_id.get(best.file_id.as_str()) else {
                return Analysis { track, reason: Reason::NoCandidates, best: None };
            };
            let breakdown = fuzzy_score(track, file, &config);

            let reason = rejection_reason(track, file, breakdown.total, &config, stage);
            if reason == Reason::OutsideDurationWindow {
                recoverable.fetch_add(1, Ordering::Relaxed);
            }
            Analysis { track, reason, best: Some((file, breakdown)) }
        })
        .collect();

    analyses.sort_by(|a, b| {
        let score = |x: &Analysis<'_>| x.best.as_ref().map(|(_, s)| s.total).unwrap_or(0.0);
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.track.id.cmp(&b.track.id))
    });

    let mut buckets: FxHashMap<Reason, usize> = FxHashMap::default();
    for a in &analyses {
        *buckets.entry(a.reason).or_default() += 1;
    }
    let mut buckets: Vec<(Reason, usize)> = buckets.into_iter().collect();
    buckets.sort();

    let total = analyses.len().max(1);
    println!("\n=== UNMATCHED BREAKDOWN ({} tracks) ===\n", analyses.len());
    println!("Reason                                   Count      %");
    println!("─────────────────────────────────────────────────────");
    for (reason, count) in &buckets {
        println!(
            "{:<38} {:>7} {:>6.1}%",
            reason.label(),
            count,
            100.0 * *count as f64 / total as f64
        );
    }
    println!("─────────────────────────────────────────────────────");
    println!(
        "Clears threshold without the {:.1}s duration gate: {}",
        tolerance_ms as f64 / 1000.0,
        recoverable.load(Ordering::Relaxed)
    );

    println!("\n=== TOP NEAR MISSES ===\n");
    for a in analyses.iter().take(args.limit) {
        match &a.best {
            Some((file, s)) => {
                let delta = match (a.track.duration_ms, file.duration_ms) {
                    (Some(t), Some(f)) => format!("{:+.1}s", (f as f64 - t as f64) / 1000.0),
                    _ => "n/a".to_string(),
                };
                println!("[{}] {} - {}", a.track.id, a.track.artist, a.track.title);
                println!("    best: {} ({})", file.id, file.path);
                println!(
                    "    sim={:.3} exact={:.2} album={:.2} year={:.2} total={:.3} Δdur={}  [{}]",
                    s.similarity,
                    s.exact_bonus,
                    s.album_bonus,
                    s.year_bonus,
                    s.total,
                    delta,
                    a.reason.label()
                );
            }
            None => println!("[{}] {} - {}  [{}]", a.track.id, a.track.artist, a.track.title, a.reason.label()),
        }
    }

    println!("\nElapsed: {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
