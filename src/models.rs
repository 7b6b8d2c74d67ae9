//! Core data models for the matching engine.
//!
//! Tracks and library files are read-only snapshots owned by their
//! collaborators (catalog sync and filesystem scanner). Matches and unmatched
//! records are the engine's only outputs.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::normalize::normalize_key;
use crate::strategy::StrategyKind;

// ============================================================================
// Catalog Models
// ============================================================================

/// One entry from the remote playlist catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Filled from `--provider` on import when the snapshot omits it
    #[serde(default)]
    pub provider: String,
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    /// Industry recording code (ISRC) when the provider exposes one
    #[serde(default)]
    pub isrc: Option<String>,
    /// Precomputed artist+title key, see `normalize::normalize_key`
    #[serde(default)]
    pub normalized: String,
}

impl Track {
    pub fn new(provider: &str, id: &str, artist: &str, title: &str) -> Self {
        Self {
            provider: provider.to_string(),
            id: id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            album: None,
            year: None,
            duration_ms: None,
            isrc: None,
            normalized: normalize_key(artist, title),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_album(mut self, album: &str) -> Self {
        self.album = Some(album.to_string());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_isrc(mut self, isrc: &str) -> Self {
        self.isrc = Some(isrc.to_string());
        self
    }

    /// Fill in the normalized key for snapshots that arrived without one.
    pub fn ensure_normalized(&mut self) {
        if self.normalized.trim().is_empty() {
            self.normalized = normalize_key(&self.artist, &self.title);
        }
    }
}

/// One local audio file with scanner-derived metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LibraryFile {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    /// Absent for files without decodable metadata
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub bitrate: Option<i32>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub normalized: String,
    // Scanner bookkeeping, never consulted by matching
    #[serde(default)]
    pub size_bytes: i64,
    #[serde(default)]
    pub modified_at: Option<String>,
}

impl LibraryFile {
    pub fn new(id: &str, path: &str, artist: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            path: path.to_string(),
            artist: Some(artist.to_string()),
            title: Some(title.to_string()),
            album: None,
            year: None,
            duration_ms: None,
            bitrate: None,
            isrc: None,
            normalized: normalize_key(artist, title),
            size_bytes: 0,
            modified_at: None,
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_album(mut self, album: &str) -> Self {
        self.album = Some(album.to_string());
        self
    }

    pub fn with_year(mut self, year: i32) -> Self {
        self.year = Some(year);
        self
    }

    pub fn with_isrc(mut self, isrc: &str) -> Self {
        self.isrc = Some(isrc.to_string());
        self
    }

    /// Fill in the normalized key from tags when the scanner did not provide one.
    pub fn ensure_normalized(&mut self) {
        if self.normalized.trim().is_empty() {
            if let (Some(artist), Some(title)) = (&self.artist, &self.title) {
                self.normalized = normalize_key(artist, title);
            }
        }
    }
}

// ============================================================================
// Match Models
// ============================================================================

/// Discrete reliability label attached to every match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Confidence {
    Certain,
    High,
    Moderate,
    Low,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Certain => "CERTAIN",
            Confidence::High => "HIGH",
            Confidence::Moderate => "MODERATE",
            Confidence::Low => "LOW",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Confidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CERTAIN" => Ok(Confidence::Certain),
            "HIGH" => Ok(Confidence::High),
            "MODERATE" => Ok(Confidence::Moderate),
            "LOW" => Ok(Confidence::Low),
            other => Err(format!("unknown confidence tier '{}'", other)),
        }
    }
}

/// What a strategy's candidate rests on. Consumed by the confidence classifier
/// and stored with every match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    /// Normalized key equality corroborated by an equal ISRC on both sides
    ExternalId,
    /// Bare normalized key equality
    NormalizedKey,
    /// Edit-distance similarity plus bonuses
    Similarity,
}

impl Evidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Evidence::ExternalId => "external_id",
            Evidence::NormalizedKey => "normalized_key",
            Evidence::Similarity => "similarity",
        }
    }
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Evidence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external_id" => Ok(Evidence::ExternalId),
            "normalized_key" => Ok(Evidence::NormalizedKey),
            "similarity" => Ok(Evidence::Similarity),
            other => Err(format!("unknown evidence kind '{}'", other)),
        }
    }
}

/// A match proposed by a strategy, not yet accepted by the orchestrator.
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    pub track_id: String,
    pub file_id: String,
    pub score: f64,
    pub method: StrategyKind,
    pub evidence: Evidence,
}

/// Best below-threshold candidate seen for a track (near-miss diagnostics).
#[derive(Clone, Debug, PartialEq)]
pub struct NearMiss {
    pub file_id: String,
    pub score: f64,
}

/// Committed correspondence between a track and a library file.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Match {
    pub provider: String,
    pub track_id: String,
    pub file_id: String,
    pub score: f64,
    pub confidence: Confidence,
    pub method: String,
    pub evidence: Evidence,
    pub created_at: String,
}

/// Track left without a match after every strategy ran.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UnmatchedTrack {
    pub provider: String,
    pub track_id: String,
    pub best_score: Option<f64>,
    pub best_file_id: Option<String>,
}

/// Full re-evaluation or newly-added tracks only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Full,
    Incremental,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(RunMode::Full),
            "incremental" => Ok(RunMode::Incremental),
            other => Err(format!("unknown run mode '{}' (expected full or incremental)", other)),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Matches contributed by one strategy, in configured order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyCount {
    pub strategy: String,
    pub matched: usize,
}

/// Per-run summary handed back to callers and optionally written as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub provider: String,
    pub mode: RunMode,
    pub tracks: usize,
    pub files: usize,
    /// New matches committed by this run
    pub matched: usize,
    pub unmatched: usize,
    /// Tracks skipped in incremental mode because a prior run matched them
    pub carried_over: usize,
    pub per_strategy: Vec<StrategyCount>,
    pub per_confidence: BTreeMap<String, usize>,
    pub integrity_warnings: usize,
    pub elapsed_seconds: f64,
}

impl RunSummary {
    pub fn new(provider: &str, mode: RunMode) -> Self {
        Self {
            provider: provider.to_string(),
            mode,
            tracks: 0,
            files: 0,
            matched: 0,
            unmatched: 0,
            carried_over: 0,
            per_strategy: Vec::new(),
            per_confidence: BTreeMap::new(),
            integrity_warnings: 0,
            elapsed_seconds: 0.0,
        }
    }

    /// Calculate match rate over the tracks this run evaluated, as a percentage
    pub fn match_rate(&self) -> f64 {
        let evaluated = self.matched + self.unmatched;
        if evaluated == 0 {
            0.0
        } else {
            100.0 * self.matched as f64 / evaluated as f64
        }
    }

    pub fn record_confidences(&mut self, matches: &[Match]) {
        let mut counts: FxHashMap<Confidence, usize> = FxHashMap::default();
        for m in matches {
            *counts.entry(m.confidence).or_default() += 1;
        }
        for (tier, count) in counts {
            self.per_confidence.insert(tier.as_str().to_string(), count);
        }
    }

    /// Log the summary as pretty JSON
    pub fn log_summary(&self) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            tracing::info!(target: "pipeline", "run summary\n{}", json);
        }
    }

    /// Write the summary to a JSON file
    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
