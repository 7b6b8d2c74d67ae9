//! Duration filter: candidate pruning gate for fuzzy matching.
//!
//! Emits no matches. It leaves behind a [`DurationGate`] that later fuzzy
//! scoring consults to narrow each track's candidate pool to files within the
//! tolerance window. Tracks without a duration are not narrowed. Files
//! without a duration cannot be ruled out, so they appear in every window.

use tracing::{debug, warn};

use crate::models::LibraryFile;
use crate::strategy::{check_unique_ids, StrategyFailure, StrategyInput, StrategyOutcome};

/// Files sorted by duration for window lookups.
#[derive(Debug, Clone)]
pub struct DurationGate {
    /// (duration_ms, index into the file slice), ascending
    sorted: Vec<(i64, usize)>,
    /// Files without a duration, ascending by index
    unknown: Vec<usize>,
    tolerance_ms: i64,
    file_count: usize,
}

impl DurationGate {
    pub fn build(files: &[LibraryFile], tolerance_ms: i64) -> Self {
        let mut sorted = Vec::with_capacity(files.len());
        let mut unknown = Vec::new();
        for (i, file) in files.iter().enumerate() {
            match file.duration_ms {
                Some(d) => sorted.push((d, i)),
                None => unknown.push(i),
            }
        }
        sorted.sort_unstable();
        Self {
            sorted,
            unknown,
            tolerance_ms,
            file_count: files.len(),
        }
    }

    /// Size of the file slice this gate was built over
    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn tolerance_ms(&self) -> i64 {
        self.tolerance_ms
    }

    /// Number of files that carry a duration
    pub fn indexed(&self) -> usize {
        self.sorted.len()
    }

    /// File indices whose duration lies in `[duration_ms - tol, duration_ms + tol]`,
    /// followed by every file without a duration.
    pub fn window(&self, duration_ms: i64) -> impl Iterator<Item = usize> + '_ {
        let lo = duration_ms.saturating_sub(self.tolerance_ms);
        let hi = duration_ms.saturating_add(self.tolerance_ms);
        let start = self.sorted.partition_point(|(d, _)| *d < lo);
        let end = self.sorted.partition_point(|(d, _)| *d <= hi);
        self.sorted[start..end.max(start)]
            .iter()
            .map(|(_, i)| *i)
            .chain(self.unknown.iter().copied())
    }
}

pub fn run(input: &StrategyInput<'_>) -> Result<StrategyOutcome, StrategyFailure> {
    check_unique_ids(input.tracks, input.files)?;

    let gate = DurationGate::build(input.files, input.config.duration_tolerance_ms());
    let missing = input.files.len() - gate.indexed();
    if missing > 0 {
        warn!(
            target: "strategy",
            strategy = "duration_filter",
            files = missing,
            "files without duration cannot be pruned and pass every window"
        );
    }

    let mut gated = 0;
    let mut empty_windows = 0;
    for track in input.tracks {
        if input.already_matched.contains(&track.id) {
            continue;
        }
        if let Some(duration) = track.duration_ms {
            gated += 1;
            if gate.window(duration).next().is_none() {
                empty_windows += 1;
            }
        }
    }
    debug!(
        target: "strategy",
        strategy = "duration_filter",
        tolerance_ms = gate.tolerance_ms(),
        gated,
        empty_windows,
        "duration gate built"
    );

    Ok(StrategyOutcome {
        gate: Some(gate),
        warnings: missing,
        ..Default::default()
    })
}
