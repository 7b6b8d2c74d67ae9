//! Confidence classification.
//!
//! Stateless so reporting code can re-tier stored matches from their score
//! and evidence without re-running any strategy.

use crate::models::{Confidence, Evidence};

/// Lower bound of the HIGH tier for string-based evidence
pub const HIGH_FLOOR: f64 = 0.85;

/// Lower bound of the MODERATE tier
pub const MODERATE_FLOOR: f64 = 0.70;

/// Map a score and its evidence to a confidence tier.
///
/// CERTAIN is only reachable through external identifier corroboration and
/// does not depend on the score. Everything else is tiered by score alone.
pub fn classify(score: f64, evidence: Evidence) -> Confidence {
    match evidence {
        Evidence::ExternalId => Confidence::Certain,
        Evidence::NormalizedKey | Evidence::Similarity => {
            if score >= HIGH_FLOOR {
                Confidence::High
            } else if score >= MODERATE_FLOOR {
                Confidence::Moderate
            } else {
                Confidence::Low
            }
        }
    }
}
