//! Matching configuration.
//!
//! Loaded from defaults, an optional TOML file, then `TRACKMATCH_`-prefixed
//! environment variables. `validate` must pass before the pipeline touches
//! any data.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MatchError, Result};
use crate::strategy::StrategyKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Similarity floor for fuzzy acceptance
    pub fuzzy_threshold: f64,
    /// Bonus for near-identical (but not identical) keys
    pub exact_bonus: f64,
    /// Raw similarity at or above which the exact bonus applies
    pub near_exact_threshold: f64,
    pub album_match_bonus: f64,
    /// Only applied when `use_year` is set
    pub year_bonus: f64,
    pub use_year: bool,
    /// Duration pruning window in seconds, inclusive on both sides
    pub duration_tolerance: f64,
    /// Keys shorter than this never earn CERTAIN from the exact strategy
    pub short_key_length: usize,
    /// Active strategies in precedence order
    pub strategies: Vec<String>,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.78,
            exact_bonus: 0.05,
            near_exact_threshold: 0.90,
            album_match_bonus: 0.04,
            year_bonus: 0.02,
            use_year: false,
            duration_tolerance: 2.0,
            short_key_length: 6,
            strategies: vec![
                "sql_exact".to_string(),
                "duration_filter".to_string(),
                "fuzzy".to_string(),
            ],
        }
    }
}

impl MatchConfig {
    /// Check every option and resolve the strategy order.
    pub fn validate(&self) -> Result<Vec<StrategyKind>> {
        check_unit_interval("fuzzy_threshold", self.fuzzy_threshold)?;
        check_unit_interval("near_exact_threshold", self.near_exact_threshold)?;
        check_non_negative("exact_bonus", self.exact_bonus)?;
        check_non_negative("album_match_bonus", self.album_match_bonus)?;
        check_non_negative("year_bonus", self.year_bonus)?;
        check_non_negative("duration_tolerance", self.duration_tolerance)?;

        if self.strategies.is_empty() {
            return Err(MatchError::config("strategies", "at least one strategy is required"));
        }

        let mut order: Vec<StrategyKind> = Vec::with_capacity(self.strategies.len());
        for name in &self.strategies {
            let kind: StrategyKind = name
                .parse()
                .map_err(|reason: String| MatchError::config("strategies", reason))?;
            if order.contains(&kind) {
                return Err(MatchError::config(
                    "strategies",
                    format!("strategy '{}' listed more than once", name),
                ));
            }
            order.push(kind);
        }
        Ok(order)
    }

    /// Duration tolerance in whole milliseconds.
    pub fn duration_tolerance_ms(&self) -> i64 {
        (self.duration_tolerance * 1000.0).round() as i64
    }
}

fn check_unit_interval(key: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(MatchError::config(key, format!("{} is outside [0, 1]", value)));
    }
    Ok(())
}

fn check_non_negative(key: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(MatchError::config(key, format!("{} must be a non-negative number", value)));
    }
    Ok(())
}

/// Load configuration from defaults, optional TOML file, and environment overrides (prefix: TRACKMATCH_).
pub fn load(config_path: Option<&Path>) -> anyhow::Result<MatchConfig> {
    let mut figment = Figment::from(Serialized::defaults(MatchConfig::default()));

    if let Some(path) = config_path {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("TRACKMATCH_"));

    let config: MatchConfig = figment.extract()?;
    info!(target: "config", strategies = ?config.strategies, "configuration loaded");
    Ok(config)
}
