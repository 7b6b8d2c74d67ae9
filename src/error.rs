use thiserror::Error;

pub type Result<T> = std::result::Result<T, MatchError>;

/// Fatal conditions for a matching run. A run that returns any of these has
/// committed nothing.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("Invalid configuration for '{key}': {reason}")]
    Configuration { key: String, reason: String },

    #[error("Strategy '{strategy}' failed after resolving {resolved} tracks: {reason}")]
    StrategyExecution {
        strategy: String,
        resolved: usize,
        reason: String,
    },

    #[error("Failed to read catalog: {0}")]
    Storage(#[source] rusqlite::Error),

    #[error("Failed to persist match set: {0}")]
    Persistence(#[source] rusqlite::Error),

    #[error("Run cancelled after {completed} strategies")]
    Cancelled { completed: usize },
}

impl MatchError {
    pub fn config(key: &str, reason: impl Into<String>) -> Self {
        MatchError::Configuration {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}
