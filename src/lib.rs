//! Track matching library: reconciles a remote playlist catalog with a local
//! file library through an ordered family of matching strategies.

pub mod confidence;
pub mod config;
pub mod duration_filter;
pub mod error;
pub mod exact;
pub mod fuzzy;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod safety;
pub mod scoring;
pub mod store;
pub mod strategy;

pub use config::MatchConfig;
pub use error::{MatchError, Result};
pub use models::{Confidence, LibraryFile, Match, RunMode, RunSummary, Track, UnmatchedTrack};
pub use pipeline::Pipeline;
pub use store::Store;
pub use strategy::StrategyKind;
