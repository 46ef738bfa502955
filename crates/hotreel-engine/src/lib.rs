//! Scrape orchestration: job lifecycle, bounded fan-out, related-item expansion and recurrence.

mod cancel;
mod config;
mod controller;
mod executor;
mod expander;
mod fetch;
mod progress;
mod scheduler;
mod settle;

pub use cancel::checkpoint;
pub use config::EngineConfig;
pub use controller::{Orchestrator, OrchestratorStatus, StartError};
pub use executor::{TaskBatch, TaskError, TaskExecutor, TaskOutcome};
pub use expander::{normalize_link, ExpandError, RecommendationExpander};
pub use fetch::{FetchScope, FetchedItem, ItemFetcher, PrimaryFetch};
pub use progress::ProgressHub;
pub use settle::{SettlePolicy, Settled};

pub const CRATE_NAME: &str = "hotreel-engine";

/// Executor bound for the per-seed fan-out.
pub const TOP_LEVEL_CONCURRENCY: usize = 10;
/// Executor bound for related-item fetches, each on its own session.
pub const NESTED_CONCURRENCY: usize = 6;
/// "Reveal more" attempts when the recommendation region shows too few candidates.
pub const MAX_REVEAL_ROUNDS: usize = 3;
