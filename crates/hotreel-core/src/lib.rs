//! Core domain model for HOTREEL scrape runs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hotreel-core";

pub const MIN_ITEM_COUNT: u32 = 1;
pub const MAX_ITEM_COUNT: u32 = 20;
pub const MIN_UPDATE_INTERVAL_MINUTES: u32 = 30;
/// Interval used when auto-update is requested without one.
pub const DEFAULT_UPDATE_INTERVAL_MINUTES: u32 = 30;

/// Poster used when a listing card carries no image.
pub const DEFAULT_POSTER_URL: &str = "static/default-poster.svg";
pub const DEFAULT_RATING: &str = "No rating yet";
pub const DEFAULT_RATING_COUNT: &str = "No reviews";
pub const DEFAULT_DESCRIPTION: &str = "No description";
pub const DEFAULT_CAST: &str = "No cast information";

/// Parameters of one scrape run, as accepted by the trigger surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub item_count: u32,
    pub headless: bool,
    pub auto_update: bool,
    pub update_interval_minutes: Option<u32>,
}

impl ScrapeConfig {
    pub fn once(item_count: u32, headless: bool) -> Self {
        Self {
            item_count,
            headless,
            auto_update: false,
            update_interval_minutes: None,
        }
    }

    pub fn recurring(item_count: u32, headless: bool, interval_minutes: u32) -> Self {
        Self {
            item_count,
            headless,
            auto_update: true,
            update_interval_minutes: Some(interval_minutes),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_ITEM_COUNT..=MAX_ITEM_COUNT).contains(&self.item_count) {
            return Err(ConfigError::ItemCountOutOfRange(self.item_count));
        }
        if self.auto_update {
            match self.update_interval_minutes {
                None => return Err(ConfigError::MissingInterval),
                Some(minutes) if minutes < MIN_UPDATE_INTERVAL_MINUTES => {
                    return Err(ConfigError::IntervalTooShort(minutes));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Interval for the recurrence timer, only when auto-update is on.
    pub fn recurrence_minutes(&self) -> Option<u32> {
        if self.auto_update {
            self.update_interval_minutes
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("item count must be between {MIN_ITEM_COUNT} and {MAX_ITEM_COUNT}, got {0}")]
    ItemCountOutOfRange(u32),
    #[error("auto update requires an update interval")]
    MissingInterval,
    #[error("update interval must be at least {MIN_UPDATE_INTERVAL_MINUTES} minutes, got {0}")]
    IntervalTooShort(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Running,
    StopRequested,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Running | JobState::StopRequested)
    }
}

/// Why a run ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RunFailure {
    #[error("could not acquire a session: {0}")]
    AcquisitionFailure(String),
    #[error("no seed items found on the listing view")]
    NoSeedsFound,
    #[error("stopped by user before any item completed")]
    UserStopped,
    #[error("no item completed successfully")]
    NoResults,
    #[error("saving results failed: {0}")]
    PersistenceFailure(String),
    #[error("run aborted: {0}")]
    Aborted(String),
}

/// Location and integrity data for a flushed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBatch {
    pub path: PathBuf,
    pub rows: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub records: usize,
    pub skipped: usize,
    pub stored: Option<StoredBatch>,
    pub failure: Option<RunFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub state: JobState,
    pub config: ScrapeConfig,
    pub started_at: DateTime<Utc>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

impl ScrapeJob {
    pub fn start(config: ScrapeConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: JobState::Running,
            config,
            started_at: Utc::now(),
            last_completed_at: None,
            outcome: None,
        }
    }

    pub fn finish(&mut self, outcome: RunOutcome) {
        self.state = if outcome.failure.is_some() {
            JobState::Failed
        } else {
            JobState::Completed
        };
        self.last_completed_at = Some(Utc::now());
        self.outcome = Some(outcome);
    }
}

/// Minimally identified unit of work discovered on the listing view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedItem {
    pub name: String,
    pub source_link: String,
    pub poster_url: String,
}

/// Fields read from an item's detail panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub rating: String,
    pub rating_count: String,
    pub description: String,
    pub cast: String,
}

impl Default for ItemDetail {
    fn default() -> Self {
        Self {
            rating: DEFAULT_RATING.to_string(),
            rating_count: DEFAULT_RATING_COUNT.to_string(),
            description: DEFAULT_DESCRIPTION.to_string(),
            cast: DEFAULT_CAST.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub nickname: String,
    pub user_id: Option<String>,
    pub avatar_url: Option<String>,
    pub time: String,
    pub content: String,
    pub like_count: String,
}

/// Enriched result of one top-level fetch task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub name: String,
    pub link: String,
    pub poster_url: String,
    pub rating: String,
    pub rating_count: String,
    pub description: String,
    pub cast: String,
    pub comments: Vec<Comment>,
}

impl ItemRecord {
    pub fn assemble(seed: &SeedItem, detail: ItemDetail, comments: Vec<Comment>) -> Self {
        Self {
            name: seed.name.clone(),
            link: seed.source_link.clone(),
            poster_url: seed.poster_url.clone(),
            rating: detail.rating,
            rating_count: detail.rating_count,
            description: detail.description,
            cast: detail.cast,
            comments,
        }
    }
}

/// Candidate found in an item's recommendation region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedItem {
    pub name: String,
    pub source_link: String,
    pub poster_url: String,
    pub kind: Option<String>,
    pub episode_label: Option<String>,
}

impl RelatedItem {
    pub fn as_seed(&self) -> SeedItem {
        SeedItem {
            name: self.name.clone(),
            source_link: self.source_link.clone(),
            poster_url: self.poster_url.clone(),
        }
    }
}

/// A related item after its nested fetch; `detail` stays empty when the fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedRecord {
    pub item: RelatedItem,
    pub detail: Option<ItemDetail>,
    pub comments: Vec<Comment>,
}

impl RelatedRecord {
    pub fn bare(item: RelatedItem) -> Self {
        Self {
            item,
            detail: None,
            comments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressKind {
    Update,
    Finished { success: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: Option<Uuid>,
    pub at: DateTime<Utc>,
    pub kind: ProgressKind,
    pub message: String,
}

impl ProgressEvent {
    pub fn update(job_id: Option<Uuid>, message: impl Into<String>) -> Self {
        Self {
            job_id,
            at: Utc::now(),
            kind: ProgressKind::Update,
            message: message.into(),
        }
    }

    pub fn finished(job_id: Uuid, success: bool, message: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id),
            at: Utc::now(),
            kind: ProgressKind::Finished { success },
            message: message.into(),
        }
    }
}
