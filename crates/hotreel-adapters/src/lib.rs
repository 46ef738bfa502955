//! Session (agent) contracts, the HTTP-backed session pool and markup extraction.

use std::time::Duration;

use async_trait::async_trait;
use hotreel_storage::SessionToken;
use thiserror::Error;

mod extract;
mod http_session;

pub use extract::{ExtractError, Extractor, COMMENT_LIMIT, RELATED_LIMIT};
pub use http_session::{
    classify_reqwest_error, classify_status, BackoffPolicy, HttpSession, HttpSessionConfig,
    HttpSessionPool, RetryDisposition,
};

pub const CRATE_NAME: &str = "hotreel-adapters";

/// What a settle wait is waiting to see on the current page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyCondition {
    PageBody,
    Recommendations,
    Comments,
}

impl ReadyCondition {
    pub fn selector(self) -> &'static str {
        match self {
            ReadyCondition::PageBody => "body",
            ReadyCondition::Recommendations => "#recommend_bk",
            ReadyCondition::Comments => r#"div[id^="comment"]"#,
        }
    }
}

/// Interactive steps a session can take on the loaded page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAction {
    OpenHottestTab,
    OpenDetailPanel,
    OpenDiscussionTab,
    ExpandCollapsedComments,
    RevealMore,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not launch session: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("action {action:?} unavailable: {reason}")]
    ActionUnavailable { action: PageAction, reason: String },
    #[error("no page loaded")]
    NoPage,
    #[error("stored session token {name} rejected: {reason}")]
    InvalidToken { name: String, reason: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One stateful browsing context.
#[async_trait]
pub trait Session: Send {
    fn id(&self) -> u64;

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// Resolves `true` once `condition` holds, `false` if it did not within `timeout`.
    async fn wait_for_ready(
        &mut self,
        condition: ReadyCondition,
        timeout: Duration,
    ) -> Result<bool, SessionError>;

    async fn current_content(&mut self) -> Result<String, SessionError>;

    async fn apply_stored_session(&mut self, tokens: &[SessionToken]) -> Result<(), SessionError>;

    async fn perform(&mut self, action: PageAction) -> Result<(), SessionError>;
}

pub type BoxedSession = Box<dyn Session>;

/// Hands out sessions; each live session is one unit of concurrency capacity.
#[async_trait]
pub trait SessionPool: Send + Sync {
    async fn acquire(&self, headless: bool) -> Result<BoxedSession, SessionError>;

    async fn release(&self, session: BoxedSession);
}
