use std::sync::Arc;

use hotreel_adapters::{Extractor, PageAction, ReadyCondition, Session, COMMENT_LIMIT};
use hotreel_core::{Comment, ItemDetail, SeedItem};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{checkpoint, RecommendationExpander, SettlePolicy, TaskError};

/// Whether a fetch may trigger related-item expansion. Expansion is one level deep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    TopLevel,
    Nested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedItem {
    pub detail: ItemDetail,
    pub comments: Vec<Comment>,
}

/// Drives one session through an item page: detail panel, then discussion.
pub struct ItemFetcher {
    extractor: Arc<Extractor>,
    settle: SettlePolicy,
}

impl ItemFetcher {
    pub fn new(extractor: Arc<Extractor>, settle: SettlePolicy) -> Self {
        Self { extractor, settle }
    }

    pub async fn open(
        &self,
        session: &mut dyn Session,
        seed: &SeedItem,
        cancel: &CancellationToken,
    ) -> Result<(), TaskError> {
        checkpoint(cancel)?;
        session
            .navigate(&seed.source_link)
            .await
            .map_err(|e| TaskError::ItemFetch(format!("opening {}: {e}", seed.name)))?;
        checkpoint(cancel)?;
        self.settle.settle(session, ReadyCondition::PageBody).await;
        Ok(())
    }

    /// Opens the item page and reads its detail panel and comments.
    /// A missing detail panel fails the item; missing comments do not.
    pub async fn fetch(
        &self,
        session: &mut dyn Session,
        seed: &SeedItem,
        cancel: &CancellationToken,
    ) -> Result<FetchedItem, TaskError> {
        let detail = self
            .read_detail(session, seed, cancel)
            .await?
            .ok_or_else(|| TaskError::ItemFetch(format!("detail not found for {}", seed.name)))?;

        let comments = self.fetch_comments(session, seed, cancel).await?;
        Ok(FetchedItem { detail, comments })
    }

    /// Same walk as [`ItemFetcher::fetch`], except that a page without a detail panel
    /// still yields its comments.
    pub async fn fetch_available(
        &self,
        session: &mut dyn Session,
        seed: &SeedItem,
        cancel: &CancellationToken,
    ) -> Result<(Option<ItemDetail>, Vec<Comment>), TaskError> {
        let detail = self.read_detail(session, seed, cancel).await?;
        if detail.is_none() {
            debug!(item = %seed.name, "no detail panel, collecting comments only");
        }
        let comments = self.fetch_comments(session, seed, cancel).await?;
        Ok((detail, comments))
    }

    async fn read_detail(
        &self,
        session: &mut dyn Session,
        seed: &SeedItem,
        cancel: &CancellationToken,
    ) -> Result<Option<ItemDetail>, TaskError> {
        self.open(session, seed, cancel).await?;

        session
            .perform(PageAction::OpenDetailPanel)
            .await
            .map_err(|e| TaskError::ItemFetch(format!("detail panel of {}: {e}", seed.name)))?;
        let markup = session
            .current_content()
            .await
            .map_err(|e| TaskError::ItemFetch(format!("reading {}: {e}", seed.name)))?;
        Ok(self.extractor.extract_item_detail(&markup))
    }

    /// Only a stop request is an error here; anything else yields no comments.
    pub async fn fetch_comments(
        &self,
        session: &mut dyn Session,
        seed: &SeedItem,
        cancel: &CancellationToken,
    ) -> Result<Vec<Comment>, TaskError> {
        match self.open(session, seed, cancel).await {
            Ok(()) => {}
            Err(TaskError::UserStopped) => return Err(TaskError::UserStopped),
            Err(err) => {
                warn!(item = %seed.name, error = %err, "comments unavailable");
                return Ok(Vec::new());
            }
        }

        if let Err(err) = session.perform(PageAction::OpenDiscussionTab).await {
            warn!(item = %seed.name, error = %err, "discussion tab unavailable");
            return Ok(Vec::new());
        }
        checkpoint(cancel)?;
        self.settle.settle(session, ReadyCondition::Comments).await;
        if let Err(err) = session.perform(PageAction::ExpandCollapsedComments).await {
            debug!(item = %seed.name, error = %err, "collapsed comments left as is");
        }

        match session.current_content().await {
            Ok(markup) => Ok(self.extractor.extract_comments(&markup, COMMENT_LIMIT)),
            Err(err) => {
                warn!(item = %seed.name, error = %err, "comments unavailable");
                Ok(Vec::new())
            }
        }
    }
}

/// Fetch of a seed item on the primary session, expanding its related items first.
pub struct PrimaryFetch {
    fetcher: Arc<ItemFetcher>,
    expander: Arc<RecommendationExpander>,
}

impl PrimaryFetch {
    pub fn new(fetcher: Arc<ItemFetcher>, expander: Arc<RecommendationExpander>) -> Self {
        Self { fetcher, expander }
    }

    pub async fn run(
        &self,
        session: &mut dyn Session,
        seed: &SeedItem,
        cancel: &CancellationToken,
    ) -> Result<FetchedItem, TaskError> {
        self.fetcher.open(session, seed, cancel).await?;
        match self
            .expander
            .expand(session, seed, FetchScope::TopLevel, cancel)
            .await
        {
            Ok(Some(stored)) => debug!(item = %seed.name, rows = stored.rows, "related items stored"),
            Ok(None) => debug!(item = %seed.name, "no related items stored"),
            Err(err) => warn!(item = %seed.name, error = %err, "related expansion skipped"),
        }
        // expansion may have moved the page, so the item is reopened
        self.fetcher.fetch(session, seed, cancel).await
    }
}
