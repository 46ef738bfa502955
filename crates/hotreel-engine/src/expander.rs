//! Related-item expansion for a fetched primary item.
//!
//! Candidates are read from the primary session's recommendation region. Each one is then
//! fetched on its own freshly acquired session through a nested executor, and the batch is
//! stored beside (never inside) the primary results. Everything here is best-effort for the
//! primary item: the caller logs the error and moves on.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use hotreel_adapters::{Extractor, PageAction, ReadyCondition, Session, SessionPool, RELATED_LIMIT};
use hotreel_core::{RelatedItem, RelatedRecord, SeedItem, StoredBatch};
use hotreel_storage::{PersistenceError, ResultBatch, ResultSink};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::executor::panic_message;
use crate::{
    checkpoint, FetchScope, ItemFetcher, SettlePolicy, TaskError, TaskExecutor, TaskOutcome,
    MAX_REVEAL_ROUNDS,
};

#[derive(Debug, Error)]
pub enum ExpandError {
    #[error("related items are only expanded from top-level items")]
    DepthExceeded,
    #[error("stopped by user")]
    Stopped,
    #[error("no related candidates found")]
    NoCandidates,
    #[error("reading recommendation region: {0}")]
    Region(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Link identity used to dedup candidates across reveal rounds: no fragment, no trailing slash.
pub fn normalize_link(link: &str) -> String {
    let link = link.trim();
    let without_fragment = link.split('#').next().unwrap_or(link);
    without_fragment.trim_end_matches('/').to_string()
}

pub struct RecommendationExpander {
    pool: Arc<dyn SessionPool>,
    sink: Arc<dyn ResultSink>,
    extractor: Arc<Extractor>,
    region_settle: SettlePolicy,
    nested: Arc<ItemFetcher>,
    executor: TaskExecutor,
    headless: bool,
}

impl RecommendationExpander {
    pub fn new(
        pool: Arc<dyn SessionPool>,
        sink: Arc<dyn ResultSink>,
        extractor: Arc<Extractor>,
        page_settle: SettlePolicy,
        region_settle: SettlePolicy,
        max_concurrency: usize,
        headless: bool,
    ) -> Self {
        let nested = Arc::new(ItemFetcher::new(Arc::clone(&extractor), page_settle));
        Self {
            pool,
            sink,
            extractor,
            region_settle,
            nested,
            executor: TaskExecutor::new(max_concurrency),
            headless,
        }
    }

    /// Expands `origin` from the page currently loaded in `session`.
    /// Returns the stored batch, or `None` when every nested fetch was skipped by a stop.
    pub async fn expand(
        &self,
        session: &mut dyn Session,
        origin: &SeedItem,
        scope: FetchScope,
        cancel: &CancellationToken,
    ) -> Result<Option<StoredBatch>, ExpandError> {
        if scope == FetchScope::Nested {
            return Err(ExpandError::DepthExceeded);
        }
        let span = info_span!("expand", origin = %origin.name);
        async {
            let candidates = self.collect_candidates(session, cancel).await?;
            if candidates.is_empty() {
                return Err(ExpandError::NoCandidates);
            }
            info!(candidates = candidates.len(), "fetching related items");

            let records = self.enrich(candidates, cancel).await;
            if records.is_empty() {
                return Ok(None);
            }
            let stored = self
                .sink
                .append_batch(
                    ResultBatch::Related {
                        origin: &origin.name,
                        records: &records,
                    },
                    Utc::now(),
                )
                .await?;
            Ok(Some(stored))
        }
        .instrument(span)
        .await
    }

    async fn collect_candidates(
        &self,
        session: &mut dyn Session,
        cancel: &CancellationToken,
    ) -> Result<Vec<RelatedItem>, ExpandError> {
        checkpoint(cancel).map_err(|_| ExpandError::Stopped)?;
        self.region_settle
            .settle(session, ReadyCondition::Recommendations)
            .await;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        self.merge_from_page(session, &mut seen, &mut candidates).await?;

        let mut rounds = 0;
        while candidates.len() < RELATED_LIMIT && rounds < MAX_REVEAL_ROUNDS {
            rounds += 1;
            checkpoint(cancel).map_err(|_| ExpandError::Stopped)?;
            if let Err(err) = session.perform(PageAction::RevealMore).await {
                debug!(round = rounds, error = %err, "reveal more failed");
                continue;
            }
            self.merge_from_page(session, &mut seen, &mut candidates).await?;
        }
        Ok(candidates)
    }

    async fn merge_from_page(
        &self,
        session: &mut dyn Session,
        seen: &mut HashSet<String>,
        candidates: &mut Vec<RelatedItem>,
    ) -> Result<(), ExpandError> {
        let markup = session
            .current_content()
            .await
            .map_err(|e| ExpandError::Region(e.to_string()))?;
        for item in self.extractor.extract_related_candidates(&markup, RELATED_LIMIT) {
            if candidates.len() >= RELATED_LIMIT {
                break;
            }
            if seen.insert(normalize_link(&item.source_link)) {
                candidates.push(item);
            }
        }
        Ok(())
    }

    async fn enrich(
        &self,
        candidates: Vec<RelatedItem>,
        cancel: &CancellationToken,
    ) -> Vec<RelatedRecord> {
        let pool = Arc::clone(&self.pool);
        let fetcher = Arc::clone(&self.nested);
        let headless = self.headless;

        let fetch_related = move |item: RelatedItem, cancel: CancellationToken| {
            let pool = Arc::clone(&pool);
            let fetcher = Arc::clone(&fetcher);
            async move {
                let mut session = pool
                    .acquire(headless)
                    .await
                    .map_err(|e| TaskError::ItemFetch(format!("session for {}: {e}", item.name)))?;
                let fetched = AssertUnwindSafe(fetcher.fetch_available(
                    session.as_mut(),
                    &item.as_seed(),
                    &cancel,
                ))
                .catch_unwind()
                .await;
                pool.release(session).await;
                let (detail, comments) = match fetched {
                    Ok(result) => result?,
                    Err(payload) => return Err(TaskError::Panicked(panic_message(payload.as_ref()))),
                };
                Ok::<_, TaskError>(RelatedRecord {
                    item,
                    detail,
                    comments,
                })
            }
        };

        let mut batch = self.executor.spawn_all(candidates, cancel.clone(), fetch_related);
        let mut records = Vec::new();
        while let Some(outcome) = batch.next().await {
            match outcome {
                TaskOutcome::Completed { output, .. } => records.push(output),
                TaskOutcome::Failed {
                    error: TaskError::UserStopped,
                    input,
                } => debug!(item = %input.name, "related fetch stopped"),
                TaskOutcome::Failed { input, error } => {
                    warn!(item = %input.name, error = %error, "related fetch failed, keeping card data");
                    records.push(RelatedRecord::bare(input));
                }
                TaskOutcome::Skipped { input } => debug!(item = %input.name, "related fetch not started"),
            }
        }
        records
    }
}
