//! The job controller: one active run at a time, start/stop, and the run body itself.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hotreel_adapters::{
    BoxedSession, Extractor, HttpSessionPool, PageAction, ReadyCondition, SessionPool,
};
use hotreel_core::{
    ConfigError, ItemRecord, JobState, ProgressEvent, RunFailure, RunOutcome, ScrapeConfig,
    ScrapeJob, SeedItem,
};
use hotreel_storage::{
    load_session_tokens_if_present, ParquetResultStore, ResultBatch, ResultSink,
};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::executor::panic_message;
use crate::scheduler::ArmedTimer;
use crate::{
    checkpoint, EngineConfig, ItemFetcher, PrimaryFetch, ProgressHub, RecommendationExpander,
    SettlePolicy, TaskError, TaskExecutor, TaskOutcome,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartError {
    #[error(transparent)]
    Invalid(#[from] ConfigError),
    #[error("a scrape job is already running ({0})")]
    AlreadyRunning(Uuid),
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub is_running: bool,
    pub active: Option<ScrapeJob>,
    pub last_job: Option<ScrapeJob>,
    pub next_update_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
}

pub(crate) struct ActiveJob {
    pub(crate) job: ScrapeJob,
    pub(crate) cancel: CancellationToken,
}

/// Process-wide run and timer slots. Only touched with the controller's lock held.
#[derive(Default)]
pub(crate) struct OrchestratorState {
    pub(crate) active: Option<ActiveJob>,
    pub(crate) last_job: Option<ScrapeJob>,
    pub(crate) timer: Option<ArmedTimer>,
    pub(crate) stop_requested: bool,
    pub(crate) last_update: Option<DateTime<Utc>>,
}

impl OrchestratorState {
    pub(crate) fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

pub(crate) struct Inner {
    pub(crate) pool: Arc<dyn SessionPool>,
    pub(crate) sink: Arc<dyn ResultSink>,
    pub(crate) extractor: Arc<Extractor>,
    pub(crate) config: EngineConfig,
    pub(crate) progress: ProgressHub,
    pub(crate) state: Mutex<OrchestratorState>,
    pub(crate) running: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<dyn SessionPool>,
        sink: Arc<dyn ResultSink>,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        let extractor = Extractor::new(&config.home_url)?;
        let (running, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                sink,
                extractor: Arc::new(extractor),
                config,
                progress: ProgressHub::new(),
                state: Mutex::new(OrchestratorState::default()),
                running,
            }),
        })
    }

    /// HTTP session pool plus parquet store under the configured data directory.
    pub fn with_default_adapters(config: EngineConfig) -> anyhow::Result<Self> {
        let pool = HttpSessionPool::new(config.http_session_config())?;
        let sink = ParquetResultStore::new(config.data_dir.clone());
        Self::new(Arc::new(pool), Arc::new(sink), config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.subscribe()
    }

    pub async fn start(&self, config: ScrapeConfig) -> Result<Uuid, StartError> {
        config.validate()?;
        let mut state = self.inner.state.lock().await;
        let id = self.start_locked(&mut state, config)?;
        state.stop_requested = false;
        Ok(id)
    }

    /// Requests a cooperative stop of the active run and disarms recurrence.
    /// Returns whether a run was active.
    pub async fn stop(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        state.stop_requested = true;
        state.disarm_timer();
        match state.active.as_mut() {
            Some(active) => {
                active.cancel.cancel();
                active.job.state = JobState::StopRequested;
                self.inner
                    .progress
                    .update(Some(active.job.id), "stop requested, finishing in-flight items");
                true
            }
            None => {
                self.inner.progress.update(None, "stop requested, nothing running");
                false
            }
        }
    }

    pub async fn status(&self) -> OrchestratorStatus {
        let state = self.inner.state.lock().await;
        OrchestratorStatus {
            is_running: state.active.is_some(),
            active: state.active.as_ref().map(|a| a.job.clone()),
            last_job: state.last_job.clone(),
            next_update_at: state.timer.as_ref().map(ArmedTimer::due_at),
            last_update_at: state.last_update,
        }
    }

    /// Resolves once no run is active.
    pub async fn wait_idle(&self) {
        let mut running = self.inner.running.subscribe();
        // the sender lives in `inner`, so this only errors if `self` is gone
        let _ = running.wait_for(|active| !*active).await;
    }

    pub(crate) fn start_locked(
        &self,
        state: &mut OrchestratorState,
        config: ScrapeConfig,
    ) -> Result<Uuid, StartError> {
        if let Some(active) = &state.active {
            return Err(StartError::AlreadyRunning(active.job.id));
        }

        let job = ScrapeJob::start(config);
        let cancel = CancellationToken::new();
        let job_id = job.id;
        state.active = Some(ActiveJob {
            job: job.clone(),
            cancel: cancel.clone(),
        });
        self.inner.running.send_replace(true);

        if let Some(minutes) = config.recurrence_minutes() {
            self.arm_timer(state, config, minutes);
        }

        let span = info_span!("scrape_run", job_id = %job_id, items = config.item_count);
        let this = self.clone();
        tokio::spawn(async move { this.run(job, cancel).await }.instrument(span));
        info!(job_id = %job_id, "scrape job started");
        Ok(job_id)
    }

    async fn run(self, mut job: ScrapeJob, cancel: CancellationToken) {
        let job_id = job.id;
        // the slot below must be released however the body ends
        let outcome = match AssertUnwindSafe(self.execute(job_id, job.config, &cancel))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(reason = %reason, "scrape run panicked");
                failed(RunFailure::Aborted(reason))
            }
        };
        let success = outcome.failure.is_none();
        let message = match (&outcome.failure, &outcome.stored) {
            (Some(failure), _) => format!("scrape failed: {failure}"),
            (None, Some(stored)) => format!(
                "scrape complete: {} items saved to {}",
                stored.rows,
                stored.path.display()
            ),
            (None, None) => format!("scrape complete: {} items", outcome.records),
        };
        job.finish(outcome);

        let mut state = self.inner.state.lock().await;
        if state.active.as_ref().map(|a| a.job.id) == Some(job_id) {
            state.active = None;
        }
        state.last_job = Some(job);
        self.inner
            .progress
            .emit(ProgressEvent::finished(job_id, success, message));
        self.inner.running.send_replace(state.active.is_some());
    }

    async fn execute(
        &self,
        job_id: Uuid,
        config: ScrapeConfig,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let inner = &self.inner;
        let progress = |message: String| inner.progress.update(Some(job_id), message);

        let mut session = match inner.pool.acquire(config.headless).await {
            Ok(session) => session,
            Err(err) => {
                progress(format!("could not start a session: {err}"));
                return failed(RunFailure::AcquisitionFailure(err.to_string()));
            }
        };
        progress("session acquired".to_string());

        let seeds = match self.discover_seeds(&mut session, config, cancel).await {
            Ok(seeds) => seeds,
            Err(failure) => {
                inner.pool.release(session).await;
                progress(format!("seed discovery failed: {failure}"));
                return failed(failure);
            }
        };
        if seeds.is_empty() {
            inner.pool.release(session).await;
            progress("no items found on the hottest list".to_string());
            return failed(RunFailure::NoSeedsFound);
        }
        progress(format!("found {} items", seeds.len()));

        let primary = Arc::new(Mutex::new(Some(session)));
        let (records, skipped) = self
            .fan_out(job_id, config, seeds, Arc::clone(&primary), cancel)
            .await;

        if let Some(session) = primary.lock().await.take() {
            inner.pool.release(session).await;
        }

        if records.is_empty() {
            let failure = if cancel.is_cancelled() {
                RunFailure::UserStopped
            } else {
                RunFailure::NoResults
            };
            progress(format!("nothing to save: {failure}"));
            return RunOutcome {
                skipped,
                failure: Some(failure),
                ..RunOutcome::default()
            };
        }

        match inner
            .sink
            .append_batch(ResultBatch::Primary(&records), Utc::now())
            .await
        {
            Ok(stored) => {
                progress(format!(
                    "saved {} items to {}",
                    stored.rows,
                    stored.path.display()
                ));
                RunOutcome {
                    records: records.len(),
                    skipped,
                    stored: Some(stored),
                    failure: None,
                }
            }
            Err(err) => {
                progress(format!("saving results failed: {err}"));
                RunOutcome {
                    records: records.len(),
                    skipped,
                    stored: None,
                    failure: Some(RunFailure::PersistenceFailure(err.to_string())),
                }
            }
        }
    }

    /// Home page, stored session, hottest tab, then the seed list.
    async fn discover_seeds(
        &self,
        session: &mut BoxedSession,
        config: ScrapeConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<SeedItem>, RunFailure> {
        let inner = &self.inner;
        let home = inner.config.home_url.as_str();
        let settle = SettlePolicy::new(inner.config.settle_timeout);
        let open_home = |err: hotreel_adapters::SessionError| {
            RunFailure::AcquisitionFailure(format!("opening {home}: {err}"))
        };

        session.navigate(home).await.map_err(open_home)?;
        settle.settle(session.as_mut(), ReadyCondition::PageBody).await;

        let tokens = load_session_tokens_if_present(&inner.config.cookies_path).unwrap_or_else(|err| {
            warn!(error = %err, "ignoring unreadable stored session");
            Vec::new()
        });
        if !tokens.is_empty() {
            match session.apply_stored_session(&tokens).await {
                Ok(()) => info!(tokens = tokens.len(), "stored session applied"),
                Err(err) => warn!(error = %err, "stored session rejected"),
            }
            session.navigate(home).await.map_err(open_home)?;
            settle.settle(session.as_mut(), ReadyCondition::PageBody).await;
        }

        checkpoint(cancel).map_err(|_| RunFailure::UserStopped)?;
        if let Err(err) = session.perform(PageAction::OpenHottestTab).await {
            warn!(error = %err, "hottest tab unavailable, using the current listing");
        }
        settle.settle(session.as_mut(), ReadyCondition::PageBody).await;

        let markup = session
            .current_content()
            .await
            .map_err(|e| RunFailure::AcquisitionFailure(format!("reading listing: {e}")))?;
        Ok(inner
            .extractor
            .extract_seed_list(&markup, config.item_count as usize))
    }

    async fn fan_out(
        &self,
        job_id: Uuid,
        config: ScrapeConfig,
        seeds: Vec<SeedItem>,
        primary: Arc<Mutex<Option<BoxedSession>>>,
        cancel: &CancellationToken,
    ) -> (Vec<ItemRecord>, usize) {
        let inner = &self.inner;
        let page_settle = SettlePolicy::new(inner.config.settle_timeout);
        let expander = Arc::new(RecommendationExpander::new(
            Arc::clone(&inner.pool),
            Arc::clone(&inner.sink),
            Arc::clone(&inner.extractor),
            page_settle,
            SettlePolicy::new(inner.config.recommend_settle_timeout),
            inner.config.nested_concurrency,
            config.headless,
        ));
        let fetcher = Arc::new(ItemFetcher::new(Arc::clone(&inner.extractor), page_settle));
        let task = Arc::new(PrimaryFetch::new(fetcher, expander));
        let hub = inner.progress.clone();

        let fetch_seed = move |seed: SeedItem, cancel: CancellationToken| {
            let primary = Arc::clone(&primary);
            let task = Arc::clone(&task);
            let hub = hub.clone();
            async move {
                let mut guard = primary.lock().await;
                checkpoint(&cancel)?;
                let session = guard
                    .as_mut()
                    .ok_or_else(|| TaskError::ItemFetch("primary session closed".to_string()))?;
                hub.update(Some(job_id), format!("fetching {}", seed.name));
                let fetched = task.run(session.as_mut(), &seed, &cancel).await?;
                Ok::<_, TaskError>(ItemRecord::assemble(&seed, fetched.detail, fetched.comments))
            }
        };

        let total = seeds.len();
        let executor = TaskExecutor::new(inner.config.top_level_concurrency);
        let mut batch = executor.spawn_all(seeds, cancel.clone(), fetch_seed);

        let mut records = Vec::with_capacity(total);
        let mut skipped = 0;
        while let Some(outcome) = batch.next().await {
            match outcome {
                TaskOutcome::Completed { input, output } => {
                    records.push(output);
                    inner.progress.update(
                        Some(job_id),
                        format!("finished {} ({}/{total})", input.name, records.len()),
                    );
                }
                TaskOutcome::Failed { input, error } => {
                    skipped += 1;
                    warn!(item = %input.name, error = %error, "item skipped");
                    inner
                        .progress
                        .update(Some(job_id), format!("skipped {}: {error}", input.name));
                }
                TaskOutcome::Skipped { input } => {
                    skipped += 1;
                    inner
                        .progress
                        .update(Some(job_id), format!("not started {}: stopped", input.name));
                }
            }
        }
        (records, skipped)
    }
}

fn failed(failure: RunFailure) -> RunOutcome {
    RunOutcome {
        failure: Some(failure),
        ..RunOutcome::default()
    }
}
