#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hotreel_adapters::{
    BoxedSession, PageAction, ReadyCondition, Session, SessionError, SessionPool,
};
use hotreel_core::{ItemRecord, RelatedRecord, StoredBatch};
use hotreel_engine::{EngineConfig, Orchestrator};
use hotreel_storage::{PersistenceError, ResultBatch, ResultSink, SessionToken};
use tokio::sync::Notify;

pub const HOME: &str = "https://www.iqiyi.com/";

pub fn item_link(i: usize) -> String {
    format!("https://www.iqiyi.com/v_item{i}.html")
}

pub fn related_link(i: usize, j: usize) -> String {
    format!("https://www.iqiyi.com/v_rel{i}_{j}.html")
}

pub fn listing_markup(items: usize) -> String {
    let cards = (0..items)
        .map(|i| {
            format!(
                r#"<div class="flex-video-list_flexTilesItem__bhNS9">
                     <a href="{}"><img class="flex-video-list_poster__x" src="//pic.example/{i}.jpg"></a>
                     <p class="undefined flex-video-list_title__pTUUg">Show {i}</p>
                   </div>"#,
                item_link(i)
            )
        })
        .collect::<String>();
    format!("<html><body>{cards}</body></html>")
}

pub fn item_markup(title: &str, related: &[(String, String)]) -> String {
    let cards = related
        .iter()
        .map(|(name, link)| {
            format!(
                r#"<div style="width: 162px; height: 266px;">
                     <a href="{link}"></a><span class="card_title__a">{name}</span>
                   </div>"#
            )
        })
        .collect::<String>();
    format!(
        r#"<html><body>
             <div class="metaDetail_panel">
               <div class="score_scoreLabel__fYRiV">9.1</div>
               <div class="score_scoreCount__aNzvS">100 ratings</div>
               <div class="metaDetail_infoValue__a">About {title}</div>
               <div class="star-list_name__VSd6I">Lead of {title}</div>
             </div>
             <div id="recommend_bk">{cards}</div>
             <div id="comment1">
               <div class="comments_name__VQiPd">viewer</div>
               <div class="comments_time__00lty">now</div>
               <div class="comments_commentText__D48oR">liked {title}</div>
               <span id="text">5</span>
             </div>
           </body></html>"#
    )
}

/// A page that loads but has no detail panel.
pub fn broken_markup() -> String {
    "<html><body><p>gone</p></body></html>".to_string()
}

/// In-memory site served to every fake session, with instrumentation.
#[derive(Default)]
pub struct FakeSite {
    pages: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    primary_log: Mutex<Vec<(u64, String)>>,
    primary_items: Mutex<Vec<String>>,
    applied_tokens: AtomicUsize,
    reveal_attempts: AtomicUsize,
    nested_delay_ms: AtomicU64,
    gate_at: AtomicUsize,
    pub blocked: Notify,
    release: Notify,
    pub fail_acquire: AtomicBool,
    next_id: AtomicU64,
    acquired: AtomicUsize,
    open: AtomicUsize,
    peak_open: AtomicUsize,
    home_visits: AtomicUsize,
}

impl FakeSite {
    /// Home listing with `items` seeds; each item page lists `related` related items.
    pub fn with_items(items: usize, related: usize) -> Arc<Self> {
        let site = Arc::new(Self::default());
        site.set_page(HOME, listing_markup(items));
        for i in 0..items {
            let links = (0..related)
                .map(|j| (format!("Related {i}-{j}"), related_link(i, j)))
                .collect::<Vec<_>>();
            site.set_page(&item_link(i), item_markup(&format!("Show {i}"), &links));
            for (name, link) in &links {
                site.set_page(link, item_markup(name, &[]));
            }
        }
        site
    }

    pub fn set_page(&self, url: &str, markup: String) {
        self.pages.lock().unwrap().insert(url.to_string(), markup);
    }

    pub fn fail_navigation(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    /// Navigating to `url` panics inside the session.
    pub fn panic_navigation(&self, url: &str) {
        self.panicking.lock().unwrap().insert(url.to_string());
    }

    /// Blocks the primary session on the `n`th distinct item it opens (1-based)
    /// until [`FakeSite::release_gate`].
    pub fn gate_at(&self, n: usize) {
        self.gate_at.store(n, Ordering::SeqCst);
    }

    pub fn release_gate(&self) {
        self.release.notify_one();
    }

    pub fn set_nested_delay(&self, delay: Duration) {
        self.nested_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn primary_log(&self) -> Vec<(u64, String)> {
        self.primary_log.lock().unwrap().clone()
    }

    pub fn applied_tokens(&self) -> usize {
        self.applied_tokens.load(Ordering::SeqCst)
    }

    pub fn reveal_attempts(&self) -> usize {
        self.reveal_attempts.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn open_sessions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peak_open(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    /// Navigations to the home page, i.e. run starts (plus stored-session reloads).
    pub fn home_visits(&self) -> usize {
        self.home_visits.load(Ordering::SeqCst)
    }
}

pub struct FakeSession {
    id: u64,
    site: Arc<FakeSite>,
    current: Option<String>,
    primary: bool,
}

#[async_trait]
impl Session for FakeSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        if url == HOME {
            self.primary = true;
            self.site.home_visits.fetch_add(1, Ordering::SeqCst);
        }

        if self.primary && url != HOME {
            self.site
                .primary_log
                .lock()
                .unwrap()
                .push((self.id, url.to_string()));
            let newly_opened = {
                let mut items = self.site.primary_items.lock().unwrap();
                if items.iter().any(|seen| seen == url) {
                    None
                } else {
                    items.push(url.to_string());
                    Some(items.len())
                }
            };
            if newly_opened.is_some() && newly_opened == Some(self.site.gate_at.load(Ordering::SeqCst)) {
                self.site.blocked.notify_one();
                self.site.release.notified().await;
            }
            tokio::task::yield_now().await;
        } else if !self.primary {
            let delay = self.site.nested_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        let panics = self.site.panicking.lock().unwrap().contains(url);
        if panics {
            panic!("session crashed loading {url}");
        }
        if self.site.failing.lock().unwrap().contains(url) {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        let page = self.site.pages.lock().unwrap().get(url).cloned();
        match page {
            Some(markup) => {
                self.current = Some(markup);
                Ok(())
            }
            None => Err(SessionError::Navigation {
                url: url.to_string(),
                reason: "http status 404".to_string(),
            }),
        }
    }

    async fn wait_for_ready(
        &mut self,
        _condition: ReadyCondition,
        _timeout: Duration,
    ) -> Result<bool, SessionError> {
        Ok(self.current.is_some())
    }

    async fn current_content(&mut self) -> Result<String, SessionError> {
        self.current.clone().ok_or(SessionError::NoPage)
    }

    async fn apply_stored_session(&mut self, tokens: &[SessionToken]) -> Result<(), SessionError> {
        self.site
            .applied_tokens
            .fetch_add(tokens.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn perform(&mut self, action: PageAction) -> Result<(), SessionError> {
        if action == PageAction::RevealMore {
            self.site.reveal_attempts.fetch_add(1, Ordering::SeqCst);
        }
        if self.current.is_none() {
            return Err(SessionError::ActionUnavailable {
                action,
                reason: "no page loaded".to_string(),
            });
        }
        Ok(())
    }
}

pub struct FakePool {
    site: Arc<FakeSite>,
}

impl FakePool {
    pub fn new(site: Arc<FakeSite>) -> Self {
        Self { site }
    }
}

#[async_trait]
impl SessionPool for FakePool {
    async fn acquire(&self, _headless: bool) -> Result<BoxedSession, SessionError> {
        if self.site.fail_acquire.load(Ordering::SeqCst) {
            return Err(SessionError::Launch("browser binary missing".to_string()));
        }
        let id = self.site.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.site.acquired.fetch_add(1, Ordering::SeqCst);
        let open = self.site.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.site.peak_open.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            id,
            site: Arc::clone(&self.site),
            current: None,
            primary: false,
        }))
    }

    async fn release(&self, session: BoxedSession) {
        drop(session);
        self.site.open.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub enum RecordedBatch {
    Primary(Vec<ItemRecord>),
    Related {
        origin: String,
        records: Vec<RelatedRecord>,
    },
}

#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<RecordedBatch>>,
    pub fail_primary: AtomicBool,
    pub panic_primary: AtomicBool,
}

impl MemorySink {
    pub fn primary_batches(&self) -> Vec<Vec<ItemRecord>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter_map(|b| match b {
                RecordedBatch::Primary(records) => Some(records.clone()),
                RecordedBatch::Related { .. } => None,
            })
            .collect()
    }

    pub fn related_batches(&self) -> Vec<(String, Vec<RelatedRecord>)> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .filter_map(|b| match b {
                RecordedBatch::Related { origin, records } => Some((origin.clone(), records.clone())),
                RecordedBatch::Primary(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn append_batch(
        &self,
        batch: ResultBatch<'_>,
        _at: DateTime<Utc>,
    ) -> Result<StoredBatch, PersistenceError> {
        let recorded = match batch {
            ResultBatch::Primary(records) => {
                if self.panic_primary.load(Ordering::SeqCst) {
                    panic!("sink crashed while writing");
                }
                if self.fail_primary.load(Ordering::SeqCst) {
                    return Err(PersistenceError::Message("disk full".to_string()));
                }
                RecordedBatch::Primary(records.to_vec())
            }
            ResultBatch::Related { origin, records } => RecordedBatch::Related {
                origin: origin.to_string(),
                records: records.to_vec(),
            },
        };
        let mut batches = self.batches.lock().unwrap();
        batches.push(recorded);
        Ok(StoredBatch {
            path: PathBuf::from(format!("memory/{}", batches.len())),
            rows: batch.len(),
            sha256: "0".repeat(64),
        })
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        home_url: HOME.to_string(),
        cookies_path: PathBuf::from("/nonexistent/hotreel/cookies.json"),
        settle_timeout: Duration::from_secs(2),
        recommend_settle_timeout: Duration::from_secs(3),
        ..EngineConfig::default()
    }
}

pub fn harness(site: &Arc<FakeSite>) -> (Orchestrator, Arc<MemorySink>) {
    harness_with(site, test_config())
}

pub fn harness_with(site: &Arc<FakeSite>, config: EngineConfig) -> (Orchestrator, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let orchestrator = Orchestrator::new(
        Arc::new(FakePool::new(Arc::clone(site))),
        Arc::clone(&sink) as Arc<dyn ResultSink>,
        config,
    )
    .expect("orchestrator");
    (orchestrator, sink)
}
