//! Sessions backed by plain HTTP fetches of server-rendered markup.
//!
//! Each session owns its own cookie jar, so stored tokens applied to the primary
//! session never leak into the short-lived sessions opened for related items.
//! Interactive actions have nothing to drive on static markup and succeed as no-ops
//! once a page is loaded; readiness is answered from the markup that was fetched.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hotreel_storage::SessionToken;
use reqwest::cookie::Jar;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use tracing::{debug, info_span, Instrument};
use url::Url;

use crate::{BoxedSession, PageAction, ReadyCondition, Session, SessionError, SessionPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.iqiyi.com/".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpSessionPool {
    config: HttpSessionConfig,
    base: Url,
    next_id: AtomicU64,
    live: AtomicUsize,
}

impl HttpSessionPool {
    pub fn new(config: HttpSessionConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("parsing base url {}", config.base_url))?;
        Ok(Self {
            config,
            base,
            next_id: AtomicU64::new(1),
            live: AtomicUsize::new(0),
        })
    }

    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionPool for HttpSessionPool {
    async fn acquire(&self, headless: bool) -> Result<BoxedSession, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let jar = Arc::new(Jar::default());
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .cookie_provider(Arc::clone(&jar))
            .timeout(self.config.timeout);
        if let Some(user_agent) = &self.config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = id, headless, "opened http session");
        Ok(Box::new(HttpSession {
            id,
            client,
            jar,
            base: self.base.clone(),
            backoff: self.config.backoff,
            current_url: None,
            content: None,
        }))
    }

    async fn release(&self, session: BoxedSession) {
        let id = session.id();
        drop(session);
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!(session_id = id, "released http session");
    }
}

pub struct HttpSession {
    id: u64,
    client: reqwest::Client,
    jar: Arc<Jar>,
    base: Url,
    backoff: BackoffPolicy,
    current_url: Option<Url>,
    content: Option<String>,
}

impl HttpSession {
    fn resolve(&self, url: &str) -> Result<Url, SessionError> {
        let base = self.current_url.as_ref().unwrap_or(&self.base);
        base.join(url).map_err(|e| SessionError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn fetch_with_retries(&self, url: &Url) -> Result<(Url, String), SessionError> {
        let navigation_error = |reason: String| SessionError::Navigation {
            url: url.to_string(),
            reason,
        };

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().clone();

                    if status.is_success() {
                        let body = resp.text().await.map_err(|e| navigation_error(e.to_string()))?;
                        return Ok((final_url, body));
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(navigation_error(format!("http status {}", status.as_u16())));
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(navigation_error(err.to_string()));
                }
            }
        }

        Err(navigation_error("retries exhausted".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn with_content(url: &str, content: &str) -> Self {
        let base = Url::parse(url).unwrap();
        Self {
            id: 0,
            client: reqwest::Client::new(),
            jar: Arc::new(Jar::default()),
            base: base.clone(),
            backoff: BackoffPolicy::default(),
            current_url: Some(base),
            content: Some(content.to_string()),
        }
    }
}

fn markup_matches(content: &str, selector: &str) -> Result<bool, SessionError> {
    let selector = Selector::parse(selector)
        .map_err(|e| SessionError::Anyhow(anyhow::anyhow!("invalid selector {selector}: {e}")))?;
    let document = Html::parse_document(content);
    let found = document.select(&selector).next().is_some();
    Ok(found)
}

#[async_trait]
impl Session for HttpSession {
    fn id(&self) -> u64 {
        self.id
    }

    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        let target = self.resolve(url)?;
        let span = info_span!("navigate", session_id = self.id, url = %target);
        let (final_url, body) = self.fetch_with_retries(&target).instrument(span).await?;
        self.current_url = Some(final_url);
        self.content = Some(body);
        Ok(())
    }

    async fn wait_for_ready(
        &mut self,
        condition: ReadyCondition,
        _timeout: Duration,
    ) -> Result<bool, SessionError> {
        match &self.content {
            Some(content) => markup_matches(content, condition.selector()),
            None => Ok(false),
        }
    }

    async fn current_content(&mut self) -> Result<String, SessionError> {
        self.content.clone().ok_or(SessionError::NoPage)
    }

    async fn apply_stored_session(&mut self, tokens: &[SessionToken]) -> Result<(), SessionError> {
        let scope = self.current_url.clone().unwrap_or_else(|| self.base.clone());
        for token in tokens {
            if token.name.trim().is_empty() {
                return Err(SessionError::InvalidToken {
                    name: token.name.clone(),
                    reason: "empty cookie name".to_string(),
                });
            }
            self.jar.add_cookie_str(&token.to_cookie_header(), &scope);
        }
        debug!(session_id = self.id, tokens = tokens.len(), "applied stored session");
        Ok(())
    }

    async fn perform(&mut self, action: PageAction) -> Result<(), SessionError> {
        if self.content.is_none() {
            return Err(SessionError::ActionUnavailable {
                action,
                reason: "no page loaded".to_string(),
            });
        }
        debug!(session_id = self.id, ?action, "static markup needs no interaction");
        Ok(())
    }
}
