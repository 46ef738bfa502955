use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use hotreel_adapters::{BackoffPolicy, HttpSessionConfig};

use crate::{NESTED_CONCURRENCY, TOP_LEVEL_CONCURRENCY};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub home_url: String,
    pub cookies_path: PathBuf,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub settle_timeout: Duration,
    pub recommend_settle_timeout: Duration,
    pub web_port: u16,
    pub top_level_concurrency: usize,
    pub nested_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            home_url: "https://www.iqiyi.com/".to_string(),
            cookies_path: PathBuf::from("iqiyi_cookies.json"),
            user_agent: None,
            http_timeout_secs: 20,
            settle_timeout: Duration::from_secs(10),
            recommend_settle_timeout: Duration::from_secs(15),
            web_port: 5000,
            top_level_concurrency: TOP_LEVEL_CONCURRENCY,
            nested_concurrency: NESTED_CONCURRENCY,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("HOTREEL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            home_url: std::env::var("HOTREEL_HOME_URL").unwrap_or(defaults.home_url),
            cookies_path: std::env::var("HOTREEL_COOKIES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.cookies_path),
            user_agent: std::env::var("HOTREEL_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            http_timeout_secs: env_or("HOTREEL_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            settle_timeout: Duration::from_secs(env_or(
                "HOTREEL_SETTLE_TIMEOUT_SECS",
                defaults.settle_timeout.as_secs(),
            )),
            recommend_settle_timeout: Duration::from_secs(env_or(
                "HOTREEL_RECOMMEND_SETTLE_SECS",
                defaults.recommend_settle_timeout.as_secs(),
            )),
            web_port: env_or("HOTREEL_WEB_PORT", defaults.web_port),
            ..defaults
        }
    }

    pub fn http_session_config(&self) -> HttpSessionConfig {
        HttpSessionConfig {
            base_url: self.home_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            backoff: BackoffPolicy::default(),
        }
    }
}
