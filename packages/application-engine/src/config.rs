use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::applications::ApplyWorkerConfig;
use crate::domains::automation::{default_steps, RetryPolicy, Step};
use crate::domains::crawling::CrawlSettings;

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Endpoint of the JSON job feed served as the `custom` source
    pub job_feed_url: Option<String>,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build from any variable source; `from_env` passes the process env.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            database_url: var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: parse_or(&var, "DATABASE_MAX_CONNECTIONS", 10)?,
            job_feed_url: var("JOB_FEED_URL"),
            engine: EngineConfig::from_vars(&var)?,
        })
    }
}

/// Engine tuning. Every field has a default; the environment overrides.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub session_pool_size: usize,
    pub session_acquire_timeout: Duration,
    pub step_timeout: Duration,
    pub attempt_timeout: Duration,
    /// Retries after the first try, for steps that retry at all
    pub step_retries: u32,
    pub step_backoff_base: Duration,
    pub apply_concurrency: usize,
    pub crawl_concurrency_per_source: usize,
    pub crawl_min_page_delay: Duration,
    pub crawl_max_pages: u32,
    pub stale_posting_days: i64,
    pub artifact_dir: PathBuf,
    /// How long shutdown waits for running crawls and attempts
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_pool_size: 5,
            session_acquire_timeout: Duration::from_secs(30),
            step_timeout: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(5 * 60),
            step_retries: 2,
            step_backoff_base: Duration::from_millis(500),
            apply_concurrency: 5,
            crawl_concurrency_per_source: 2,
            crawl_min_page_delay: Duration::from_secs(2),
            crawl_max_pages: 5,
            stale_posting_days: 30,
            artifact_dir: PathBuf::from("artifacts"),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn from_vars(var: &impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            session_pool_size: parse_or(var, "SESSION_POOL_SIZE", defaults.session_pool_size)?,
            session_acquire_timeout: millis_or(
                var,
                "SESSION_ACQUIRE_TIMEOUT_MS",
                defaults.session_acquire_timeout,
            )?,
            step_timeout: millis_or(var, "STEP_TIMEOUT_MS", defaults.step_timeout)?,
            attempt_timeout: millis_or(var, "ATTEMPT_TIMEOUT_MS", defaults.attempt_timeout)?,
            step_retries: parse_or(var, "STEP_RETRIES", defaults.step_retries)?,
            step_backoff_base: millis_or(var, "STEP_BACKOFF_BASE_MS", defaults.step_backoff_base)?,
            apply_concurrency: parse_or(var, "APPLY_CONCURRENCY", defaults.apply_concurrency)?,
            crawl_concurrency_per_source: parse_or(
                var,
                "CRAWL_CONCURRENCY_PER_SOURCE",
                defaults.crawl_concurrency_per_source,
            )?,
            crawl_min_page_delay: millis_or(
                var,
                "CRAWL_MIN_PAGE_DELAY_MS",
                defaults.crawl_min_page_delay,
            )?,
            crawl_max_pages: parse_or(var, "CRAWL_MAX_PAGES", defaults.crawl_max_pages)?,
            stale_posting_days: parse_or(var, "STALE_POSTING_DAYS", defaults.stale_posting_days)?,
            artifact_dir: var("ARTIFACT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifact_dir),
            shutdown_grace: millis_or(var, "SHUTDOWN_GRACE_MS", defaults.shutdown_grace)?,
        })
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            max_concurrent_per_source: self.crawl_concurrency_per_source,
            min_page_delay: self.crawl_min_page_delay,
            max_pages: self.crawl_max_pages,
            stale_after: chrono::Duration::days(self.stale_posting_days),
        }
    }

    pub fn worker_config(&self) -> ApplyWorkerConfig {
        ApplyWorkerConfig {
            concurrency: self.apply_concurrency,
            acquire_timeout: self.session_acquire_timeout,
            drain_timeout: self.shutdown_grace,
        }
    }

    pub fn steps(&self) -> Vec<Step> {
        default_steps(
            self.step_timeout,
            RetryPolicy::new(self.step_retries, self.step_backoff_base),
        )
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} must be a valid number")),
        None => Ok(default),
    }
}

fn millis_or(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
) -> Result<Duration> {
    let millis: u64 = parse_or(var, name, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
