use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Names of the two collections a run works with.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_live_collection")]
    pub live_collection: String,
    #[serde(default = "default_staging_collection")]
    pub staging_collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            live_collection: default_live_collection(),
            staging_collection: default_staging_collection(),
        }
    }
}

fn default_live_collection() -> String {
    "game_info".to_string()
}
fn default_staging_collection() -> String {
    "games_staging".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScraperConfig {
    #[serde(default = "default_browse_url")]
    pub base_url: String,
    #[serde(default = "default_sort")]
    pub sort: String,
    #[serde(default = "default_sort_direction")]
    pub sort_direction: String,
    #[serde(default = "default_first_page")]
    pub first_page: u32,
    #[serde(default = "default_pages")]
    pub pages: u32,
    #[serde(default = "default_scrape_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            base_url: default_browse_url(),
            sort: default_sort(),
            sort_direction: default_sort_direction(),
            first_page: default_first_page(),
            pages: default_pages(),
            retry_delay_ms: default_scrape_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_browse_url() -> String {
    "https://boardgamegeek.com/browse/boardgame".to_string()
}
fn default_sort() -> String {
    "numvoters".to_string()
}
fn default_sort_direction() -> String {
    "desc".to_string()
}
fn default_first_page() -> u32 {
    1
}
fn default_pages() -> u32 {
    20
}
fn default_scrape_retry_delay_ms() -> u64 {
    5_000
}
fn default_timeout_secs() -> u64 {
    30
}

/// Sort criteria the ranking site understands.
pub const SORT_CRITERIA: &[&str] = &["rank", "bggrating", "avgrating", "numvoters"];

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub base_url: String,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_ids_per_request")]
    pub ids_per_request: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Environment variable holding an optional bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_url(),
            requests_per_minute: default_requests_per_minute(),
            ids_per_request: default_ids_per_request(),
            timeout_secs: default_timeout_secs(),
            token_env: default_token_env(),
        }
    }
}

fn default_api_url() -> String {
    "https://boardgamegeek.com/xmlapi2".to_string()
}
fn default_requests_per_minute() -> u32 {
    15
}
fn default_ids_per_request() -> usize {
    20
}
fn default_token_env() -> String {
    "BGG_API_TOKEN".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_transient_backoff_ms")]
    pub transient_backoff_ms: u64,
    #[serde(default = "default_empty_backoff_base_ms")]
    pub empty_backoff_base_ms: u64,
    #[serde(default = "default_empty_backoff_step_ms")]
    pub empty_backoff_step_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_delay_ms: default_request_delay_ms(),
            transient_backoff_ms: default_transient_backoff_ms(),
            empty_backoff_base_ms: default_empty_backoff_base_ms(),
            empty_backoff_step_ms: default_empty_backoff_step_ms(),
        }
    }
}

fn default_request_delay_ms() -> u64 {
    2_000
}
fn default_transient_backoff_ms() -> u64 {
    30_000
}
fn default_empty_backoff_base_ms() -> u64 {
    10_000
}
fn default_empty_backoff_step_ms() -> u64 {
    10_000
}

impl FetcherConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn transient_backoff(&self) -> Duration {
        Duration::from_millis(self.transient_backoff_ms)
    }

    /// Delay before retrying the `consecutive`-th empty response (0-based).
    pub fn empty_backoff(&self, consecutive: u32) -> Duration {
        let step = self.empty_backoff_step_ms.saturating_mul(consecutive as u64);
        Duration::from_millis(self.empty_backoff_base_ms.saturating_add(step))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_promote_retry_delay_ms")]
    pub promote_retry_delay_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            promote_retry_delay_ms: default_promote_retry_delay_ms(),
        }
    }
}

fn default_promote_retry_delay_ms() -> u64 {
    1_000
}

/// Retry profiles for the three unbounded loops in a run.
///
/// Every section defaults to "keep trying"; set `max_attempts` or
/// `max_elapsed_secs` to let a dead upstream fail the run instead.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RetryConfig {
    #[serde(default)]
    pub scrape: RetryPolicy,
    #[serde(default)]
    pub fetch: RetryPolicy,
    #[serde(default)]
    pub promote: RetryPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_result_limit")]
    pub result_limit: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            result_limit: default_result_limit(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_result_limit() -> i64 {
    10_000
}

impl Config {
    /// A config with every section at its default, storing into `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            store: StoreConfig::default(),
            scraper: ScraperConfig::default(),
            api: ApiConfig::default(),
            fetcher: FetcherConfig::default(),
            publisher: PublisherConfig::default(),
            retry: RetryConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Scraper
    if config.scraper.pages == 0 {
        anyhow::bail!("scraper.pages must be > 0");
    }
    if config.scraper.first_page == 0 {
        anyhow::bail!("scraper.first_page starts at 1");
    }
    if !SORT_CRITERIA.contains(&config.scraper.sort.as_str()) {
        anyhow::bail!(
            "Unknown scraper.sort: '{}'. Must be one of {}.",
            config.scraper.sort,
            SORT_CRITERIA.join(", ")
        );
    }
    match config.scraper.sort_direction.as_str() {
        "asc" | "desc" => {}
        other => anyhow::bail!(
            "Unknown scraper.sort_direction: '{}'. Must be asc or desc.",
            other
        ),
    }

    // API
    if config.api.requests_per_minute == 0 {
        anyhow::bail!("api.requests_per_minute must be > 0");
    }
    if config.api.ids_per_request == 0 {
        anyhow::bail!("api.ids_per_request must be > 0");
    }

    // Store
    for name in [
        &config.store.live_collection,
        &config.store.staging_collection,
    ] {
        if !is_collection_name(name) {
            anyhow::bail!(
                "Invalid collection name '{}': use letters, digits and underscores",
                name
            );
        }
    }
    if config.store.live_collection == config.store.staging_collection {
        anyhow::bail!("store.live_collection and store.staging_collection must differ");
    }

    // Server
    if config.server.result_limit < 1 {
        anyhow::bail!("server.result_limit must be >= 1");
    }

    Ok(())
}

/// Collection names end up as SQLite table identifiers.
pub fn is_collection_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
