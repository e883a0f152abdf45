//! Ranking page scraper.
//!
//! Walks the paginated browse listing
//! (`{base_url}/page/{n}?sort={criterion}&sortdir={direction}`) and pulls
//! item ids out of the thumbnail column. Only base games are kept:
//!
//! | Link target | Result |
//! |-------------|--------|
//! | `/boardgame/{id}/...` | id kept |
//! | `/boardgameexpansion/{id}/...` | dropped |
//! | anything else | dropped |
//!
//! A page that fails to load is retried after a fixed delay under the
//! configured [`RetryPolicy`] (forever by default). A 4xx other than 429,
//! such as a 404 past the end of the ranking, fails at once.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use scraper::{ElementRef, Html};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ScraperConfig;
use crate::models::ItemId;
use crate::retry::RetryPolicy;

const ITEM_PREFIX: &str = "/boardgame/";
const THUMBNAIL_CLASS: &str = "collection_thumbnail";

/// Source of ranked item ids.
#[async_trait]
pub trait RankingSource: Send + Sync {
    /// Ids from pages `first_page..first_page + page_count`, page order then
    /// document order. Duplicates across pages are kept.
    async fn get_item_ids(
        &self,
        sort: &str,
        first_page: u32,
        page_count: u32,
    ) -> Result<Vec<ItemId>>;
}

pub struct RankingScraper {
    http: reqwest::Client,
    base_url: String,
    sort_direction: String,
    retry_delay: Duration,
    retry: RetryPolicy,
}

impl RankingScraper {
    pub fn new(config: &ScraperConfig, retry: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("bgg-harvest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to construct ranking HTTP client")?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            sort_direction: config.sort_direction.clone(),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry,
        })
    }

    pub fn page_url(&self, sort: &str, page: u32) -> String {
        format!(
            "{}/page/{}?sort={}&sortdir={}",
            self.base_url, page, sort, self.sort_direction
        )
    }

    async fn fetch_html(&self, url: &str) -> Result<String> {
        let mut budget = self.retry.start();
        loop {
            match self.try_fetch_html(url).await {
                Ok(html) => return Ok(html),
                Err(PageError::Permanent(status)) => {
                    anyhow::bail!("ranking page {} returned {}", url, status)
                }
                Err(PageError::Transient(e)) => {
                    budget
                        .fail()
                        .with_context(|| format!("ranking page {} kept failing: {}", url, e))?;
                    warn!(
                        url = %url,
                        attempt = budget.failures(),
                        error = %e,
                        "ranking page fetch failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn try_fetch_html(&self, url: &str) -> Result<String, PageError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PageError::Transient(format!("request failed: {}", e)))?;
        let status = response.status();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            return Err(PageError::Permanent(status));
        }
        if !status.is_success() {
            return Err(PageError::Transient(format!(
                "ranking page returned {}",
                status
            )));
        }
        response
            .text()
            .await
            .map_err(|e| PageError::Transient(format!("failed to read body: {}", e)))
    }
}

/// Non-429 4xx answers are permanent; everything else is worth retrying.
enum PageError {
    Transient(String),
    Permanent(StatusCode),
}

#[async_trait]
impl RankingSource for RankingScraper {
    async fn get_item_ids(
        &self,
        sort: &str,
        first_page: u32,
        page_count: u32,
    ) -> Result<Vec<ItemId>> {
        let mut ids = Vec::new();
        for page in first_page..first_page.saturating_add(page_count) {
            let url = self.page_url(sort, page);
            let html = self.fetch_html(&url).await?;
            let page_ids = extract_item_ids(&html);
            debug!(page, ids = page_ids.len(), "scraped ranking page");
            ids.extend(page_ids);
        }
        Ok(ids)
    }
}

/// Ids of base-game links in the ranking's thumbnail column, in document order.
pub fn extract_item_ids(html: &str) -> Vec<ItemId> {
    let document = Html::parse_document(html);
    document
        .root_element()
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(is_thumbnail_link)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(parse_item_href)
        .collect()
}

/// An `<a>` whose immediate parent is `<td class="collection_thumbnail">`.
fn is_thumbnail_link(el: &ElementRef) -> bool {
    if el.value().name() != "a" {
        return false;
    }
    el.parent()
        .and_then(ElementRef::wrap)
        .map(|td| {
            td.value().name() == "td" && td.value().classes().collect::<Vec<_>>() == [THUMBNAIL_CLASS]
        })
        .unwrap_or(false)
}

/// `/boardgame/13/catan` → `13`. Expansions and other paths yield `None`.
pub fn parse_item_href(href: &str) -> Option<ItemId> {
    let rest = href.strip_prefix(ITEM_PREFIX)?;
    let segment = rest.split('/').next().unwrap_or_default();
    match segment.parse::<ItemId>() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(href, "item link without a numeric id");
            None
        }
    }
}
