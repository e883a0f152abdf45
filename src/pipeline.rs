//! Harvest orchestration.
//!
//! Coordinates one full run: scrape ranking pages → fetch metadata page by
//! page → stage and promote. Everything runs on one task, one page at a
//! time, so the only caller of the metadata API is this run.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

use crate::api::{BggApiClient, MetadataApi};
use crate::config::Config;
use crate::db;
use crate::fetcher::BatchFetcher;
use crate::migrate;
use crate::models::Page;
use crate::progress::{PipelineEvent, ProgressReporter};
use crate::publisher::{AtomicPublisher, PublishSummary};
use crate::scraper::{RankingScraper, RankingSource};
use crate::store::{DocumentStore, SqliteStore};

/// Counts for one finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub pages: usize,
    pub ids: usize,
    pub skipped_pages: usize,
    pub publish: PublishSummary,
    pub elapsed: Duration,
}

/// The collaborators of a run, wired together.
pub struct Pipeline {
    pub config: Config,
    pub ranking: Arc<dyn RankingSource>,
    pub api: Arc<dyn MetadataApi>,
    pub store: Arc<dyn DocumentStore>,
    pub progress: Arc<dyn ProgressReporter>,
}

impl Pipeline {
    /// Scrapes one ranking page per [`Page`], in page order.
    pub async fn collect_pages(&self) -> Result<Vec<Page>> {
        let scraper = &self.config.scraper;
        let mut pages = Vec::with_capacity(scraper.pages as usize);
        for n in scraper.first_page..scraper.first_page.saturating_add(scraper.pages) {
            let ids = self
                .ranking
                .get_item_ids(&scraper.sort, n, 1)
                .await
                .with_context(|| format!("failed to scrape ranking page {}", n))?;
            info!(page = n, ids = ids.len(), "ranking page scraped");
            self.progress.report(PipelineEvent::Scraped {
                page: n,
                ids: ids.len(),
            });
            pages.push(ids);
        }
        Ok(pages)
    }

    /// Runs scrape → fetch → publish once.
    #[instrument(skip(self), fields(sort = %self.config.scraper.sort, pages = self.config.scraper.pages))]
    pub async fn run(&self) -> Result<RunSummary> {
        let started = Instant::now();

        let pages = self.collect_pages().await?;
        let ids = pages.iter().map(Vec::len).sum();

        let fetcher = BatchFetcher::new(
            self.api.as_ref(),
            self.config.fetcher.clone(),
            self.config.retry.fetch.clone(),
            self.progress.as_ref(),
        );
        let dataset = fetcher
            .get_api_data(&pages)
            .await
            .context("metadata fetch failed; live dataset left as is")?;
        let skipped_pages = pages.len() - dataset.len();

        let publisher = AtomicPublisher::new(
            self.store.as_ref(),
            self.config.store.clone(),
            &self.config.publisher,
            self.config.retry.promote.clone(),
            self.progress.as_ref(),
        );
        let publish = publisher.replace_dataset(&dataset).await?;

        let summary = RunSummary {
            pages: pages.len(),
            ids,
            skipped_pages,
            publish,
            elapsed: started.elapsed(),
        };
        info!(
            pages = summary.pages,
            ids = summary.ids,
            documents = summary.publish.documents,
            elapsed_secs = summary.elapsed.as_secs(),
            "harvest complete"
        );
        Ok(summary)
    }
}

/// Builds the production pipeline from config: HTTP scraper, BGG client, SQLite store.
pub async fn build_pipeline(
    config: &Config,
    progress: Arc<dyn ProgressReporter>,
) -> Result<Pipeline> {
    migrate::run_migrations(config).await?;
    let pool = db::connect(config).await?;
    let ranking = RankingScraper::new(&config.scraper, config.retry.scrape.clone())?;
    let api = BggApiClient::new(&config.api)?;

    Ok(Pipeline {
        config: config.clone(),
        ranking: Arc::new(ranking),
        api: Arc::new(api),
        store: Arc::new(SqliteStore::new(pool)),
        progress,
    })
}

/// `bgg run`: one harvest, optionally bounded by a wall-clock timeout.
///
/// If the timeout fires the run is dropped mid-flight; staging may be
/// partially filled but live is untouched.
pub async fn run_harvest(
    config: &Config,
    progress: Arc<dyn ProgressReporter>,
    timeout: Option<Duration>,
) -> Result<()> {
    let pipeline = build_pipeline(config, progress).await?;

    let summary = match timeout {
        Some(limit) => tokio::time::timeout(limit, pipeline.run())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "harvest timed out after {}s; live dataset left as is",
                    limit.as_secs()
                )
            })??,
        None => pipeline.run().await?,
    };

    println!("harvest");
    println!("  ranking pages: {}", summary.pages);
    println!("  ids scraped: {}", summary.ids);
    println!("  pages skipped: {}", summary.skipped_pages);
    println!("  documents published: {}", summary.publish.documents);
    println!("  elapsed: {}s", summary.elapsed.as_secs());
    println!("ok");
    Ok(())
}

/// `bgg ids`: scrape and print ids without touching the API or the store.
pub async fn run_ids(config: &Config, first_page: Option<u32>, pages: Option<u32>) -> Result<()> {
    let scraper = RankingScraper::new(&config.scraper, config.retry.scrape.clone())?;
    let first = first_page.unwrap_or(config.scraper.first_page);
    let count = pages.unwrap_or(config.scraper.pages);
    let ids = scraper
        .get_item_ids(&config.scraper.sort, first, count)
        .await?;
    for id in &ids {
        println!("{}", id);
    }
    eprintln!("{} ids from {} page(s)", ids.len(), count);
    Ok(())
}
