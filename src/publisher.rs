//! Atomic publisher: stage the whole dataset, then swap it in.
//!
//! The live collection only ever changes through
//! [`DocumentStore::promote`], and only after every page has been staged.
//! A failure while staging leaves live exactly as the last good run left it.

use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{PublisherConfig, StoreConfig};
use crate::models::ItemRecord;
use crate::progress::{PipelineEvent, ProgressReporter};
use crate::retry::{Exhausted, RetryPolicy};
use crate::store::DocumentStore;

#[derive(Debug)]
pub enum PublishError {
    /// Clearing or filling the staging collection failed. Live is untouched.
    Staging(anyhow::Error),
    /// Promotion kept failing until the retry budget ran out. Live is untouched.
    Promote {
        last_error: anyhow::Error,
        source: Exhausted,
    },
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Staging(e) => write!(f, "staging failed: {:#}", e),
            PublishError::Promote { last_error, source } => {
                write!(f, "promotion {}: {:#}", source, last_error)
            }
        }
    }
}

impl std::error::Error for PublishError {}

/// What a successful publish wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishSummary {
    pub pages: usize,
    pub documents: usize,
    pub promote_attempts: u32,
}

pub struct AtomicPublisher<'a> {
    store: &'a dyn DocumentStore,
    collections: StoreConfig,
    promote_retry_delay: Duration,
    retry: RetryPolicy,
    progress: &'a dyn ProgressReporter,
}

impl<'a> AtomicPublisher<'a> {
    pub fn new(
        store: &'a dyn DocumentStore,
        collections: StoreConfig,
        config: &PublisherConfig,
        retry: RetryPolicy,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            store,
            collections,
            promote_retry_delay: Duration::from_millis(config.promote_retry_delay_ms),
            retry,
            progress,
        }
    }

    /// Replaces the live dataset with `pages`, or leaves it alone on failure.
    pub async fn replace_dataset(
        &self,
        pages: &[Vec<ItemRecord>],
    ) -> Result<PublishSummary, PublishError> {
        let documents = self.stage(pages).await.map_err(|e| {
            error!(error = %format!("{:#}", e), "staging failed, live dataset left as is");
            PublishError::Staging(e)
        })?;

        let promote_attempts = self.promote().await?;

        info!(
            documents,
            collection = %self.collections.live_collection,
            "dataset published"
        );
        self.progress.report(PipelineEvent::Published { documents });

        Ok(PublishSummary {
            pages: pages.len(),
            documents,
            promote_attempts,
        })
    }

    async fn stage(&self, pages: &[Vec<ItemRecord>]) -> anyhow::Result<usize> {
        let staging = &self.collections.staging_collection;
        self.store.clear(staging).await?;

        let mut documents = 0;
        for (index, records) in pages.iter().enumerate() {
            let n = self.store.insert_many(staging, records).await?;
            documents += n;
            self.progress.report(PipelineEvent::Staged {
                page: index,
                documents: n,
            });
        }
        Ok(documents)
    }

    /// Retries the rename until it sticks. Returns the number of attempts.
    async fn promote(&self) -> Result<u32, PublishError> {
        let staging = &self.collections.staging_collection;
        let live = &self.collections.live_collection;
        let mut budget = self.retry.start();

        loop {
            match self.store.promote(staging, live).await {
                Ok(()) => return Ok(budget.failures() + 1),
                Err(e) => {
                    if let Err(source) = budget.fail() {
                        error!(error = %format!("{:#}", e), "promotion abandoned");
                        return Err(PublishError::Promote {
                            last_error: e,
                            source,
                        });
                    }
                    warn!(
                        attempt = budget.failures(),
                        error = %format!("{:#}", e),
                        "promotion failed, retrying"
                    );
                    self.progress.report(PipelineEvent::PromoteRetrying {
                        attempt: budget.failures(),
                        delay: self.promote_retry_delay,
                    });
                    tokio::time::sleep(self.promote_retry_delay).await;
                }
            }
        }
    }
}
