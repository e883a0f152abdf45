//! Batch fetcher: drives the metadata API one page at a time.
//!
//! Every page goes through the same loop:
//!
//! ```text
//!            ┌──────── transient error: wait transient_backoff ───────┐
//!            │                                                        │
//!            ▼                                                        │
//!   ── wait request_delay ── fetch ──┬── items ──▶ Fetched (append)   │
//!            ▲                       ├── error ───────────────────────┘
//!            │                       └── zero items for non-empty page
//!            └──── wait empty_backoff(k), k += 1 ────┘
//!
//!   empty page ──▶ NoGenuineItems (skip, no API call)
//! ```
//!
//! The empty-response delay grows by `empty_backoff_step_ms` on every
//! consecutive empty answer and drops back to its base after a success.
//! How long a page may keep failing is governed by a [`RetryPolicy`].

use std::time::Duration;
use tracing::{info, warn};

use crate::api::{ApiError, MetadataApi};
use crate::config::FetcherConfig;
use crate::models::{ItemId, ItemRecord, Page, PageOutcome};
use crate::progress::{PipelineEvent, ProgressReporter, RetryReason};
use crate::retry::{Exhausted, RetryPolicy};

/// Why fetching stopped before every page was done.
#[derive(Debug)]
pub enum FetchError {
    /// The API rejected a page in a way retrying cannot fix.
    Permanent { page: usize, source: ApiError },
    /// A page used up its retry budget.
    Exhausted { page: usize, source: Exhausted },
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Permanent { page, source } => {
                write!(f, "page {} failed: {}", page + 1, source)
            }
            FetchError::Exhausted { page, source } => {
                write!(f, "page {}: {}", page + 1, source)
            }
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Permanent { source, .. } => Some(source),
            FetchError::Exhausted { source, .. } => Some(source),
        }
    }
}

pub struct BatchFetcher<'a> {
    api: &'a dyn MetadataApi,
    config: FetcherConfig,
    retry: RetryPolicy,
    progress: &'a dyn ProgressReporter,
}

impl<'a> BatchFetcher<'a> {
    pub fn new(
        api: &'a dyn MetadataApi,
        config: FetcherConfig,
        retry: RetryPolicy,
        progress: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            api,
            config,
            retry,
            progress,
        }
    }

    /// Cleaned records for every page that had base games, in page order.
    ///
    /// Pages with no ids contribute no entry.
    pub async fn get_api_data(&self, pages: &[Page]) -> Result<Vec<Vec<ItemRecord>>, FetchError> {
        let total = pages.len();
        let mut out = Vec::with_capacity(total);
        for (index, ids) in pages.iter().enumerate() {
            match self.fetch_page(index, ids).await? {
                Some(records) => {
                    info!(page = index + 1, total, records = records.len(), "page fetched");
                    self.progress.report(PipelineEvent::Fetched {
                        page: index,
                        total,
                        records: records.len(),
                    });
                    out.push(records);
                }
                None => {
                    info!(page = index + 1, total, "page has no base games, skipping");
                    self.progress
                        .report(PipelineEvent::Skipped { page: index, total });
                }
            }
        }
        Ok(out)
    }

    /// Runs the retry loop for one page. `None` means the page had no ids.
    pub async fn fetch_page(
        &self,
        index: usize,
        ids: &[ItemId],
    ) -> Result<Option<Vec<ItemRecord>>, FetchError> {
        if ids.is_empty() {
            return Ok(None);
        }

        let mut budget = self.retry.start();
        let mut empty_streak: u32 = 0;

        loop {
            tokio::time::sleep(self.config.request_delay()).await;

            let (reason, delay) = match self.api.fetch(ids).await {
                Ok(items) => match PageOutcome::classify(ids.len(), items) {
                    PageOutcome::Fetched(records) => return Ok(Some(records)),
                    PageOutcome::NoGenuineItems => return Ok(None),
                    PageOutcome::UpstreamEmptyResponse => {
                        let delay = self.config.empty_backoff(empty_streak);
                        empty_streak += 1;
                        (RetryReason::EmptyResponse, delay)
                    }
                },
                Err(ApiError::Transient(msg)) => {
                    (RetryReason::Transient(msg), self.config.transient_backoff())
                }
                Err(source @ ApiError::Permanent(_)) => {
                    return Err(FetchError::Permanent {
                        page: index,
                        source,
                    })
                }
            };

            budget
                .fail()
                .map_err(|source| FetchError::Exhausted { page: index, source })?;
            self.retry_after(index, budget.failures(), delay, reason)
                .await;
        }
    }

    async fn retry_after(&self, index: usize, attempt: u32, delay: Duration, reason: RetryReason) {
        match &reason {
            RetryReason::Transient(msg) => warn!(
                page = index + 1,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %msg,
                "metadata request failed, retrying"
            ),
            RetryReason::EmptyResponse => warn!(
                page = index + 1,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "metadata request returned no items, backing off"
            ),
        }
        self.progress.report(PipelineEvent::Retrying {
            page: index,
            attempt,
            delay,
            reason,
        });
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawItem;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted answers; once the script runs out, echoes the ids back.
    struct ScriptedApi {
        script: Mutex<VecDeque<Result<Vec<RawItem>, ApiError>>>,
        calls: Mutex<Vec<Vec<ItemId>>>,
    }

    impl ScriptedApi {
        fn new(script: Vec<Result<Vec<RawItem>, ApiError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<ItemId>> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn raw(id: ItemId) -> RawItem {
        match json!({ "id": id, "name": format!("game {}", id), "language_dependence": { "1": {} } }) {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[async_trait]
    impl MetadataApi for ScriptedApi {
        async fn fetch(&self, ids: &[ItemId]) -> Result<Vec<RawItem>, ApiError> {
            self.calls.lock().unwrap().push(ids.to_vec());
            match self.script.lock().unwrap().pop_front() {
                Some(answer) => answer,
                None => Ok(ids.iter().copied().map(raw).collect()),
            }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<PipelineEvent>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: PipelineEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Recorder {
        fn retry_delays(&self) -> Vec<Duration> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    PipelineEvent::Retrying { delay, .. } => Some(*delay),
                    _ => None,
                })
                .collect()
        }
    }

    fn fast_config() -> FetcherConfig {
        FetcherConfig {
            request_delay_ms: 0,
            transient_backoff_ms: 5,
            empty_backoff_base_ms: 1,
            empty_backoff_step_ms: 2,
        }
    }

    #[tokio::test]
    async fn empty_page_is_skipped_without_calling_api() {
        let api = ScriptedApi::new(vec![]);
        let progress = Recorder::default();
        let fetcher =
            BatchFetcher::new(&api, fast_config(), RetryPolicy::max_attempts(1), &progress);

        let pages = vec![vec![], vec![1, 2]];
        let out = fetcher.get_api_data(&pages).await.unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(api.calls(), vec![vec![1, 2]]);
        assert!(progress
            .0
            .lock()
            .unwrap()
            .contains(&PipelineEvent::Skipped { page: 0, total: 2 }));
    }

    #[tokio::test]
    async fn fetch_page_returns_none_only_for_empty_input() {
        let api = ScriptedApi::new(vec![Ok(vec![])]);
        let fetcher = BatchFetcher::new(
            &api,
            fast_config(),
            RetryPolicy::unbounded(),
            &crate::progress::NoProgress,
        );

        assert_eq!(fetcher.fetch_page(0, &[]).await.unwrap(), None);
        assert!(api.calls().is_empty());

        let records = fetcher.fetch_page(1, &[3]).await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test]
    async fn records_are_cleaned() {
        let api = ScriptedApi::new(vec![]);
        let fetcher = BatchFetcher::new(
            &api,
            fast_config(),
            RetryPolicy::unbounded(),
            &crate::progress::NoProgress,
        );
        let out = fetcher.get_api_data(&[vec![7]]).await.unwrap();
        assert_eq!(out[0][0].id(), Some(7));
        assert!(out[0][0].get("language_dependence").is_none());
    }

    #[tokio::test]
    async fn empty_responses_back_off_with_increasing_delay() {
        let api = ScriptedApi::new(vec![Ok(vec![]), Ok(vec![]), Ok(vec![]), Ok(vec![])]);
        let progress = Recorder::default();
        let fetcher = BatchFetcher::new(&api, fast_config(), RetryPolicy::unbounded(), &progress);

        let out = fetcher.get_api_data(&[vec![1, 2, 3]]).await.unwrap();

        assert_eq!(out[0].len(), 3);
        let delays = progress.retry_delays();
        assert_eq!(delays.len(), 4);
        assert!(delays.windows(2).all(|w| w[0] < w[1]), "{:?}", delays);
    }

    #[tokio::test]
    async fn empty_backoff_resets_after_success() {
        // page 1: two empties then success; page 2: one empty then success
        let api = ScriptedApi::new(vec![
            Ok(vec![]),
            Ok(vec![]),
            Ok(vec![raw(1)]),
            Ok(vec![]),
            Ok(vec![raw(2)]),
        ]);
        let progress = Recorder::default();
        let cfg = fast_config();
        let fetcher = BatchFetcher::new(&api, cfg.clone(), RetryPolicy::unbounded(), &progress);

        fetcher.get_api_data(&[vec![1], vec![2]]).await.unwrap();

        assert_eq!(
            progress.retry_delays(),
            vec![cfg.empty_backoff(0), cfg.empty_backoff(1), cfg.empty_backoff(0)]
        );
    }

    #[tokio::test]
    async fn transient_errors_use_fixed_backoff() {
        let api = ScriptedApi::new(vec![
            Err(ApiError::Transient("reset".into())),
            Err(ApiError::Transient("bad xml".into())),
        ]);
        let progress = Recorder::default();
        let fetcher = BatchFetcher::new(&api, fast_config(), RetryPolicy::unbounded(), &progress);

        let out = fetcher.get_api_data(&[vec![4, 5]]).await.unwrap();

        assert_eq!(out[0].len(), 2);
        assert_eq!(api.calls().len(), 3);
        assert_eq!(
            progress.retry_delays(),
            vec![Duration::from_millis(5), Duration::from_millis(5)]
        );
    }

    #[tokio::test]
    async fn permanent_error_stops_fetching() {
        let api = ScriptedApi::new(vec![Err(ApiError::Permanent("401".into()))]);
        let fetcher = BatchFetcher::new(
            &api,
            fast_config(),
            RetryPolicy::unbounded(),
            &crate::progress::NoProgress,
        );
        let err = fetcher.get_api_data(&[vec![1], vec![2]]).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent { page: 0, .. }));
        assert_eq!(api.calls().len(), 1);
    }

    #[tokio::test]
    async fn bounded_policy_gives_up() {
        let api = ScriptedApi::new(vec![Ok(vec![]), Ok(vec![]), Ok(vec![])]);
        let fetcher = BatchFetcher::new(
            &api,
            fast_config(),
            RetryPolicy::max_attempts(2),
            &crate::progress::NoProgress,
        );
        let err = fetcher.get_api_data(&[vec![9]]).await.unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { page: 0, .. }));
        assert_eq!(api.calls().len(), 2);
    }
}
