//! Scraper and API client against local HTTP servers.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bgg_harvest::api::{ApiError, BggApiClient, MetadataApi};
use bgg_harvest::config::{ApiConfig, FetcherConfig, ScraperConfig};
use bgg_harvest::fetcher::BatchFetcher;
use bgg_harvest::progress::NoProgress;
use bgg_harvest::retry::RetryPolicy;
use bgg_harvest::scraper::{RankingScraper, RankingSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Serves `app` on an ephemeral port and returns its base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ============ Ranking pages ============

fn ranking_page(hrefs: &[String]) -> String {
    let rows: String = hrefs
        .iter()
        .map(|href| {
            format!(
                r#"<tr><td class="collection_thumbnail"><a href="{}"><img src="t.jpg"></a></td>
<td class="collection_objectname"><a href="{}">Name</a></td></tr>"#,
                href, href
            )
        })
        .collect();
    format!(
        r#"<html><body><table id="collectionitems">{}</table></body></html>"#,
        rows
    )
}

#[derive(Clone)]
struct RankingState {
    hits: Arc<AtomicUsize>,
    fail_first: usize,
    fail_status: StatusCode,
    queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

async fn ranking_handler(
    State(state): State<RankingState>,
    Path(page): Path<u32>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst);
    if hit < state.fail_first {
        return state.fail_status.into_response();
    }
    state.queries.lock().unwrap().push(query);

    let base = page * 10;
    let hrefs = vec![
        format!("/boardgame/{}/game", base + 1),
        format!("/boardgameexpansion/{}/expansion", base + 2),
        format!("/boardgame/{}/other-game", base + 3),
    ];
    Html(ranking_page(&hrefs)).into_response()
}

fn ranking_app(state: RankingState) -> Router {
    Router::new()
        .route("/page/{page}", get(ranking_handler))
        .with_state(state)
}

fn scraper_config(base_url: String) -> ScraperConfig {
    ScraperConfig {
        base_url,
        sort: "rank".to_string(),
        sort_direction: "desc".to_string(),
        retry_delay_ms: 5,
        timeout_secs: 5,
        ..ScraperConfig::default()
    }
}

#[tokio::test]
async fn test_scraper_collects_base_games_across_pages() {
    let state = RankingState {
        hits: Arc::new(AtomicUsize::new(0)),
        fail_first: 0,
        fail_status: StatusCode::SERVICE_UNAVAILABLE,
        queries: Arc::new(Mutex::new(Vec::new())),
    };
    let base_url = serve(ranking_app(state.clone())).await;
    let scraper = RankingScraper::new(&scraper_config(base_url), RetryPolicy::unbounded()).unwrap();

    let ids = scraper.get_item_ids("bggrating", 2, 2).await.unwrap();

    assert_eq!(ids, vec![21, 23, 31, 33]);
    let queries = state.queries.lock().unwrap();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0]["sort"], "bggrating");
    assert_eq!(queries[0]["sortdir"], "desc");
}

#[tokio::test]
async fn test_scraper_retries_failed_page() {
    let state = RankingState {
        hits: Arc::new(AtomicUsize::new(0)),
        fail_first: 2,
        fail_status: StatusCode::SERVICE_UNAVAILABLE,
        queries: Arc::new(Mutex::new(Vec::new())),
    };
    let base_url = serve(ranking_app(state.clone())).await;
    let scraper = RankingScraper::new(&scraper_config(base_url), RetryPolicy::unbounded()).unwrap();

    let ids = scraper.get_item_ids("rank", 1, 1).await.unwrap();

    assert_eq!(ids, vec![11, 13]);
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_scraper_gives_up_under_bounded_policy() {
    let state = RankingState {
        hits: Arc::new(AtomicUsize::new(0)),
        fail_first: usize::MAX,
        fail_status: StatusCode::SERVICE_UNAVAILABLE,
        queries: Arc::new(Mutex::new(Vec::new())),
    };
    let base_url = serve(ranking_app(state.clone())).await;
    let scraper =
        RankingScraper::new(&scraper_config(base_url), RetryPolicy::max_attempts(3)).unwrap();

    let err = scraper.get_item_ids("rank", 1, 1).await.unwrap_err();

    assert!(format!("{:#}", err).contains("503"));
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_scraper_does_not_retry_missing_page() {
    let state = RankingState {
        hits: Arc::new(AtomicUsize::new(0)),
        fail_first: usize::MAX,
        fail_status: StatusCode::NOT_FOUND,
        queries: Arc::new(Mutex::new(Vec::new())),
    };
    let base_url = serve(ranking_app(state.clone())).await;
    let scraper = RankingScraper::new(&scraper_config(base_url), RetryPolicy::unbounded()).unwrap();

    let err = scraper.get_item_ids("rank", 999, 1).await.unwrap_err();

    assert!(format!("{:#}", err).contains("404"));
    assert_eq!(state.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scraper_retries_rate_limited_page() {
    let state = RankingState {
        hits: Arc::new(AtomicUsize::new(0)),
        fail_first: 1,
        fail_status: StatusCode::TOO_MANY_REQUESTS,
        queries: Arc::new(Mutex::new(Vec::new())),
    };
    let base_url = serve(ranking_app(state.clone())).await;
    let scraper = RankingScraper::new(&scraper_config(base_url), RetryPolicy::unbounded()).unwrap();

    let ids = scraper.get_item_ids("rank", 1, 1).await.unwrap();

    assert_eq!(ids, vec![11, 13]);
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
}

// ============ Metadata API ============

fn thing_xml(ids: &str) -> String {
    let items: String = ids
        .split(',')
        .map(|id| {
            format!(
                r#"<item type="boardgame" id="{id}">
  <name type="primary" sortindex="1" value="Game {id}" />
  <minplayers value="2" />
  <maxplayers value="4" />
</item>"#
            )
        })
        .collect();
    format!(r#"<?xml version="1.0" encoding="utf-8"?><items>{}</items>"#, items)
}

#[derive(Clone)]
struct ThingState {
    /// Status codes returned before answering normally.
    script: Arc<Mutex<Vec<StatusCode>>>,
    /// Request numbers (0-based) answered with a well-formed empty `<items>`.
    empty_replies: Arc<Mutex<Vec<usize>>>,
    requested: Arc<Mutex<Vec<String>>>,
    auth: Arc<Mutex<Vec<Option<String>>>>,
}

impl ThingState {
    fn new(script: Vec<StatusCode>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            empty_replies: Arc::new(Mutex::new(Vec::new())),
            requested: Arc::new(Mutex::new(Vec::new())),
            auth: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

async fn thing_handler(
    State(state): State<ThingState>,
    headers: axum::http::HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let ids = query.get("id").cloned().unwrap_or_default();
    let request_no = {
        let mut requested = state.requested.lock().unwrap();
        requested.push(ids.clone());
        requested.len() - 1
    };
    state.auth.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );

    let scripted = {
        let mut script = state.script.lock().unwrap();
        if script.is_empty() {
            None
        } else {
            Some(script.remove(0))
        }
    };
    if state.empty_replies.lock().unwrap().contains(&request_no) {
        return r#"<?xml version="1.0" encoding="utf-8"?><items></items>"#.into_response();
    }
    match scripted {
        Some(status) => (status, "try later").into_response(),
        None => thing_xml(&ids).into_response(),
    }
}

fn api_config(base_url: String, token_env: &str) -> ApiConfig {
    ApiConfig {
        base_url,
        requests_per_minute: 60_000,
        ids_per_request: 2,
        timeout_secs: 5,
        token_env: token_env.to_string(),
    }
}

async fn thing_server(state: ThingState) -> String {
    serve(
        Router::new()
            .route("/thing", get(thing_handler))
            .with_state(state),
    )
    .await
}

#[tokio::test]
async fn test_api_client_chunks_requests() {
    let state = ThingState::new(vec![]);
    let base_url = thing_server(state.clone()).await;
    let client = BggApiClient::new(&api_config(base_url, "BGG_TEST_TOKEN_UNSET")).unwrap();

    let items = client.fetch(&[1, 2, 3, 4, 5]).await.unwrap();

    let ids: Vec<u64> = items.iter().filter_map(|i| i["id"].as_u64()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        *state.requested.lock().unwrap(),
        vec!["1,2".to_string(), "3,4".to_string(), "5".to_string()]
    );
    assert!(state.auth.lock().unwrap().iter().all(Option::is_none));
}

#[tokio::test]
async fn test_api_client_classifies_statuses() {
    let state = ThingState::new(vec![
        StatusCode::ACCEPTED,
        StatusCode::TOO_MANY_REQUESTS,
        StatusCode::BAD_GATEWAY,
        StatusCode::UNAUTHORIZED,
    ]);
    let base_url = thing_server(state.clone()).await;
    let client = BggApiClient::new(&api_config(base_url, "BGG_TEST_TOKEN_UNSET")).unwrap();

    for _ in 0..3 {
        let err = client.fetch(&[7]).await.unwrap_err();
        assert!(err.is_transient(), "{}", err);
    }
    let err = client.fetch(&[7]).await.unwrap_err();
    assert!(matches!(err, ApiError::Permanent(_)), "{}", err);

    let items = client.fetch(&[7]).await.unwrap();
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn test_api_client_sends_bearer_token() {
    std::env::set_var("BGG_TEST_TOKEN_SET", "s3cret");
    let state = ThingState::new(vec![]);
    let base_url = thing_server(state.clone()).await;
    let client = BggApiClient::new(&api_config(base_url, "BGG_TEST_TOKEN_SET")).unwrap();

    client.fetch(&[9]).await.unwrap();

    assert_eq!(
        state.auth.lock().unwrap()[0].as_deref(),
        Some("Bearer s3cret")
    );
}

#[tokio::test]
async fn test_empty_chunk_reply_refetches_whole_page() {
    let state = ThingState::new(vec![]);
    state.empty_replies.lock().unwrap().push(1);
    let base_url = thing_server(state.clone()).await;
    let client = BggApiClient::new(&api_config(base_url, "BGG_TEST_TOKEN_UNSET")).unwrap();
    let fetcher = BatchFetcher::new(
        &client,
        FetcherConfig {
            request_delay_ms: 0,
            transient_backoff_ms: 1,
            empty_backoff_base_ms: 1,
            empty_backoff_step_ms: 1,
        },
        RetryPolicy::unbounded(),
        &NoProgress,
    );

    let pages = fetcher.get_api_data(&[vec![1, 2, 3, 4, 5, 6]]).await.unwrap();

    let ids: Vec<u32> = pages[0].iter().filter_map(|r| r.id()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    // "1,2" then an empty "3,4" abandons the page; the retry asks for all three chunks
    assert_eq!(
        *state.requested.lock().unwrap(),
        vec!["1,2", "3,4", "1,2", "3,4", "5,6"]
    );
}
