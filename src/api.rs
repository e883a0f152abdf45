//! Rate-limited client for the BoardGameGeek XML API2 `thing` endpoint.
//!
//! [`MetadataApi`] is the seam the batch fetcher talks to; [`BggApiClient`]
//! is the HTTP implementation. Each client owns its own [`RateLimiter`], so
//! two clients never share pacing state.
//!
//! # Failure classification
//!
//! | Condition | Result |
//! |-----------|--------|
//! | Connection reset, timeout | [`ApiError::Transient`] |
//! | HTTP 202 (request queued), 429, 5xx | [`ApiError::Transient`] |
//! | Body is not a well-formed `<items>` document | [`ApiError::Transient`] |
//! | Any other non-success status | [`ApiError::Permanent`] |
//! | Well-formed `<items>` (possibly empty) | `Ok` |
//!
//! An empty successful answer is not an error here; the fetcher decides
//! what it means.

use anyhow::{Context, Result};
use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ApiConfig;
use crate::models::{ItemId, RawItem, LANGUAGE_DEPENDENCE};
use crate::rate_limit::RateLimiter;

/// Failure of a metadata request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Worth retrying: throttling, network trouble, or a garbled body.
    Transient(String),
    /// Retrying will not help (bad request, auth failure).
    Permanent(String),
}

impl ApiError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Transient(msg) => write!(f, "transient API error: {}", msg),
            ApiError::Permanent(msg) => write!(f, "API error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

/// Source of per-item metadata.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// Fetches raw items for `ids`. Unknown ids are simply absent from the result.
    async fn fetch(&self, ids: &[ItemId]) -> Result<Vec<RawItem>, ApiError>;
}

/// HTTP client for `GET {base_url}/thing?id=..&stats=1`.
pub struct BggApiClient {
    http: reqwest::Client,
    base_url: String,
    ids_per_request: usize,
    token: Option<String>,
    limiter: RateLimiter,
}

impl BggApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("bgg-harvest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to construct metadata API HTTP client")?;

        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ids_per_request: config.ids_per_request.max(1),
            token,
            limiter: RateLimiter::per_minute(config.requests_per_minute),
        })
    }

    fn thing_url(&self, ids: &[ItemId]) -> String {
        let id_list: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        format!("{}/thing?id={}&stats=1", self.base_url, id_list.join(","))
    }

    async fn fetch_chunk(&self, ids: &[ItemId]) -> Result<Vec<RawItem>, ApiError> {
        self.limiter.acquire().await;

        let url = self.thing_url(ids);
        debug!(url = %url, ids = ids.len(), "requesting item metadata");

        let mut request = self.http.get(&url);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::ACCEPTED
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            return Err(ApiError::Transient(format!("upstream returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Permanent(format!(
                "upstream returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transient(format!("failed to read body: {}", e)))?;
        parse_things(&body)
    }
}

#[async_trait]
impl MetadataApi for BggApiClient {
    /// An empty reply to any chunk empties the whole answer, so the caller
    /// backs off and asks for the page again instead of keeping a partial one.
    async fn fetch(&self, ids: &[ItemId]) -> Result<Vec<RawItem>, ApiError> {
        let mut items = Vec::new();
        for chunk in ids.chunks(self.ids_per_request) {
            let answer = self.fetch_chunk(chunk).await?;
            if answer.is_empty() {
                warn!(ids = chunk.len(), "empty reply for a chunk, discarding page");
                return Ok(Vec::new());
            }
            items.extend(answer);
        }
        Ok(items)
    }
}

// ============ XML parsing ============

/// Attribute-only elements copied onto the item as numbers.
const SCALAR_FIELDS: &[&str] = &[
    "yearpublished",
    "minplayers",
    "maxplayers",
    "playingtime",
    "minplaytime",
    "maxplaytime",
    "minage",
];

const TEXT_FIELDS: &[&str] = &["thumbnail", "image", "description"];

const RATING_FIELDS: &[&str] = &[
    "usersrated",
    "average",
    "bayesaverage",
    "stddev",
    "median",
    "owned",
    "trading",
    "wanting",
    "wishing",
    "numcomments",
    "numweights",
    "averageweight",
];

/// `<link type=..>` values collected as name lists.
fn name_list_field(link_type: &str) -> Option<&'static str> {
    match link_type {
        "boardgamecategory" => Some("categories"),
        "boardgamemechanic" => Some("mechanics"),
        "boardgamedesigner" => Some("designers"),
        "boardgameartist" => Some("artists"),
        "boardgamepublisher" => Some("publishers"),
        "boardgamefamily" => Some("families"),
        _ => None,
    }
}

/// `<link type=..>` values collected as `{id, name}` lists.
fn ref_list_field(link_type: &str) -> Option<&'static str> {
    match link_type {
        "boardgameexpansion" => Some("expansions"),
        "boardgameimplementation" => Some("implementations"),
        _ => None,
    }
}

const LIST_FIELDS: &[&str] = &[
    "alternative_names",
    "categories",
    "mechanics",
    "designers",
    "artists",
    "publishers",
    "families",
    "expansions",
    "implementations",
];

/// Parses a `thing` response into raw items.
///
/// Anything other than a well-formed document rooted at `<items>` is a
/// transient failure: the API answers throttled or queued requests with
/// `<error>` / `<message>` bodies.
pub fn parse_things(xml: &str) -> Result<Vec<RawItem>, ApiError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut parser = ThingParser::default();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => parser.open(&e, false)?,
            Ok(Event::Empty(e)) => parser.open(&e, true)?,
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                parser.close(&name);
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| ApiError::Transient(format!("malformed XML text: {}", e)))?;
                parser.text(&text);
            }
            Ok(Event::CData(c)) => parser.text(&String::from_utf8_lossy(&c)),
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ApiError::Transient(format!(
                    "malformed XML at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }
    }

    if !parser.saw_root {
        return Err(ApiError::Transient("empty response body".to_string()));
    }
    if !parser.stack.is_empty() {
        return Err(ApiError::Transient("truncated XML document".to_string()));
    }
    Ok(parser.items)
}

#[derive(Default)]
struct ThingParser {
    items: Vec<RawItem>,
    stack: Vec<String>,
    saw_root: bool,
    current: Option<ItemBuilder>,
    text_field: Option<String>,
    poll: Option<String>,
    in_ratings: bool,
}

#[derive(Default)]
struct ItemBuilder {
    fields: RawItem,
    stats: Map<String, Value>,
    ranks: Vec<Value>,
    language_dependence: Map<String, Value>,
}

impl ItemBuilder {
    fn push(&mut self, field: &str, value: Value) {
        let entry = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(list) = entry {
            list.push(value);
        }
    }

    fn finish(mut self) -> RawItem {
        for field in LIST_FIELDS {
            self.fields
                .entry(field.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
        }
        self.stats
            .insert("ranks".to_string(), Value::Array(self.ranks));
        self.fields
            .insert("stats".to_string(), Value::Object(self.stats));
        self.fields.insert(
            LANGUAGE_DEPENDENCE.to_string(),
            Value::Object(self.language_dependence),
        );
        self.fields
    }
}

impl ThingParser {
    fn open(&mut self, e: &BytesStart, is_empty: bool) -> Result<(), ApiError> {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();

        if self.stack.is_empty() {
            if name != "items" {
                return Err(ApiError::Transient(format!(
                    "unexpected root element <{}>",
                    name
                )));
            }
            self.saw_root = true;
        } else if name == "item" && self.stack.len() == 1 {
            let id = attr(e, b"id")
                .and_then(|v| v.parse::<ItemId>().ok())
                .ok_or_else(|| ApiError::Transient("<item> without numeric id".to_string()))?;
            let mut builder = ItemBuilder::default();
            builder.fields.insert("id".to_string(), json!(id));
            if let Some(kind) = attr(e, b"type") {
                builder.fields.insert("type".to_string(), json!(kind));
            }
            self.current = Some(builder);
            if is_empty {
                self.finish_item();
            }
        } else if self.current.is_some() {
            self.open_item_child(&name, e, is_empty);
        }

        if !is_empty {
            self.stack.push(name);
        }
        Ok(())
    }

    fn open_item_child(&mut self, name: &str, e: &BytesStart, is_empty: bool) {
        let at_item_level = self.stack.len() == 2;
        let poll = self.poll.clone();
        let in_ratings = self.in_ratings;
        let Some(item) = self.current.as_mut() else {
            return;
        };

        match name {
            _ if at_item_level && !is_empty && TEXT_FIELDS.contains(&name) => {
                item.fields.insert(name.to_string(), json!(""));
                self.text_field = Some(name.to_string());
            }
            "name" if at_item_level => {
                let value = attr(e, b"value").unwrap_or_default();
                if attr(e, b"type").as_deref() == Some("primary") {
                    item.fields.insert("name".to_string(), json!(value));
                } else {
                    item.push("alternative_names", json!(value));
                }
            }
            _ if at_item_level && SCALAR_FIELDS.contains(&name) => {
                if let Some(v) = attr(e, b"value") {
                    item.fields.insert(name.to_string(), number_value(&v));
                }
            }
            "link" if at_item_level => {
                let kind = attr(e, b"type").unwrap_or_default();
                let value = attr(e, b"value").unwrap_or_default();
                if let Some(field) = name_list_field(&kind) {
                    item.push(field, json!(value));
                } else if let Some(field) = ref_list_field(&kind) {
                    let id = attr(e, b"id")
                        .map(|v| number_value(&v))
                        .unwrap_or(Value::Null);
                    item.push(field, json!({ "id": id, "name": value }));
                }
            }
            "poll" if !is_empty => {
                self.poll = attr(e, b"name");
            }
            "result" if poll.as_deref() == Some(LANGUAGE_DEPENDENCE) => {
                if let Some(level) = attr(e, b"level") {
                    let votes = attr(e, b"numvotes")
                        .map(|v| number_value(&v))
                        .unwrap_or(json!(0));
                    item.language_dependence.insert(
                        level,
                        json!({
                            "description": attr(e, b"value").unwrap_or_default(),
                            "votes": votes,
                        }),
                    );
                }
            }
            "ratings" if !is_empty => {
                self.in_ratings = true;
            }
            "rank" if in_ratings => {
                let value = attr(e, b"value")
                    .map(|v| number_value(&v))
                    .filter(Value::is_number)
                    .unwrap_or(Value::Null);
                item.ranks.push(json!({
                    "id": attr(e, b"id").map(|v| number_value(&v)).unwrap_or(Value::Null),
                    "type": attr(e, b"type").unwrap_or_default(),
                    "name": attr(e, b"name").unwrap_or_default(),
                    "friendlyname": attr(e, b"friendlyname").unwrap_or_default(),
                    "value": value,
                }));
            }
            _ if in_ratings && RATING_FIELDS.contains(&name) => {
                if let Some(v) = attr(e, b"value") {
                    item.stats.insert(name.to_string(), number_value(&v));
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, name: &str) {
        self.stack.pop();
        match name {
            "item" if self.stack.len() == 1 => self.finish_item(),
            "poll" => self.poll = None,
            "ratings" => self.in_ratings = false,
            _ if self.text_field.as_deref() == Some(name) => self.text_field = None,
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        let (Some(field), Some(item)) = (self.text_field.as_ref(), self.current.as_mut()) else {
            return;
        };
        let existing = item
            .fields
            .get(field)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        item.fields
            .insert(field.clone(), json!(format!("{}{}", existing, text)));
    }

    fn finish_item(&mut self) {
        if let Some(builder) = self.current.take() {
            self.items.push(builder.finish());
        }
        self.text_field = None;
        self.poll = None;
        self.in_ratings = false;
    }
}

fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Integers stay integers, decimals become floats, anything else a string.
fn number_value(raw: &str) -> Value {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        json!(n)
    } else if let Ok(f) = raw.parse::<f64>() {
        json!(f)
    } else {
        json!(raw)
    }
}
