//! Core data types that flow through a harvest run.
//!
//! Ids come out of the ranking scraper, raw items come back from the
//! metadata API, and cleaned [`ItemRecord`]s are what the store holds.

use serde::Serialize;
use serde_json::{Map, Value};

/// Catalog id of one item on the ranking site.
pub type ItemId = u32;

/// The ids scraped from one ranking page, in document order.
pub type Page = Vec<ItemId>;

/// Field mapping for one item exactly as the API client produced it.
pub type RawItem = Map<String, Value>;

/// Nested poll results keyed by level; not representable as a flat document.
pub const LANGUAGE_DEPENDENCE: &str = "language_dependence";

/// A cleaned item, ready to be stored as one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ItemRecord(Map<String, Value>);

impl ItemRecord {
    /// Strips the fields the store cannot hold and keeps everything else.
    pub fn clean(mut raw: RawItem) -> Self {
        raw.remove(LANGUAGE_DEPENDENCE);
        Self(raw)
    }

    pub fn id(&self) -> Option<ItemId> {
        self.0
            .get("id")
            .and_then(Value::as_u64)
            .and_then(|v| ItemId::try_from(v).ok())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// What fetching one page produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// The API answered with at least one item.
    Fetched(Vec<ItemRecord>),
    /// The page had no base-game ids left after scraping; nothing to ask for.
    NoGenuineItems,
    /// A non-empty request came back with zero items. Treated as throttling.
    UpstreamEmptyResponse,
}

impl PageOutcome {
    /// Classifies an API answer for a page of `requested` ids.
    pub fn classify(requested: usize, items: Vec<RawItem>) -> Self {
        if requested == 0 {
            PageOutcome::NoGenuineItems
        } else if items.is_empty() {
            PageOutcome::UpstreamEmptyResponse
        } else {
            PageOutcome::Fetched(items.into_iter().map(ItemRecord::clean).collect())
        }
    }
}
