//! In-memory [`DocumentStore`] for tests.
//!
//! All collections live behind one `RwLock`, so promotion is a single
//! critical section and trivially atomic.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::models::ItemRecord;

use super::DocumentStore;

pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// Seeds `collection` with `docs`, replacing whatever was there.
    pub fn with_collection(self, collection: &str, docs: Vec<Value>) -> Self {
        if let Ok(mut guard) = self.collections.write() {
            guard.insert(collection.to_string(), docs);
        }
        self
    }

    /// Snapshot of a collection's documents, if it exists.
    pub fn snapshot(&self, collection: &str) -> Option<Vec<Value>> {
        self.collections
            .read()
            .ok()
            .and_then(|guard| guard.get(collection).cloned())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn clear(&self, collection: &str) -> Result<()> {
        let mut guard = self.collections.write().map_err(poisoned)?;
        guard.insert(collection.to_string(), Vec::new());
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: &[ItemRecord]) -> Result<usize> {
        let mut guard = self.collections.write().map_err(poisoned)?;
        let stored = guard.entry(collection.to_string()).or_default();
        stored.extend(docs.iter().cloned().map(ItemRecord::into_value));
        Ok(docs.len())
    }

    async fn promote(&self, staging: &str, live: &str) -> Result<()> {
        let mut guard = self.collections.write().map_err(poisoned)?;
        let docs = guard
            .remove(staging)
            .ok_or_else(|| anyhow!("collection '{}' does not exist", staging))?;
        guard.insert(live.to_string(), docs);
        guard.insert(staging.to_string(), Vec::new());
        Ok(())
    }

    async fn find(&self, collection: &str, limit: i64) -> Result<Vec<Value>> {
        let guard = self.collections.read().map_err(poisoned)?;
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(guard
            .get(collection)
            .map(|docs| docs.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, collection: &str) -> Result<i64> {
        let guard = self.collections.read().map_err(poisoned)?;
        Ok(guard.get(collection).map(|d| d.len() as i64).unwrap_or(0))
    }
}
