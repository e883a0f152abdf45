//! Document store abstraction.
//!
//! A store holds named collections of JSON documents. The harvest only
//! needs four operations on them: wipe, bulk insert, read back, and an
//! atomic rename that replaces one collection with another.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`SqliteStore`] | The deployed store; one table per collection |
//! | [`InMemoryStore`] | Tests and embedding the pipeline |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::models::ItemRecord;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Removes every document from `collection`, creating it if missing.
    async fn clear(&self, collection: &str) -> Result<()>;

    /// Appends `docs` to `collection` in order. All or nothing per call.
    async fn insert_many(&self, collection: &str, docs: &[ItemRecord]) -> Result<usize>;

    /// Makes `staging` the new `live` in one indivisible step.
    ///
    /// The previous `live` is dropped and an empty `staging` takes the old
    /// name. Readers see either the old or the new live set, never neither.
    async fn promote(&self, staging: &str, live: &str) -> Result<()>;

    /// Up to `limit` documents from `collection` in insertion order.
    async fn find(&self, collection: &str, limit: i64) -> Result<Vec<Value>>;

    /// Number of documents in `collection` (0 if it does not exist).
    async fn count(&self, collection: &str) -> Result<i64>;
}
