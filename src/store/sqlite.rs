//! SQLite-backed [`DocumentStore`].
//!
//! Each collection is a table `(seq INTEGER PRIMARY KEY AUTOINCREMENT,
//! doc TEXT NOT NULL)` holding one JSON document per row. Promotion runs
//! `DROP TABLE live; ALTER TABLE staging RENAME TO live; CREATE TABLE
//! staging` inside one transaction; SQLite DDL is transactional, so readers
//! on other connections see the old table until commit and the new one
//! after it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};

use crate::config::is_collection_name;
use crate::models::ItemRecord;

use super::DocumentStore;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates `collection` if it does not exist yet.
    pub async fn ensure_collection(&self, collection: &str) -> Result<()> {
        let table = table_name(collection)?;
        sqlx::query(&create_table_sql(&table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// When `collection` was last promoted, and how many documents it got.
    pub async fn last_published(&self, collection: &str) -> Result<Option<(i64, i64)>> {
        let row = sqlx::query(
            "SELECT promoted_at, documents FROM publish_log WHERE collection = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(collection)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("promoted_at"), r.get("documents"))))
    }

    async fn exists(&self, collection: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
        )
        .bind(collection)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

/// Validated, quoted table identifier for a collection name.
fn table_name(collection: &str) -> Result<String> {
    if !is_collection_name(collection) {
        bail!("invalid collection name '{}'", collection);
    }
    Ok(format!("\"{}\"", collection))
}

fn create_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (seq INTEGER PRIMARY KEY AUTOINCREMENT, doc TEXT NOT NULL)",
        table
    )
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn clear(&self, collection: &str) -> Result<()> {
        let table = table_name(collection)?;
        self.ensure_collection(collection).await?;
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_many(&self, collection: &str, docs: &[ItemRecord]) -> Result<usize> {
        let table = table_name(collection)?;
        let sql = format!("INSERT INTO {} (doc) VALUES (?)", table);

        let mut tx = self.pool.begin().await?;
        for doc in docs {
            let json = serde_json::to_string(doc)?;
            sqlx::query(&sql).bind(json).execute(&mut *tx).await?;
        }
        tx.commit().await?;

        Ok(docs.len())
    }

    async fn promote(&self, staging: &str, live: &str) -> Result<()> {
        let staging_table = table_name(staging)?;
        let live_table = table_name(live)?;
        if !self.exists(staging).await? {
            bail!("collection '{}' does not exist", staging);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", live_table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            staging_table, live_table
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&create_table_sql(&staging_table))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO publish_log (collection, promoted_at, documents) SELECT ?, ?, COUNT(*) FROM {}",
            live_table
        ))
        .bind(live)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
        tx.commit()
            .await
            .with_context(|| format!("failed to promote '{}' to '{}'", staging, live))?;

        Ok(())
    }

    async fn find(&self, collection: &str, limit: i64) -> Result<Vec<Value>> {
        let table = table_name(collection)?;
        if !self.exists(collection).await? {
            return Ok(Vec::new());
        }
        let rows: Vec<String> =
            sqlx::query_scalar(&format!("SELECT doc FROM {} ORDER BY seq LIMIT ?", table))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .map(|doc| serde_json::from_str(doc).context("stored document is not valid JSON"))
            .collect()
    }

    async fn count(&self, collection: &str) -> Result<i64> {
        let table = table_name(collection)?;
        if !self.exists(collection).await? {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use serde_json::json;
    use tempfile::TempDir;

    async fn fresh_store(tmp: &TempDir) -> SqliteStore {
        let config = Config::with_db_path(tmp.path().join("bgg.sqlite"));
        SqliteStore::new(db::connect(&config).await.unwrap())
    }

    fn record(id: u32) -> ItemRecord {
        match json!({ "id": id, "name": format!("Game {}", id) }) {
            Value::Object(m) => ItemRecord::clean(m),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn missing_collection_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp).await;

        assert_eq!(store.count("game_info").await.unwrap(), 0);
        assert!(store.find("game_info", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn promote_replaces_live_and_recreates_staging() {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp).await;
        sqlx::query(
            "CREATE TABLE publish_log (id INTEGER PRIMARY KEY AUTOINCREMENT, collection TEXT NOT NULL, promoted_at INTEGER NOT NULL, documents INTEGER NOT NULL)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        store.clear("live").await.unwrap();
        store.insert_many("live", &[record(1)]).await.unwrap();
        store.clear("staging").await.unwrap();
        store
            .insert_many("staging", &[record(2), record(3)])
            .await
            .unwrap();

        store.promote("staging", "live").await.unwrap();

        let ids: Vec<u64> = store
            .find("live", 10)
            .await
            .unwrap()
            .iter()
            .filter_map(|d| d["id"].as_u64())
            .collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(store.count("staging").await.unwrap(), 0);
        assert_eq!(store.last_published("live").await.unwrap().map(|(_, n)| n), Some(2));
    }

    #[tokio::test]
    async fn rejects_unsafe_collection_names() {
        let tmp = TempDir::new().unwrap();
        let store = fresh_store(&tmp).await;
        assert!(store.find("live; DROP TABLE x", 1).await.is_err());
    }
}
