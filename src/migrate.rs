use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::store::SqliteStore;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // One row per successful promotion
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS publish_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            promoted_at INTEGER NOT NULL,
            documents INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_publish_log_collection ON publish_log(collection, id DESC)",
    )
    .execute(&pool)
    .await?;

    // Both collections exist from the start so the read API can serve an
    // empty live set before the first harvest.
    let store = SqliteStore::new(pool);
    store
        .ensure_collection(&config.store.live_collection)
        .await?;
    store
        .ensure_collection(&config.store.staging_collection)
        .await?;

    store.pool().close().await;
    Ok(())
}
