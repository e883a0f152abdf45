//! Dataset statistics.
//!
//! `bgg stats` prints how many documents the live and staging collections
//! hold and when live was last replaced. A non-empty staging collection
//! outside a run means the last harvest failed before promotion.

use anyhow::Result;

use crate::config::Config;
use crate::db;
use crate::store::{DocumentStore, SqliteStore};

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);

    let live = &config.store.live_collection;
    let staging = &config.store.staging_collection;
    let live_count = store.count(live).await?;
    let staging_count = store.count(staging).await?;
    let last = store.last_published(live).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("BGG Harvest — Dataset Stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  {:<12} {:<20} {:>8}", "ROLE", "COLLECTION", "DOCS");
    println!("  {}", "-".repeat(42));
    println!("  {:<12} {:<20} {:>8}", "live", live, live_count);
    println!("  {:<12} {:<20} {:>8}", "staging", staging, staging_count);
    println!();
    match last {
        Some((ts, documents)) => println!(
            "  Last publish: {} ({} documents)",
            format_ts_relative(ts),
            documents
        ),
        None => println!("  Last publish: never"),
    }
    if staging_count > 0 {
        println!("  Note: staging is not empty; the last harvest did not finish.");
    }
    println!();

    store.pool().close().await;
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Relative age of a Unix timestamp ("3 hours ago"), falling back to a date.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        plural(delta / 60, "min")
    } else if delta < 86400 {
        plural(delta / 3600, "hour")
    } else if delta < 86400 * 30 {
        plural(delta / 86400, "day")
    } else {
        format_ts_iso(ts)
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
