//! SQLite run store for one batch
//!
//! A single database file holds both the upstream response cache and the
//! append-only run ledger. Cache unavailability degrades to pass-through;
//! ledger unavailability is fatal for the batch (resume depends on it).

pub mod cache;
pub mod ledger;

pub use cache::{CacheStore, CachedResponse};
pub use ledger::RunLedger;

use eanmatch_common::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Open (or create) the run store and initialize its tables
pub async fn init_run_store(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to run store: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create the run-store tables if they don't exist
async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS response_cache (
            fingerprint TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            fetched_at TEXT NOT NULL,
            ttl_seconds INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_ledger (
            ean TEXT NOT NULL,
            marketplace TEXT NOT NULL,
            status TEXT NOT NULL,
            asin TEXT,
            confidence REAL NOT NULL,
            evidence TEXT NOT NULL,
            matched_title TEXT,
            matched_brand TEXT,
            fingerprints TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            PRIMARY KEY (ean, marketplace)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::debug!("Run store tables initialized (response_cache, run_ledger)");

    Ok(())
}
