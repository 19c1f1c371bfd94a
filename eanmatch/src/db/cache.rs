//! Content-addressed upstream response cache
//!
//! Maps a request fingerprint to the last observed upstream payload with a
//! TTL. `put` is the only mutator (last-write-wins; responses for identical
//! fingerprints are semantically equivalent). Store failures on the read and
//! write paths degrade to "treat as absent" so a broken cache can never block
//! the batch - it only defeats caching.

use chrono::{DateTime, Utc};
use eanmatch_common::{RequestFingerprint, Result};
use sqlx::SqlitePool;
use std::time::Duration;

/// A previously observed upstream response
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub fingerprint: RequestFingerprint,
    /// Opaque upstream payload; parsed by the owning client adapter
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CachedResponse {
    /// True once `now > fetched_at + ttl`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::seconds(self.ttl.as_secs() as i64);
        now > self.fetched_at + ttl
    }
}

/// SQLite-backed cache store, shared by both client adapters
#[derive(Clone)]
pub struct CacheStore {
    db: SqlitePool,
}

impl CacheStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Point read. Returns `None` for missing, expired, or unreadable
    /// entries; a non-expired hit must short-circuit the upstream call.
    pub async fn get(&self, fingerprint: &RequestFingerprint) -> Option<CachedResponse> {
        let row: Option<(String, String, i64)> = match sqlx::query_as(
            "SELECT payload, fetched_at, ttl_seconds FROM response_cache WHERE fingerprint = ?",
        )
        .bind(fingerprint.as_str())
        .fetch_optional(&self.db)
        .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, "Cache read failed, treating as absent: {}", e);
                return None;
            }
        };

        let (payload_text, fetched_at_text, ttl_seconds) = row?;

        let payload: serde_json::Value = match serde_json::from_str(&payload_text) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, "Cache payload unreadable, treating as absent: {}", e);
                return None;
            }
        };
        let fetched_at = match DateTime::parse_from_rfc3339(&fetched_at_text) {
            Ok(t) => t.with_timezone(&Utc),
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, "Cache timestamp unreadable, treating as absent: {}", e);
                return None;
            }
        };

        let cached = CachedResponse {
            fingerprint: fingerprint.clone(),
            payload,
            fetched_at,
            ttl: Duration::from_secs(ttl_seconds.max(0) as u64),
        };

        if cached.is_expired(Utc::now()) {
            tracing::debug!(fingerprint = %fingerprint, "Cache entry expired");
            return None;
        }

        Some(cached)
    }

    /// Store a fresh upstream payload. Concurrent puts for the same
    /// fingerprint are idempotent (last write wins). Failures are logged and
    /// swallowed.
    pub async fn put(&self, fingerprint: &RequestFingerprint, payload: &serde_json::Value, ttl: Duration) {
        let result = sqlx::query(
            "INSERT OR REPLACE INTO response_cache (fingerprint, payload, fetched_at, ttl_seconds) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(fingerprint.as_str())
        .bind(payload.to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(ttl.as_secs() as i64)
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            tracing::warn!(fingerprint = %fingerprint, "Cache write failed, continuing uncached: {}", e);
        }
    }

    /// Remove one entry, or all entries when `fingerprint` is `None`.
    /// Takes effect only for calls made after invalidation.
    pub async fn invalidate(&self, fingerprint: Option<&RequestFingerprint>) -> Result<u64> {
        let result = match fingerprint {
            Some(fp) => {
                sqlx::query("DELETE FROM response_cache WHERE fingerprint = ?")
                    .bind(fp.as_str())
                    .execute(&self.db)
                    .await?
            }
            None => sqlx::query("DELETE FROM response_cache").execute(&self.db).await?,
        };
        Ok(result.rows_affected())
    }
}
