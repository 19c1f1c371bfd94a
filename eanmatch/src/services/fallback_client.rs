//! Fallback catalog client
//!
//! Keyword search over the record's title/brand hints, used when the primary
//! exact-identifier lookup comes back empty or ambiguous. Noisier than the
//! primary source, so its candidates always go through scoring. Same cache
//! and retry protocol as the primary adapter, with its own token bucket.

use crate::db::cache::CacheStore;
use crate::services::catalog::{
    classify_status, with_retry, CatalogSource, RetryPolicy, SourceError, SourceResponse,
};
use async_trait::async_trait;
use eanmatch_common::config::MatcherConfig;
use eanmatch_common::normalize::normalize_text;
use eanmatch_common::types::{Candidate, CandidateSource, InputRecord, Marketplace};
use eanmatch_common::{CanonicalEan, Error, RequestFingerprint};
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::time::Duration;

const USER_AGENT: &str = "eanmatch/0.1.0 (+https://github.com/eanmatch/eanmatch)";
const SERVICE: &str = "fallback";
const OPERATION: &str = "search-items";

type DirectRateLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Text/brand search adapter
pub struct FallbackClient {
    http: reqwest::Client,
    rate_limiter: DirectRateLimiter,
    cache: CacheStore,
    retry: RetryPolicy,
    endpoint: String,
    access_token: String,
    cache_ttl: Duration,
}

impl FallbackClient {
    pub fn new(config: &MatcherConfig, cache: CacheStore) -> eanmatch_common::Result<Self> {
        let source = &config.fallback;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        let quota = governor::Quota::per_second(
            NonZeroU32::new(source.requests_per_second.max(1)).unwrap(),
        );

        Ok(Self {
            http,
            rate_limiter: governor::RateLimiter::direct(quota),
            cache,
            retry: RetryPolicy::new(
                config.max_retry_attempts,
                config.backoff_base(),
                config.backoff_cap(),
            ),
            endpoint: source.endpoint.trim_end_matches('/').to_string(),
            access_token: source.access_token.clone(),
            cache_ttl: config.cache_ttl(),
        })
    }

    /// Normalized keyword query from the record's hints
    ///
    /// Normalization happens here, before fingerprinting, so equivalent raw
    /// hints share one cache entry.
    fn build_query(record: &InputRecord) -> String {
        let mut parts = Vec::new();
        if let Some(title) = &record.hint_title {
            parts.push(normalize_text(title));
        }
        if let Some(brand) = &record.hint_brand {
            parts.push(normalize_text(brand));
        }
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }

    async fn fetch_with_limit(
        &self,
        keywords: &str,
        marketplace: Marketplace,
    ) -> Result<serde_json::Value, SourceError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/search/items", self.endpoint);

        tracing::debug!(keywords = %keywords, marketplace = %marketplace, "Querying fallback search");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("keywords", keywords),
                ("marketplaceIds", marketplace.amazon_id()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("network error: {}", e)))?;

        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(serde_json::json!({ "searchResult": { "items": [] } }));
        }
        if let Some(err) = classify_status(status) {
            return Err(err);
        }

        response
            .json()
            .await
            .map_err(|e| SourceError::Transient(format!("malformed response: {}", e)))
    }
}

#[async_trait]
impl CatalogSource for FallbackClient {
    fn source_id(&self) -> &'static str {
        SERVICE
    }

    async fn lookup(
        &self,
        record: &InputRecord,
        _ean: &CanonicalEan,
    ) -> Result<SourceResponse, SourceError> {
        let keywords = Self::build_query(record);

        let fingerprint =
            RequestFingerprint::compute(SERVICE, OPERATION, &keywords, record.marketplace);

        if keywords.is_empty() {
            // No text to search on; the orchestrator normally filters this
            // case out before calling
            return Ok(SourceResponse {
                candidates: Vec::new(),
                fingerprint,
            });
        }

        if let Some(cached) = self.cache.get(&fingerprint).await {
            tracing::debug!(keywords = %keywords, marketplace = %record.marketplace, "Fallback cache hit");
            return Ok(SourceResponse {
                candidates: extract_candidates(&cached.payload),
                fingerprint,
            });
        }

        let payload = with_retry(&self.retry, SERVICE, || {
            self.fetch_with_limit(&keywords, record.marketplace)
        })
        .await?;

        self.cache.put(&fingerprint, &payload, self.cache_ttl).await;

        let candidates = extract_candidates(&payload);
        tracing::debug!(
            keywords = %keywords,
            marketplace = %record.marketplace,
            candidates = candidates.len(),
            "Fallback lookup complete"
        );

        Ok(SourceResponse {
            candidates,
            fingerprint,
        })
    }
}

/// Boundary extraction for the fallback payload shape
fn extract_candidates(payload: &serde_json::Value) -> Vec<Candidate> {
    let Some(items) = payload
        .get("searchResult")
        .and_then(|r| r.get("items"))
        .and_then(|v| v.as_array())
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let asin = item
                .get("asin")
                .and_then(|v| v.as_str())
                .filter(|a| !a.is_empty())?;

            let info = item.get("itemInfo");
            let title = info
                .and_then(|i| i.get("title"))
                .and_then(|t| t.get("displayValue"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            let brand = info
                .and_then(|i| i.get("byLineInfo"))
                .and_then(|b| b.get("brand"))
                .and_then(|b| b.get("displayValue"))
                .and_then(|v| v.as_str())
                .map(str::to_string);

            let mut identifiers = BTreeSet::new();
            if let Some(eans) = info
                .and_then(|i| i.get("externalIds"))
                .and_then(|e| e.get("eans"))
                .and_then(|e| e.get("displayValues"))
                .and_then(|v| v.as_array())
            {
                for ean in eans {
                    if let Some(value) = ean.as_str() {
                        identifiers.insert(value.to_string());
                    }
                }
            }

            Some(Candidate {
                asin: asin.to_string(),
                source: CandidateSource::Fallback,
                title,
                brand,
                identifiers,
            })
        })
        .collect()
}
