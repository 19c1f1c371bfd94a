//! Primary catalog client
//!
//! Exact-identifier search: asks the catalog service for items carrying the
//! record's EAN. Authoritative and cheap, so the pipeline always runs it
//! first. Owns its token-bucket limiter; admission happens inside the retry
//! loop so every attempt (and only actual upstream attempts) spends quota.

use crate::db::cache::CacheStore;
use crate::services::catalog::{
    classify_status, with_retry, CatalogSource, RetryPolicy, SourceError, SourceResponse,
};
use async_trait::async_trait;
use eanmatch_common::config::MatcherConfig;
use eanmatch_common::types::{Candidate, CandidateSource, InputRecord, Marketplace};
use eanmatch_common::{CanonicalEan, Error, RequestFingerprint};
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::time::Duration;

const USER_AGENT: &str = "eanmatch/0.1.0 (+https://github.com/eanmatch/eanmatch)";
const SERVICE: &str = "primary";
const OPERATION: &str = "catalog-items";

type DirectRateLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Exact-identifier catalog adapter
pub struct PrimaryClient {
    http: reqwest::Client,
    rate_limiter: DirectRateLimiter,
    cache: CacheStore,
    retry: RetryPolicy,
    endpoint: String,
    access_token: String,
    cache_ttl: Duration,
}

impl PrimaryClient {
    pub fn new(config: &MatcherConfig, cache: CacheStore) -> eanmatch_common::Result<Self> {
        let source = &config.primary;

        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        // max(1) keeps the quota non-zero
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

    /// One rate-limited upstream attempt
    async fn fetch_with_limit(
        &self,
        ean: &CanonicalEan,
        marketplace: Marketplace,
    ) -> Result<serde_json::Value, SourceError> {
        // Token-bucket admission suspends until a token is available
        self.rate_limiter.until_ready().await;

        let url = format!("{}/catalog/2022-04-01/items", self.endpoint);

        tracing::debug!(ean = %ean, marketplace = %marketplace, "Querying primary catalog");

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("identifiers", ean.as_str()),
                ("identifiersType", "EAN"),
                ("marketplaceIds", marketplace.amazon_id()),
            ])
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("network error: {}", e)))?;

        let status = response.status();

        // Not found is the normal empty outcome, not an error
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(serde_json::json!({ "items": [] }));
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
impl CatalogSource for PrimaryClient {
    fn source_id(&self) -> &'static str {
        SERVICE
    }

    async fn lookup(
        &self,
        record: &InputRecord,
        ean: &CanonicalEan,
    ) -> Result<SourceResponse, SourceError> {
        // Fingerprint is computed before admission so a cache hit never
        // consumes quota
        let fingerprint =
            RequestFingerprint::compute(SERVICE, OPERATION, ean.as_str(), record.marketplace);

        if let Some(cached) = self.cache.get(&fingerprint).await {
            tracing::debug!(ean = %ean, marketplace = %record.marketplace, "Primary cache hit");
            return Ok(SourceResponse {
                candidates: extract_candidates(&cached.payload, record.marketplace),
                fingerprint,
            });
        }

        let payload = with_retry(&self.retry, SERVICE, || {
            self.fetch_with_limit(ean, record.marketplace)
        })
        .await?;

        self.cache.put(&fingerprint, &payload, self.cache_ttl).await;

        let candidates = extract_candidates(&payload, record.marketplace);
        tracing::debug!(
            ean = %ean,
            marketplace = %record.marketplace,
            candidates = candidates.len(),
            "Primary lookup complete"
        );

        Ok(SourceResponse {
            candidates,
            fingerprint,
        })
    }
}

/// Boundary extraction for the primary payload shape
///
/// The upstream response is treated as opaque JSON and validated here rather
/// than trusted: items without an ASIN are dropped, and the
/// marketplace-scoped summary is preferred over top-level fields.
fn extract_candidates(payload: &serde_json::Value, marketplace: Marketplace) -> Vec<Candidate> {
    let Some(items) = payload.get("items").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let summary = item
                .get("summaries")
                .and_then(|v| v.as_array())
                .and_then(|summaries| {
                    summaries.iter().find(|s| {
                        s.get("marketplaceId").and_then(|m| m.as_str())
                            == Some(marketplace.amazon_id())
                    })
                });

            let asin = item
                .get("asin")
                .and_then(|v| v.as_str())
                .or_else(|| summary.and_then(|s| s.get("asin").and_then(|v| v.as_str())))
                .filter(|a| !a.is_empty())?;

            let title = summary
                .and_then(|s| s.get("itemName").and_then(|v| v.as_str()))
                .map(str::to_string);
            let brand = summary
                .and_then(|s| {
                    s.get("brandName")
                        .or_else(|| s.get("brand"))
                        .and_then(|v| v.as_str())
                })
                .map(str::to_string);

            let mut identifiers = BTreeSet::new();
            if let Some(groups) = item.get("identifiers").and_then(|v| v.as_array()) {
                for group in groups {
                    if let Some(ids) = group.get("identifiers").and_then(|v| v.as_array()) {
                        for id in ids {
                            let id_type = id.get("identifierType").and_then(|v| v.as_str());
                            if matches!(id_type, Some("EAN") | Some("UPC") | Some("GTIN")) {
                                if let Some(value) = id.get("identifier").and_then(|v| v.as_str())
                                {
                                    identifiers.insert(value.to_string());
                                }
                            }
                        }
                    }
                }
            }

            Some(Candidate {
                asin: asin.to_string(),
                source: CandidateSource::Primary,
                title,
                brand,
                identifiers,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_run_store;
    use serde_json::json;

    #[tokio::test]
    async fn client_builds_with_defaults() {
        let (_dir, pool) = temp_run_store().await;
        let config = MatcherConfig::default();
        assert!(PrimaryClient::new(&config, CacheStore::new(pool)).is_ok());
    }

    #[test]
    fn extracts_marketplace_scoped_summary() {
        let payload = json!({
            "items": [{
                "asin": "B01ABCDE01",
                "summaries": [
                    {"marketplaceId": "A13V1IB3VIYZZH", "itemName": "Wrong market", "brandName": "X"},
                    {"marketplaceId": "A1PA6795UKMFR9", "itemName": "Schneider Ball", "brandName": "Schneider"}
                ],
                "identifiers": [{
                    "marketplaceId": "A1PA6795UKMFR9",
                    "identifiers": [
                        {"identifierType": "EAN", "identifier": "4006381333931"},
                        {"identifierType": "UPC", "identifier": "036000291452"}
                    ]
                }]
            }]
        });

        let candidates = extract_candidates(&payload, Marketplace::DE);
        assert_eq!(candidates.len(), 1);

        let c = &candidates[0];
        assert_eq!(c.asin, "B01ABCDE01");
        assert_eq!(c.source, CandidateSource::Primary);
        assert_eq!(c.title.as_deref(), Some("Schneider Ball"));
        assert_eq!(c.brand.as_deref(), Some("Schneider"));
        assert!(c.identifiers.contains("4006381333931"));
        assert!(c.identifiers.contains("036000291452"));
    }

    #[test]
    fn items_without_asin_are_dropped() {
        let payload = json!({
            "items": [
                {"summaries": [{"marketplaceId": "A1PA6795UKMFR9", "itemName": "No ASIN"}]},
                {"asin": "", "summaries": []},
                {"asin": "B01ABCDE02"}
            ]
        });

        let candidates = extract_candidates(&payload, Marketplace::DE);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].asin, "B01ABCDE02");
    }

    #[test]
    fn empty_and_malformed_payloads_yield_no_candidates() {
        assert!(extract_candidates(&json!({"items": []}), Marketplace::DE).is_empty());
        assert!(extract_candidates(&json!({}), Marketplace::DE).is_empty());
        assert!(extract_candidates(&json!("garbage"), Marketplace::DE).is_empty());
    }
}
