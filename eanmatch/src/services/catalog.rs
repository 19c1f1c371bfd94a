//! Catalog source abstraction
//!
//! Both upstream adapters implement [`CatalogSource`] and share the
//! [`SourceError`] taxonomy and bounded retry machinery. `NotFound` is not an
//! error: it is a successful lookup with an empty candidate list.

use async_trait::async_trait;
use eanmatch_common::types::{Candidate, InputRecord};
use eanmatch_common::{CanonicalEan, RequestFingerprint};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Upstream failure taxonomy
///
/// `Throttled` and `Transient` are retried locally by the adapter and never
/// surface past the matcher. `Unauthorized` is fatal for the record (never
/// retried) but not for the batch.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("throttled by upstream")]
    Throttled,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Throttled | SourceError::Transient(_))
    }
}

/// Result of one catalog lookup: the extracted candidates plus the request
/// fingerprint consumed (recorded in the run ledger)
#[derive(Debug, Clone)]
pub struct SourceResponse {
    pub candidates: Vec<Candidate>,
    pub fingerprint: RequestFingerprint,
}

/// One upstream catalog service
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Stable identifier used in fingerprints and log fields
    fn source_id(&self) -> &'static str;

    /// Look up candidates for one input record
    ///
    /// An empty candidate list is the normal not-found outcome, not an
    /// error.
    async fn lookup(
        &self,
        record: &InputRecord,
        ean: &CanonicalEan,
    ) -> Result<SourceResponse, SourceError>;
}

/// Bounded exponential backoff with jitter
///
/// Modeled as explicit state (attempt count, computed delay) rather than an
/// error-driven loop: attempt `n` sleeps `min(base * 2^n, cap)` plus up to
/// half that again of random jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
        }
    }

    /// Delay before the attempt after `completed_attempts` failures
    fn delay_for(&self, completed_attempts: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(completed_attempts));
        let capped = exp.min(self.cap);
        let max_jitter_ms = (capped.as_millis() as u64) / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Drive one upstream operation through the retry state machine
///
/// Retries only retryable errors, up to `policy.max_attempts` total
/// attempts. `Unauthorized` is returned immediately without a retry.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    source: &str,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    tracing::warn!(
                        source,
                        attempts = attempt,
                        "Giving up after retries: {}",
                        e
                    );
                    return Err(e);
                }
                let delay = policy.delay_for(attempt - 1);
                tracing::debug!(
                    source,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Upstream error, backing off: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map an HTTP status to the shared error taxonomy
///
/// Returns `None` for success statuses; 404 is handled by the callers as the
/// normal empty result.
pub(crate) fn classify_status(status: reqwest::StatusCode) -> Option<SourceError> {
    if status.is_success() {
        return None;
    }
    match status.as_u16() {
        401 | 403 => Some(SourceError::Unauthorized(format!("HTTP {}", status.as_u16()))),
        429 => Some(SourceError::Throttled),
        code => Some(SourceError::Transient(format!("HTTP {}", code))),
    }
}
