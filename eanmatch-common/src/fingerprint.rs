//! Request fingerprinting
//!
//! A fingerprint is the deterministic cache key for one upstream request:
//! SHA-256 over `service|operation|normalized_query|marketplace`, hex-encoded.
//! Two logically identical queries always produce the same fingerprint, so
//! fingerprints must be computed from *normalized* query text only.

use crate::types::Marketplace;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Deterministic cache key for an upstream request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Compute the fingerprint for one upstream request
    pub fn compute(
        service: &str,
        operation: &str,
        normalized_query: &str,
        marketplace: Marketplace,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(service.as_bytes());
        hasher.update(b"|");
        hasher.update(operation.as_bytes());
        hasher.update(b"|");
        hasher.update(normalized_query.as_bytes());
        hasher.update(b"|");
        hasher.update(marketplace.as_str().as_bytes());
        RequestFingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an already hex-encoded fingerprint (e.g. from the CLI)
    pub fn from_hex(hex: impl Into<String>) -> Self {
        RequestFingerprint(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
