//! Domain model shared across the EANMatch crates
//!
//! Input records are immutable once read; their identity is the
//! `(ean, marketplace)` pair. Candidates are transient per lookup and are
//! never persisted beyond the final decision written to the run ledger.

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Amazon marketplace the lookup is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Marketplace {
    DE,
    FR,
    IT,
    ES,
    NL,
    GB,
    US,
}

impl Marketplace {
    /// Marketplace code as used in input/output files
    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::DE => "DE",
            Marketplace::FR => "FR",
            Marketplace::IT => "IT",
            Marketplace::ES => "ES",
            Marketplace::NL => "NL",
            Marketplace::GB => "GB",
            Marketplace::US => "US",
        }
    }

    /// Amazon marketplace identifier sent to the catalog services
    pub fn amazon_id(&self) -> &'static str {
        match self {
            Marketplace::DE => "A1PA6795UKMFR9",
            Marketplace::FR => "A13V1IB3VIYZZH",
            Marketplace::IT => "APJ6JRA9NG5V4",
            Marketplace::ES => "A1RKKUPIHCS9HS",
            Marketplace::NL => "A1805IZSGTT6HS",
            Marketplace::GB => "A1F83G8C2ARO7P",
            Marketplace::US => "ATVPDKIKX0DER",
        }
    }
}

impl FromStr for Marketplace {
    type Err = Error;

    /// Parse a marketplace code, case-insensitive. "UK" is accepted as an
    /// alias for "GB".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DE" => Ok(Marketplace::DE),
            "FR" => Ok(Marketplace::FR),
            "IT" => Ok(Marketplace::IT),
            "ES" => Ok(Marketplace::ES),
            "NL" => Ok(Marketplace::NL),
            "GB" | "UK" => Ok(Marketplace::GB),
            "US" => Ok(Marketplace::US),
            other => Err(Error::InvalidInput(format!(
                "Unsupported marketplace code: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of work: an EAN to resolve on a specific marketplace
///
/// `hint_title` and `hint_brand` come from optional input columns and feed
/// the fallback text search and candidate scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRecord {
    pub ean: String,
    pub hint_title: Option<String>,
    pub hint_brand: Option<String>,
    pub marketplace: Marketplace,
}

impl InputRecord {
    /// Record identity used by the run ledger
    pub fn key(&self) -> (String, Marketplace) {
        (self.ean.clone(), self.marketplace)
    }
}

/// Which upstream service produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateSource {
    Primary,
    Fallback,
}

impl CandidateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::Primary => "primary",
            CandidateSource::Fallback => "fallback",
        }
    }
}

/// A catalog item returned by either upstream service
///
/// Transient: produced per lookup, consumed by the matcher, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub asin: String,
    pub source: CandidateSource,
    pub title: Option<String>,
    pub brand: Option<String>,
    /// EAN-like codes the upstream reports for this item
    pub identifiers: BTreeSet<String>,
}

/// Terminal status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    /// A single ASIN was selected with sufficient confidence
    Matched,
    /// Multiple candidates tied above the threshold; requires human review
    Ambiguous,
    /// No candidate cleared the threshold (both sources answered)
    NotFound,
    /// No candidate set was obtainable, or the input EAN was invalid
    Failed,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Matched => "Matched",
            MatchStatus::Ambiguous => "Ambiguous",
            MatchStatus::NotFound => "NotFound",
            MatchStatus::Failed => "Failed",
        }
    }
}

impl FromStr for MatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Matched" => Ok(MatchStatus::Matched),
            "Ambiguous" => Ok(MatchStatus::Ambiguous),
            "NotFound" => Ok(MatchStatus::NotFound),
            "Failed" => Ok(MatchStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "Unknown match status: {}",
                other
            ))),
        }
    }
}

/// Final, immutable decision for one input record
///
/// `evidence` is the ordered list of scoring factors that produced the
/// decision. `matched_title`/`matched_brand` echo the selected candidate for
/// audit and export; they are `None` unless `status` is `Matched`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDecision {
    pub ean: String,
    pub marketplace: Marketplace,
    pub status: MatchStatus,
    pub asin: Option<String>,
    /// Confidence in [0, 1]; 0.0 for NotFound/Failed
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub matched_title: Option<String>,
    pub matched_brand: Option<String>,
}

/// One append-only ledger row: the decision plus the upstream request
/// fingerprints consumed while reaching it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub decision: MatchDecision,
    pub fingerprints_consumed: BTreeSet<String>,
    pub completed_at: DateTime<Utc>,
}
