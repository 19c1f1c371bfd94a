//! Candidate scoring and match resolution
//!
//! Scoring is a pure function of the input record and the candidate - no
//! randomness, no wall clock, no hidden state - so a resumed batch reaches
//! bit-identical decisions given the same cache contents.
//!
//! Each candidate is scored as a weighted combination of three signals:
//! identifier overlap (binary), title token-set overlap, and brand equality
//! (binary). A signal is only counted when both sides actually carry the
//! field: a search result without identifier data is not penalized for it,
//! but a candidate whose reported identifiers do not include the input EAN
//! is. The weighted sum is renormalized over the applicable weights so
//! scores stay comparable across candidates with different field coverage.

use eanmatch_common::config::{MatcherConfig, ScoringWeights};
use eanmatch_common::normalize::{normalize_text, token_set};
use eanmatch_common::types::{Candidate, InputRecord, MatchDecision, MatchStatus};
use eanmatch_common::CanonicalEan;
use std::collections::BTreeMap;

/// Jaro-Winkler floor above which two normalized brands count as equal
const BRAND_SIMILARITY_THRESHOLD: f64 = 0.85;

/// What one source's lookup produced, as seen by the matcher
#[derive(Debug, Clone)]
pub enum SourceOutcome {
    /// Lookup succeeded; an empty list is a normal not-found answer
    Candidates(Vec<Candidate>),
    /// Lookup failed terminally for this record; the string is the evidence
    /// token recorded in the decision (e.g. "primary-unauthorized")
    Failed(String),
    /// Lookup was not attempted (fast path already hit, or nothing to
    /// search on)
    Skipped,
}

impl SourceOutcome {
    fn candidates(&self) -> Option<&[Candidate]> {
        match self {
            SourceOutcome::Candidates(c) => Some(c),
            _ => None,
        }
    }
}

/// A candidate with its computed score and scoring factors
#[derive(Debug, Clone)]
pub(crate) struct ScoredCandidate {
    pub asin: String,
    pub score: f64,
    pub factors: Vec<String>,
    pub title: Option<String>,
    pub brand: Option<String>,
}

/// Scores and ranks candidates, resolving ties and ambiguity
pub struct Matcher {
    weights: ScoringWeights,
    match_threshold: f64,
    separation_margin: f64,
}

impl Matcher {
    pub fn new(config: &MatcherConfig) -> Self {
        Self {
            weights: config.scoring_weights.clone(),
            match_threshold: config.match_threshold,
            separation_margin: config.separation_margin,
        }
    }

    /// The fast-path check: exactly one candidate whose identifier set
    /// includes the canonical EAN
    ///
    /// Also used by the orchestrator to decide whether the fallback lookup
    /// is needed (zero or multiple identifier hits mean it is).
    pub fn exact_identifier_match<'a>(
        candidates: &'a [Candidate],
        ean: &CanonicalEan,
    ) -> Option<&'a Candidate> {
        let mut hits = candidates
            .iter()
            .filter(|c| c.identifiers.contains(ean.as_str()));
        match (hits.next(), hits.next()) {
            (Some(only), None) => Some(only),
            _ => None,
        }
    }

    /// Resolve one record against the outcomes of both lookups
    pub fn resolve(
        &self,
        record: &InputRecord,
        ean: &CanonicalEan,
        primary: &SourceOutcome,
        fallback: &SourceOutcome,
    ) -> MatchDecision {
        // Fast path: a single primary candidate carrying the exact EAN wins
        // outright, bypassing scoring
        if let Some(primary_candidates) = primary.candidates() {
            if let Some(hit) = Self::exact_identifier_match(primary_candidates, ean) {
                return MatchDecision {
                    ean: record.ean.clone(),
                    marketplace: record.marketplace,
                    status: MatchStatus::Matched,
                    asin: Some(hit.asin.clone()),
                    confidence: 1.0,
                    evidence: vec!["exact-identifier".to_string()],
                    matched_title: hit.title.clone(),
                    matched_brand: hit.brand.clone(),
                };
            }
        }

        let pool = pool_candidates(primary, fallback);

        if pool.is_empty() {
            // Failed only when no candidate set was obtainable at all;
            // one answering (empty) source is an authoritative NotFound
            let any_answered =
                primary.candidates().is_some() || fallback.candidates().is_some();
            if any_answered {
                return self.not_found(record);
            }
            let mut evidence = Vec::new();
            if let SourceOutcome::Failed(token) = primary {
                evidence.push(token.clone());
            }
            if let SourceOutcome::Failed(token) = fallback {
                evidence.push(token.clone());
            }
            return MatchDecision {
                ean: record.ean.clone(),
                marketplace: record.marketplace,
                status: MatchStatus::Failed,
                asin: None,
                confidence: 0.0,
                evidence,
                matched_title: None,
                matched_brand: None,
            };
        }

        let mut scored: Vec<ScoredCandidate> = pool
            .iter()
            .map(|c| self.score_candidate(record, ean, c))
            .collect();

        // Deterministic order: score descending, then ASIN ascending
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.asin.cmp(&b.asin))
        });

        self.classify(record, scored)
    }

    /// Weighted score over the signals both sides actually carry
    fn score_candidate(
        &self,
        record: &InputRecord,
        ean: &CanonicalEan,
        candidate: &Candidate,
    ) -> ScoredCandidate {
        let mut weighted = 0.0;
        let mut applicable = 0.0;
        let mut factors = Vec::new();

        // Identifier overlap: counted whenever the candidate reports any
        // identifiers at all
        if !candidate.identifiers.is_empty() {
            applicable += self.weights.identifier;
            if candidate.identifiers.contains(ean.as_str()) {
                weighted += self.weights.identifier;
                factors.push("identifier-overlap".to_string());
            } else {
                factors.push("identifier-mismatch".to_string());
            }
        }

        // Title token-set overlap ratio
        if let (Some(hint), Some(title)) = (&record.hint_title, &candidate.title) {
            let a = token_set(hint);
            let b = token_set(title);
            if !a.is_empty() && !b.is_empty() {
                let intersection = a.intersection(&b).count() as f64;
                let union = a.union(&b).count() as f64;
                let similarity = intersection / union;
                applicable += self.weights.title;
                weighted += self.weights.title * similarity;
                factors.push(format!("title-similarity:{:.3}", similarity));
            }
        }

        // Brand equality (binary)
        if let (Some(hint), Some(brand)) = (&record.hint_brand, &candidate.brand) {
            applicable += self.weights.brand;
            if brands_equal(hint, brand) {
                weighted += self.weights.brand;
                factors.push("brand-match".to_string());
            } else {
                factors.push("brand-mismatch".to_string());
            }
        }

        let score = if applicable > 0.0 {
            weighted / applicable
        } else {
            factors.push("no-signals".to_string());
            0.0
        };

        ScoredCandidate {
            asin: candidate.asin.clone(),
            score,
            factors,
            title: candidate.title.clone(),
            brand: candidate.brand.clone(),
        }
    }

    /// Threshold/margin classification of the ranked candidates
    ///
    /// `scored` must already be sorted by descending score.
    pub(crate) fn classify(
        &self,
        record: &InputRecord,
        scored: Vec<ScoredCandidate>,
    ) -> MatchDecision {
        let above: Vec<&ScoredCandidate> = scored
            .iter()
            .filter(|s| s.score > self.match_threshold)
            .collect();

        let Some(top) = above.first() else {
            return self.not_found(record);
        };

        let tied: Vec<&&ScoredCandidate> = above
            .iter()
            .filter(|s| top.score - s.score <= self.separation_margin)
            .collect();

        if tied.len() > 1 {
            // No single ASIN is emitted for an ambiguous decision; the tied
            // ASINs go into the evidence for human review
            let evidence = tied
                .iter()
                .map(|s| format!("tied-asin:{}", s.asin))
                .collect();
            return MatchDecision {
                ean: record.ean.clone(),
                marketplace: record.marketplace,
                status: MatchStatus::Ambiguous,
                asin: None,
                confidence: top.score.min(1.0),
                evidence,
                matched_title: None,
                matched_brand: None,
            };
        }

        MatchDecision {
            ean: record.ean.clone(),
            marketplace: record.marketplace,
            status: MatchStatus::Matched,
            asin: Some(top.asin.clone()),
            confidence: top.score.min(1.0),
            evidence: top.factors.clone(),
            matched_title: top.title.clone(),
            matched_brand: top.brand.clone(),
        }
    }

    fn not_found(&self, record: &InputRecord) -> MatchDecision {
        MatchDecision {
            ean: record.ean.clone(),
            marketplace: record.marketplace,
            status: MatchStatus::NotFound,
            asin: None,
            confidence: 0.0,
            evidence: vec!["no-candidate-above-threshold".to_string()],
            matched_title: None,
            matched_brand: None,
        }
    }
}

/// Pool both candidate sets, deduplicated by ASIN
///
/// The primary version of a duplicate wins; identifier sets are unioned and
/// missing title/brand fields are filled from the other source.
fn pool_candidates(primary: &SourceOutcome, fallback: &SourceOutcome) -> Vec<Candidate> {
    use std::collections::btree_map::Entry;

    let mut by_asin: BTreeMap<String, Candidate> = BTreeMap::new();

    for candidate in primary
        .candidates()
        .into_iter()
        .flatten()
        .chain(fallback.candidates().into_iter().flatten())
    {
        match by_asin.entry(candidate.asin.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(candidate.clone());
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing
                    .identifiers
                    .extend(candidate.identifiers.iter().cloned());
                if existing.title.is_none() {
                    existing.title = candidate.title.clone();
                }
                if existing.brand.is_none() {
                    existing.brand = candidate.brand.clone();
                }
            }
        }
    }

    by_asin.into_values().collect()
}

/// Binary brand equality: exact after normalization, or close enough under
/// Jaro-Winkler to absorb spelling variants
fn brands_equal(a: &str, b: &str) -> bool {
    let a = normalize_text(a);
    let b = normalize_text(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || strsim::jaro_winkler(&a, &b) >= BRAND_SIMILARITY_THRESHOLD
}
