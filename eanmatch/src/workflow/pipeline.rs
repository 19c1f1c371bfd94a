//! Pipeline orchestrator
//!
//! Drives the per-record state machine
//!
//! `Pending -> PrimaryLookup -> (FallbackLookup) -> Matching -> Terminal`
//!
//! across a bounded worker pool. Each worker processes one record
//! end-to-end and appends exactly one ledger entry on reaching a terminal
//! decision; completions arrive out of order and are re-ordered to input
//! order before being emitted to the output channel.
//!
//! # Cancellation
//! Cancelling the batch token stops dispatching new records immediately.
//! A record that is already past its ledger check finishes its current
//! upstream call; if the token fires between its primary and fallback
//! lookups the record is abandoned *without* a ledger entry, so a resumed
//! run re-processes it (cheaply, through the response cache). Ledger
//! entries already written are always preserved - a cancelled batch is
//! safely resumable.
//!
//! # Error policy
//! Per-record errors become terminal `Failed` decisions and never abort the
//! batch. Ledger append failures do abort it: crash-safety and resume
//! depend on the ledger being writable.

use crate::db::ledger::RunLedger;
use crate::services::catalog::{CatalogSource, SourceError};
use crate::services::matcher::{Matcher, SourceOutcome};
use chrono::Utc;
use eanmatch_common::config::MatcherConfig;
use eanmatch_common::normalize::normalize_identifier;
use eanmatch_common::types::{
    InputRecord, LedgerEntry, Marketplace, MatchDecision, MatchStatus,
};
use eanmatch_common::{CanonicalEan, Error, Result};
use futures::stream::StreamExt;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One emitted result: the input record with its terminal decision
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub record: InputRecord,
    pub decision: MatchDecision,
    /// True when the decision was replayed from the ledger without any
    /// upstream work
    pub resumed: bool,
}

/// End-of-batch accounting
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub total: usize,
    pub emitted: usize,
    pub resumed: usize,
    pub matched: usize,
    pub ambiguous: usize,
    pub not_found: usize,
    pub failed: usize,
    /// Records skipped because the batch was cancelled before they reached
    /// a terminal decision
    pub cancelled: usize,
    pub matches_per_marketplace: BTreeMap<Marketplace, usize>,
}

impl BatchSummary {
    /// True when the batch contains records needing human attention, which
    /// is reflected in the process exit status
    pub fn needs_attention(&self) -> bool {
        self.ambiguous > 0 || self.failed > 0
    }

    fn count(&mut self, outcome: &RecordOutcome) {
        self.emitted += 1;
        if outcome.resumed {
            self.resumed += 1;
        }
        match outcome.decision.status {
            MatchStatus::Matched => {
                self.matched += 1;
                *self
                    .matches_per_marketplace
                    .entry(outcome.decision.marketplace)
                    .or_insert(0) += 1;
            }
            MatchStatus::Ambiguous => self.ambiguous += 1,
            MatchStatus::NotFound => self.not_found += 1,
            MatchStatus::Failed => self.failed += 1,
        }
    }

    /// Log the batch totals, one line per figure
    pub fn log(&self) {
        tracing::info!(
            total = self.total,
            emitted = self.emitted,
            resumed = self.resumed,
            "Batch complete"
        );
        tracing::info!(
            matched = self.matched,
            ambiguous = self.ambiguous,
            not_found = self.not_found,
            failed = self.failed,
            "Outcome counts"
        );
        for (marketplace, count) in &self.matches_per_marketplace {
            tracing::info!(marketplace = %marketplace, matches = count, "Marketplace matches");
        }
        if self.cancelled > 0 {
            tracing::warn!(
                cancelled = self.cancelled,
                "Batch was cancelled before completion; re-run with --resume to finish"
            );
        }
    }
}

/// Batch orchestrator
///
/// The two source adapters are shared by reference across all workers; all
/// cross-worker mutability lives inside them (token buckets) and in the
/// cache/ledger, each of which serializes its own access.
pub struct Pipeline {
    config: Arc<MatcherConfig>,
    primary: Arc<dyn CatalogSource>,
    fallback: Arc<dyn CatalogSource>,
    matcher: Matcher,
    ledger: Arc<RunLedger>,
}

impl Pipeline {
    pub fn new(
        config: Arc<MatcherConfig>,
        primary: Arc<dyn CatalogSource>,
        fallback: Arc<dyn CatalogSource>,
        ledger: Arc<RunLedger>,
    ) -> Self {
        let matcher = Matcher::new(&config);
        Self {
            config,
            primary,
            fallback,
            matcher,
            ledger,
        }
    }

    /// Process a batch, emitting outcomes to `out_tx` in input order
    ///
    /// With `resume` set, records with an existing terminal ledger entry
    /// re-emit the stored decision without touching the upstream services.
    /// Without it, any existing ledger entries are cleared first: a fresh
    /// run gets a fresh ledger (the response cache is kept either way).
    pub async fn run_batch(
        &self,
        records: Vec<InputRecord>,
        resume: bool,
        cancel: CancellationToken,
        out_tx: mpsc::Sender<RecordOutcome>,
    ) -> Result<BatchSummary> {
        let mut summary = BatchSummary {
            total: records.len(),
            ..Default::default()
        };

        if !resume && !self.ledger.is_empty() {
            let cleared = self.ledger.clear().await?;
            tracing::info!(cleared, "Cleared previous ledger entries (fresh run)");
        }

        tracing::info!(
            records = records.len(),
            workers = self.config.worker_pool_size,
            resume,
            "Starting batch"
        );

        let mut completions = futures::stream::iter(records.into_iter().enumerate())
            .map(|(index, record)| {
                let cancel = cancel.clone();
                async move { (index, self.process_record(record, resume, cancel).await) }
            })
            .buffer_unordered(self.config.worker_pool_size);

        // Re-order completions to input order; cancelled records leave a
        // gap that is skipped without emitting
        let mut pending: BTreeMap<usize, Option<RecordOutcome>> = BTreeMap::new();
        let mut next_emit = 0usize;

        while let Some((index, result)) = completions.next().await {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Ledger failure: stop the batch, everything already
                    // appended stays resumable
                    cancel.cancel();
                    return Err(e);
                }
            };

            if outcome.is_none() {
                summary.cancelled += 1;
            }
            pending.insert(index, outcome);

            while let Some(slot) = pending.remove(&next_emit) {
                next_emit += 1;
                if let Some(outcome) = slot {
                    summary.count(&outcome);
                    out_tx
                        .send(outcome)
                        .await
                        .map_err(|_| Error::Internal("output consumer dropped".to_string()))?;
                }
            }
        }

        Ok(summary)
    }

    /// Process one record end-to-end
    ///
    /// Returns `Ok(None)` when the record was abandoned due to
    /// cancellation (no ledger entry written). Errors are ledger failures
    /// only; everything else becomes a terminal decision.
    async fn process_record(
        &self,
        record: InputRecord,
        resume: bool,
        cancel: CancellationToken,
    ) -> Result<Option<RecordOutcome>> {
        // Cancellation gate: no new work once the token fires
        if cancel.is_cancelled() {
            return Ok(None);
        }

        // Resume: a terminal entry short-circuits the whole state machine
        if resume {
            if let Some(entry) = self.ledger.get(&record.ean, record.marketplace) {
                tracing::debug!(
                    ean = %record.ean,
                    marketplace = %record.marketplace,
                    status = entry.decision.status.as_str(),
                    "Ledger hit, emitting stored decision"
                );
                return Ok(Some(RecordOutcome {
                    record,
                    decision: entry.decision,
                    resumed: true,
                }));
            }
        }

        let mut fingerprints = BTreeSet::new();

        let decision = match normalize_identifier(&record.ean) {
            Err(e) => {
                tracing::warn!(ean = %record.ean, "Skipping record: {}", e);
                Some(failed_decision(
                    &record,
                    vec!["invalid-identifier".to_string()],
                ))
            }
            Ok(ean) => {
                self.lookup_and_match(&record, &ean, &mut fingerprints, &cancel)
                    .await
            }
        };

        let Some(decision) = decision else {
            // Abandoned mid-record by cancellation; no ledger entry, so a
            // resumed run picks it up again
            return Ok(None);
        };

        let entry = LedgerEntry {
            decision: decision.clone(),
            fingerprints_consumed: fingerprints,
            completed_at: Utc::now(),
        };
        self.ledger.append(&entry).await?;

        tracing::debug!(
            ean = %record.ean,
            marketplace = %record.marketplace,
            status = decision.status.as_str(),
            confidence = decision.confidence,
            "Record terminal"
        );

        Ok(Some(RecordOutcome {
            record,
            decision,
            resumed: false,
        }))
    }

    /// PrimaryLookup -> (FallbackLookup) -> Matching
    ///
    /// Returns `None` if cancellation fired between the two lookups.
    async fn lookup_and_match(
        &self,
        record: &InputRecord,
        ean: &CanonicalEan,
        fingerprints: &mut BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Option<MatchDecision> {
        // Primary always runs first: cheaper and authoritative
        let primary = match self.primary.lookup(record, ean).await {
            Ok(response) => {
                fingerprints.insert(response.fingerprint.to_string());
                SourceOutcome::Candidates(response.candidates)
            }
            Err(SourceError::Unauthorized(msg)) => {
                // Fatal for the record: no retry, no fallback
                tracing::error!(
                    ean = %record.ean,
                    marketplace = %record.marketplace,
                    "Primary rejected credentials: {}",
                    msg
                );
                return Some(failed_decision(
                    record,
                    vec!["primary-unauthorized".to_string()],
                ));
            }
            Err(e) => {
                tracing::warn!(
                    ean = %record.ean,
                    marketplace = %record.marketplace,
                    "Primary lookup failed: {}",
                    e
                );
                SourceOutcome::Failed(error_token("primary", &e))
            }
        };

        let fallback = if self.needs_fallback(&primary, ean) {
            let has_hints = record.hint_title.is_some() || record.hint_brand.is_some();
            if !has_hints {
                tracing::debug!(
                    ean = %record.ean,
                    "No title/brand hints, skipping fallback search"
                );
                SourceOutcome::Skipped
            } else if cancel.is_cancelled() {
                // Finish the current upstream call, but start no new one
                return None;
            } else {
                match self.fallback.lookup(record, ean).await {
                    Ok(response) => {
                        fingerprints.insert(response.fingerprint.to_string());
                        SourceOutcome::Candidates(response.candidates)
                    }
                    Err(e) => {
                        tracing::warn!(
                            ean = %record.ean,
                            marketplace = %record.marketplace,
                            "Fallback lookup failed: {}",
                            e
                        );
                        SourceOutcome::Failed(error_token("fallback", &e))
                    }
                }
            }
        } else {
            SourceOutcome::Skipped
        };

        Some(self.matcher.resolve(record, ean, &primary, &fallback))
    }

    /// Fallback runs when the primary returned zero candidates, candidates
    /// that are ambiguous by identifier, or failed - never when the primary
    /// fast path already hit
    fn needs_fallback(&self, primary: &SourceOutcome, ean: &CanonicalEan) -> bool {
        match primary {
            SourceOutcome::Candidates(candidates) => {
                Matcher::exact_identifier_match(candidates, ean).is_none()
            }
            SourceOutcome::Failed(_) => true,
            SourceOutcome::Skipped => true,
        }
    }
}

fn failed_decision(record: &InputRecord, evidence: Vec<String>) -> MatchDecision {
    MatchDecision {
        ean: record.ean.clone(),
        marketplace: record.marketplace,
        status: MatchStatus::Failed,
        asin: None,
        confidence: 0.0,
        evidence,
        matched_title: None,
        matched_brand: None,
    }
}

fn error_token(source: &str, error: &SourceError) -> String {
    let kind = match error {
        SourceError::Throttled => "throttled",
        SourceError::Unauthorized(_) => "unauthorized",
        SourceError::Transient(_) => "transient",
    };
    format!("{}-{}", source, kind)
}
