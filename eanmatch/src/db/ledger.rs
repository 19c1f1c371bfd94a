//! Append-only run ledger
//!
//! One durable row per record that reached a terminal decision. The ledger
//! is what makes an interrupted batch resumable: an entry exists if and only
//! if the record is terminal, and the orchestrator never re-processes a
//! record with an existing entry unless it is explicitly invalidated.
//!
//! The full table is loaded into an in-memory index once at startup, so
//! per-record membership checks are O(1) map lookups rather than scans.

use chrono::{DateTime, Utc};
use eanmatch_common::types::{LedgerEntry, Marketplace, MatchDecision, MatchStatus};
use eanmatch_common::{Error, Result};
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::RwLock;

type LedgerKey = (String, Marketplace);

/// Crash-safe record of per-EAN outcomes for one batch run
pub struct RunLedger {
    db: SqlitePool,
    index: RwLock<HashMap<LedgerKey, LedgerEntry>>,
}

impl RunLedger {
    /// Open the ledger and build the resume index from existing rows
    pub async fn open(db: SqlitePool) -> Result<Self> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT ean, marketplace, status, asin, confidence, evidence, \
                    matched_title, matched_brand, fingerprints, completed_at \
             FROM run_ledger",
        )
        .fetch_all(&db)
        .await?;

        let mut index = HashMap::with_capacity(rows.len());
        for row in rows {
            let entry = row_into_entry(row)?;
            index.insert(entry_key(&entry), entry);
        }

        tracing::debug!(entries = index.len(), "Run ledger index loaded");

        Ok(Self {
            db,
            index: RwLock::new(index),
        })
    }

    /// O(1) membership check against the startup index
    pub fn has(&self, ean: &str, marketplace: Marketplace) -> bool {
        self.index
            .read()
            .expect("ledger index lock poisoned")
            .contains_key(&(ean.to_string(), marketplace))
    }

    /// Stored terminal entry for a record, if any
    pub fn get(&self, ean: &str, marketplace: Marketplace) -> Option<LedgerEntry> {
        self.index
            .read()
            .expect("ledger index lock poisoned")
            .get(&(ean.to_string(), marketplace))
            .cloned()
    }

    /// Number of terminal entries
    pub fn len(&self) -> usize {
        self.index.read().expect("ledger index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Durably append one terminal entry
    ///
    /// The INSERT commits before this returns: a crash immediately after the
    /// call still sees the entry on restart. There is no update path - a
    /// second append for the same `(ean, marketplace)` is an error.
    pub async fn append(&self, entry: &LedgerEntry) -> Result<()> {
        let decision = &entry.decision;
        let evidence = serde_json::to_string(&decision.evidence)
            .map_err(|e| Error::Internal(format!("evidence serialization failed: {}", e)))?;
        let fingerprints = serde_json::to_string(&entry.fingerprints_consumed)
            .map_err(|e| Error::Internal(format!("fingerprint serialization failed: {}", e)))?;

        sqlx::query(
            "INSERT INTO run_ledger \
             (ean, marketplace, status, asin, confidence, evidence, \
              matched_title, matched_brand, fingerprints, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&decision.ean)
        .bind(decision.marketplace.as_str())
        .bind(decision.status.as_str())
        .bind(&decision.asin)
        .bind(decision.confidence)
        .bind(evidence)
        .bind(&decision.matched_title)
        .bind(&decision.matched_brand)
        .bind(fingerprints)
        .bind(entry.completed_at.to_rfc3339())
        .execute(&self.db)
        .await?;

        self.index
            .write()
            .expect("ledger index lock poisoned")
            .insert(entry_key(entry), entry.clone());

        Ok(())
    }

    /// All entries in append order
    pub async fn all(&self) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            "SELECT ean, marketplace, status, asin, confidence, evidence, \
                    matched_title, matched_brand, fingerprints, completed_at \
             FROM run_ledger ORDER BY rowid",
        )
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(row_into_entry).collect()
    }

    /// Administrative removal of one terminal entry, so the next run
    /// re-processes that record. Not part of normal pipeline flow.
    pub async fn invalidate(&self, ean: &str, marketplace: Marketplace) -> Result<bool> {
        let result = sqlx::query("DELETE FROM run_ledger WHERE ean = ? AND marketplace = ?")
            .bind(ean)
            .bind(marketplace.as_str())
            .execute(&self.db)
            .await?;

        self.index
            .write()
            .expect("ledger index lock poisoned")
            .remove(&(ean.to_string(), marketplace));

        Ok(result.rows_affected() > 0)
    }

    /// Remove every entry. Used when a batch is started fresh (no
    /// `--resume`) against an existing run store.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM run_ledger").execute(&self.db).await?;
        self.index.write().expect("ledger index lock poisoned").clear();
        Ok(result.rows_affected())
    }
}

fn entry_key(entry: &LedgerEntry) -> LedgerKey {
    (entry.decision.ean.clone(), entry.decision.marketplace)
}

/// Raw ledger row as stored in SQLite:
/// (ean, marketplace, status, asin, confidence, evidence,
///  matched_title, matched_brand, fingerprints, completed_at)
type LedgerRow = (
    String,
    String,
    String,
    Option<String>,
    f64,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
);

fn row_into_entry(row: LedgerRow) -> Result<LedgerEntry> {
    let (
        ean,
        marketplace,
        status,
        asin,
        confidence,
        evidence,
        matched_title,
        matched_brand,
        fingerprints,
        completed_at,
    ) = row;

    let marketplace = Marketplace::from_str(&marketplace)?;
    let status = MatchStatus::from_str(&status)?;
    let evidence: Vec<String> = serde_json::from_str(&evidence)
        .map_err(|e| Error::Internal(format!("corrupt ledger evidence: {}", e)))?;
    let fingerprints: BTreeSet<String> = serde_json::from_str(&fingerprints)
        .map_err(|e| Error::Internal(format!("corrupt ledger fingerprints: {}", e)))?;
    let completed_at = DateTime::parse_from_rfc3339(&completed_at)
        .map_err(|e| Error::Internal(format!("corrupt ledger timestamp: {}", e)))?
        .with_timezone(&Utc);

    Ok(LedgerEntry {
        decision: MatchDecision {
            ean,
            marketplace,
            status,
            asin,
            confidence,
            evidence,
            matched_title,
            matched_brand,
        },
        fingerprints_consumed: fingerprints,
        completed_at,
    })
}
