//! Output collaborator: ordered CSV export
//!
//! Consumes the ordered outcome stream and writes one row per record. Every
//! column derives from the input record and its stored decision, so a
//! resumed run exports byte-identical rows.

use crate::services::pack_size::extract_pack_size;
use crate::workflow::pipeline::RecordOutcome;
use eanmatch_common::{Error, Result};
use std::fs::File;
use std::path::Path;

const OUTPUT_COLUMNS: [&str; 9] = [
    "ean",
    "marketplace",
    "status",
    "asin",
    "confidence",
    "title",
    "brand",
    "pack_size",
    "evidence",
];

/// CSV writer for the ordered result stream
pub struct OutputWriter {
    writer: csv::Writer<File>,
    rows: usize,
}

impl OutputWriter {
    /// Create the output file and write the header row
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(path).map_err(|e| {
            Error::InvalidInput(format!("cannot create output CSV {}: {}", path.display(), e))
        })?;
        writer
            .write_record(OUTPUT_COLUMNS)
            .map_err(|e| Error::Internal(format!("CSV write failed: {}", e)))?;
        Ok(Self { writer, rows: 0 })
    }

    /// Append one outcome row
    pub fn write(&mut self, outcome: &RecordOutcome) -> Result<()> {
        let decision = &outcome.decision;

        let pack_size = decision
            .matched_title
            .as_deref()
            .and_then(extract_pack_size)
            .map(|n| n.to_string())
            .unwrap_or_default();
        let confidence = format!("{:.3}", decision.confidence);
        let evidence = decision.evidence.join("; ");

        self.writer
            .write_record([
                decision.ean.as_str(),
                decision.marketplace.as_str(),
                decision.status.as_str(),
                decision.asin.as_deref().unwrap_or(""),
                confidence.as_str(),
                decision.matched_title.as_deref().unwrap_or(""),
                decision.matched_brand.as_deref().unwrap_or(""),
                pack_size.as_str(),
                evidence.as_str(),
            ])
            .map_err(|e| Error::Internal(format!("CSV write failed: {}", e)))?;

        self.rows += 1;
        Ok(())
    }

    /// Flush and close the output file
    pub fn finish(mut self) -> Result<usize> {
        self.writer
            .flush()
            .map_err(|e| Error::Internal(format!("CSV flush failed: {}", e)))?;
        Ok(self.rows)
    }
}
