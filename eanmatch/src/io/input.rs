//! Input collaborator: CSV batch reader
//!
//! The input file must carry an `ean` column; `title` and `brand` columns
//! are optional hints. Header matching is case-insensitive. Each EAN row is
//! crossed with the configured marketplace list, in row-major order - that
//! ordering defines the batch's output order.

use eanmatch_common::types::{InputRecord, Marketplace};
use eanmatch_common::{Error, Result};
use std::path::Path;

/// Parse a comma-separated marketplace list (e.g. "DE,FR,IT"),
/// deduplicating while preserving order
pub fn parse_marketplaces(raw: &str) -> Result<Vec<Marketplace>> {
    let mut marketplaces = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let marketplace: Marketplace = part.parse()?;
        if !marketplaces.contains(&marketplace) {
            marketplaces.push(marketplace);
        }
    }
    if marketplaces.is_empty() {
        return Err(Error::InvalidInput(
            "no valid marketplaces provided".to_string(),
        ));
    }
    Ok(marketplaces)
}

/// Read the input CSV and produce one record per (EAN row, marketplace)
pub fn read_input_records(path: &Path, marketplaces: &[Marketplace]) -> Result<Vec<InputRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| Error::InvalidInput(format!("cannot read input CSV {}: {}", path.display(), e)))?;

    let headers = reader
        .headers()
        .map_err(|e| Error::InvalidInput(format!("invalid input CSV headers: {}", e)))?
        .clone();

    let ean_column = headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case("ean"))
        .ok_or_else(|| {
            Error::InvalidInput("input CSV must include an 'ean' column".to_string())
        })?;
    let title_column = headers.iter().position(|h| h.eq_ignore_ascii_case("title"));
    let brand_column = headers.iter().position(|h| h.eq_ignore_ascii_case("brand"));

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| Error::InvalidInput(format!("invalid input CSV row: {}", e)))?;

        let ean = row.get(ean_column).unwrap_or("").trim();
        if ean.is_empty() {
            continue;
        }

        let hint_title = title_column
            .and_then(|i| row.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let hint_brand = brand_column
            .and_then(|i| row.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        for marketplace in marketplaces {
            records.push(InputRecord {
                ean: ean.to_string(),
                hint_title: hint_title.clone(),
                hint_brand: hint_brand.clone(),
                marketplace: *marketplace,
            });
        }
    }

    tracing::info!(
        path = %path.display(),
        records = records.len(),
        marketplaces = marketplaces.len(),
        "Input loaded"
    );

    Ok(records)
}
