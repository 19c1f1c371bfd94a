//! Identifier and text normalization
//!
//! Both query construction and candidate scoring go through
//! [`normalize_text`], so text comparisons are symmetric: the same raw string
//! always canonicalizes to the same form no matter which side of the
//! comparison it is on.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A validated, canonical 13-digit EAN
///
/// Produced only by [`normalize_identifier`]; the inner string is guaranteed
/// to be 13 ASCII digits with a correct check digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalEan(String);

impl CanonicalEan {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalEan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate and canonicalize a raw EAN string
///
/// Accepts 13-digit EAN-13 and 12-digit UPC-A (zero-padded to 13 digits,
/// which preserves the check digit). Whitespace is stripped. Fails on
/// non-numeric input, wrong length, or a check-digit mismatch.
pub fn normalize_identifier(raw: &str) -> Result<CanonicalEan, Error> {
    let digits: String = raw.chars().filter(|c| !c.is_whitespace()).collect();

    if digits.is_empty() {
        return Err(Error::InvalidIdentifier("empty identifier".to_string()));
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidIdentifier(format!(
            "non-numeric identifier: {}",
            raw.trim()
        )));
    }

    let padded = match digits.len() {
        13 => digits,
        // UPC-A: zero-pad to EAN-13, check digit is unchanged
        12 => format!("0{}", digits),
        n => {
            return Err(Error::InvalidIdentifier(format!(
                "identifier has {} digits, expected 12 or 13: {}",
                n,
                raw.trim()
            )))
        }
    };

    if !check_digit_valid(&padded) {
        return Err(Error::InvalidIdentifier(format!(
            "check digit mismatch: {}",
            padded
        )));
    }

    Ok(CanonicalEan(padded))
}

/// EAN-13 check digit validation
///
/// Positions 1..=12 (left to right) are weighted 1,3,1,3,...; the 13th digit
/// must equal `(10 - sum mod 10) mod 10`.
fn check_digit_valid(digits: &str) -> bool {
    let values: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    if values.len() != 13 {
        return false;
    }
    let sum: u32 = values[..12]
        .iter()
        .enumerate()
        .map(|(i, d)| if i % 2 == 0 { *d } else { *d * 3 })
        .sum();
    (10 - sum % 10) % 10 == values[12]
}

/// Canonicalize free text for comparison
///
/// Lowercases, folds common Latin diacritics, replaces punctuation with
/// spaces, and collapses runs of whitespace.
pub fn normalize_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_space = true;

    for c in raw.chars().flat_map(fold_char) {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }

    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Canonical token set of a text, for token-overlap scoring
pub fn token_set(raw: &str) -> BTreeSet<String> {
    normalize_text(raw)
        .split_whitespace()
        .map(|t| t.to_string())
        .collect()
}

/// Fold a single character's diacritics to its base ASCII form
///
/// Covers the Latin-1 range plus the ligatures that show up in European
/// catalog titles; everything else passes through unchanged.
fn fold_char(c: char) -> impl Iterator<Item = char> {
    let folded: &str = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ý' | 'ÿ' | 'Ý' => "y",
        'ñ' | 'Ñ' => "n",
        'ç' | 'Ç' => "c",
        'ß' => "ss",
        'æ' | 'Æ' => "ae",
        'œ' | 'Œ' => "oe",
        'ø' | 'Ø' => "o",
        _ => return FoldChars::Single(Some(c)),
    };
    FoldChars::Str(folded.chars())
}

enum FoldChars {
    Single(Option<char>),
    Str(std::str::Chars<'static>),
}

impl Iterator for FoldChars {
    type Item = char;

    fn next(&mut self) -> Option<char> {
        match self {
            FoldChars::Single(c) => c.take(),
            FoldChars::Str(chars) => chars.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_ean13_normalizes() {
        let ean = normalize_identifier("4006381333931").unwrap();
        assert_eq!(ean.as_str(), "4006381333931");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_identifier("4006381333931").unwrap();
        let twice = normalize_identifier(once.as_str()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn whitespace_is_stripped() {
        let ean = normalize_identifier(" 4006381333931 ").unwrap();
        assert_eq!(ean.as_str(), "4006381333931");
    }

    #[test]
    fn upca_is_zero_padded() {
        // 036000291452 is a valid UPC-A; padding preserves the check digit
        let ean = normalize_identifier("036000291452").unwrap();
        assert_eq!(ean.as_str(), "0036000291452");
    }

    #[test]
    fn bad_check_digit_is_rejected() {
        assert!(matches!(
            normalize_identifier("4006381333932"),
            Err(Error::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn non_numeric_is_rejected() {
        assert!(normalize_identifier("40063813339AB").is_err());
        assert!(normalize_identifier("not-an-ean").is_err());
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert!(normalize_identifier("123").is_err());
        assert!(normalize_identifier("40063813339311").is_err());
        assert!(normalize_identifier("").is_err());
    }

    #[test]
    fn text_normalization_folds_and_collapses() {
        assert_eq!(
            normalize_text("  Müller®  Weißbier, 6er-Pack!  "),
            "muller weissbier 6er pack"
        );
        assert_eq!(normalize_text("Café Crème"), "cafe creme");
    }

    #[test]
    fn text_normalization_is_symmetric() {
        let a = normalize_text("L'Oréal Élvive");
        let b = normalize_text(&normalize_text("l oreal elvive"));
        assert_eq!(a, b);
    }

    #[test]
    fn token_set_deduplicates() {
        let tokens = token_set("Duracell AA Duracell batteries AA");
        assert_eq!(tokens.len(), 3);
        assert!(tokens.contains("duracell"));
        assert!(tokens.contains("aa"));
        assert!(tokens.contains("batteries"));
    }
}
