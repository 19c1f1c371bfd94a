//! Pack-size extraction from candidate titles
//!
//! European catalog titles encode the pack count in locale-specific ways
//! ("6er-Pack", "6 Stück", "lot de 6", "6 pcs", "x6"). The first pattern
//! that hits wins; patterns are ordered from most to least specific.

use once_cell::sync::Lazy;
use regex::Regex;

static PACK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // German: "6 Stück", "6 Stk.", "6er Pack", "6er-Pack"
        r"(?i)\b(\d+)\s*(?:st[üu]ck|stk\.?|er[-\s]?pack)\b",
        // French: "lot de 6"
        r"(?i)\blot\s*de\s*(\d+)\b",
        // English: "6 pcs", "6 pieces", "6 count", "6 pack"
        r"(?i)\b(\d+)\s*(?:pcs?|pieces?|count|pack)\b",
        // Generic multiplier: "x6", "6x", "6 x"
        r"(?i)\bx\s*(\d+)\b",
        r"(?i)\b(\d+)\s*x\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("pack-size pattern must compile"))
    .collect()
});

/// Extract the pack size from a title, if one is encoded
pub fn extract_pack_size(title: &str) -> Option<u32> {
    for pattern in PACK_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(title) {
            if let Some(value) = captures.get(1) {
                if let Ok(count) = value.as_str().parse::<u32>() {
                    if count > 0 {
                        return Some(count);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn german_patterns() {
        assert_eq!(extract_pack_size("Tempo Taschentücher, 30 Stück"), Some(30));
        assert_eq!(extract_pack_size("Duracell AA 8 Stk."), Some(8));
        assert_eq!(extract_pack_size("Kugelschreiber 6er-Pack blau"), Some(6));
        assert_eq!(extract_pack_size("Batterien 4er Pack"), Some(4));
    }

    #[test]
    fn french_patterns() {
        assert_eq!(extract_pack_size("Piles alcalines, lot de 12"), Some(12));
        assert_eq!(extract_pack_size("Stylos bille - Lot de 3"), Some(3));
    }

    #[test]
    fn english_patterns() {
        assert_eq!(extract_pack_size("AA Batteries 24 Count"), Some(24));
        assert_eq!(extract_pack_size("Ballpoint pens, 10 pcs"), Some(10));
        assert_eq!(extract_pack_size("Value pack of markers 5 pack"), Some(5));
    }

    #[test]
    fn generic_multiplier() {
        assert_eq!(extract_pack_size("Erasers x6"), Some(6));
        assert_eq!(extract_pack_size("12 x AAA battery"), Some(12));
    }

    #[test]
    fn no_pack_size_in_plain_titles() {
        assert_eq!(extract_pack_size("Schneider Slider Memo XB blue"), None);
        assert_eq!(extract_pack_size(""), None);
    }

    #[test]
    fn zero_is_not_a_pack_size() {
        assert_eq!(extract_pack_size("0 Stück"), None);
    }
}
