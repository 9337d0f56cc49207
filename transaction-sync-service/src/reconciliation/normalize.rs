//! Merchant and company name cleanup shared by the match cache and the
//! fuzzy matcher. Both sides of every comparison go through `clean_name`.

use once_cell::sync::Lazy;
use regex::Regex;

/// Corporate suffixes and noise tokens removed case-insensitively.
const NOISE_TOKENS: [&str; 25] = [
    " W/D",
    " INC",
    " INCORPORATED",
    " CORPORATION",
    " CORP",
    " COMPANIES",
    " COMPANY",
    " CO",
    " LLC",
    " LIMITED",
    " LTD",
    " HOLDINGS",
    " HOLDING",
    " PLC",
    " PBC",
    " LP",
    " GROUP",
    ".COM",
    ".ORG",
    ".NET",
    "#",
    "GIFTCARD",
    ",",
    "-",
    "'",
];

// Longest tokens first so " INCORPORATED" is not cut down by " INC".
static NOISE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    let mut tokens = NOISE_TOKENS.to_vec();
    tokens.sort_by_key(|t| std::cmp::Reverse(t.len()));
    tokens
        .into_iter()
        .filter_map(|t| Regex::new(&format!("(?i){}", regex::escape(t))).ok())
        .collect()
});

static DIGITS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new("[0-9]+").ok());
static TRAILING_PUNCT: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"[.,-]$").ok());
static SCHEME: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?i)^https?://").ok());

/// Normalized form of a merchant, display or company name.
pub fn clean_name(raw: &str) -> String {
    let mut name = raw.to_string();
    for pattern in NOISE_PATTERNS.iter() {
        name = pattern.replace_all(&name, "").into_owned();
    }
    if let Some(digits) = DIGITS.as_ref() {
        name = digits.replace_all(&name, "").into_owned();
    }
    if let Some(trailing) = TRAILING_PUNCT.as_ref() {
        name = trailing.replace(&name, "").into_owned();
    }
    name.trim().to_lowercase()
}

/// Website url reduced to a comparable domain: scheme and trailing slash
/// removed, lower-cased.
pub fn canonical_domain(url: &str) -> String {
    let trimmed = url.trim();
    let without_scheme = match SCHEME.as_ref() {
        Some(scheme) => scheme.replace(trimmed, "").into_owned(),
        None => trimmed.to_string(),
    };
    without_scheme.trim_end_matches('/').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_corporate_suffixes() {
        assert_eq!(clean_name("ACME Corporation"), "acme");
        assert_eq!(clean_name("Acme Holdings LLC"), "acme");
        assert_eq!(clean_name("Widgets Incorporated"), "widgets");
    }

    #[test]
    fn strips_digits_and_trailing_punctuation() {
        assert_eq!(clean_name("STARBUCKS #1234"), "starbucks");
        assert_eq!(clean_name("SQ *COFFEE SHOP 0042."), "sq *coffee shop");
        assert_eq!(clean_name("Amazon.com"), "amazon");
    }

    #[test]
    fn removes_punctuation_tokens() {
        assert_eq!(clean_name("McDonald's"), "mcdonalds");
        assert_eq!(clean_name("Coca-Cola"), "cocacola");
    }

    #[test]
    fn canonical_domain_strips_scheme() {
        assert_eq!(canonical_domain("https://www.Shop.com/"), "www.shop.com");
        assert_eq!(canonical_domain("http://shop.com"), "shop.com");
        assert_eq!(canonical_domain("shop.com"), "shop.com");
    }
}
