//! Merchant name canonicalization and deduplication
//!
//! Bank exports spell the same merchant many ways ("SQ *BLUE BOTTLE #12",
//! "Blue Bottle Coffee", "BLUE BOTTLE 0042"). `normalize` strips processor
//! prefixes, store numbers, web suffixes and company suffixes down to a stable
//! key; `MerchantResolver` maps every raw spelling onto one canonical merchant
//! and records the spelling as an alias.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::InMemoryRuleCache;
use crate::db::Database;
use crate::error::Result;
use crate::models::CanonicalMerchant;

static PROCESSOR_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:paypal|sq|square|tst)\s*\*\s*|(?:pos|ccd)\s+)").expect("valid regex")
});

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[*_/\\|]+").expect("valid regex"));

static WEB_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^www\.").expect("valid regex"));

static WEB_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.(?:com|net|org|io|co)\b").expect("valid regex"));

static TRAILING_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(?:\s+(?:store|str|loc|location|unit))?\s*(?:#\s*\d+|\d{3,}))+$")
        .expect("valid regex")
});

static PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s&'\-]+").expect("valid regex"));

static COMPANY_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\s+(?:inc|llc|corp|co|company|ltd)\.?)+$").expect("valid regex")
});

/// Merchants whose brand casing title-case gets wrong
const KNOWN_MERCHANTS: &[(&str, &str)] = &[
    ("amazon", "Amazon"),
    ("mcdonald's", "McDonald's"),
    ("mcdonalds", "McDonald's"),
    ("doordash", "DoorDash"),
    ("ebay", "eBay"),
    ("paypal", "PayPal"),
    ("at&t", "AT&T"),
    ("cvs", "CVS"),
    ("ikea", "IKEA"),
    ("youtube", "YouTube"),
    ("7-eleven", "7-Eleven"),
    ("h&m", "H&M"),
    ("whole foods", "Whole Foods"),
    ("walmart", "Walmart"),
    ("target", "Target"),
    ("starbucks", "Starbucks"),
    ("netflix", "Netflix"),
    ("spotify", "Spotify"),
    ("uber", "Uber"),
    ("uber eats", "Uber Eats"),
    ("lyft", "Lyft"),
    ("iherb", "iHerb"),
    ("jetblue", "JetBlue"),
];

/// Merchant resolution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantConfig {
    /// Use trigram similarity when no exact match exists
    pub fuzzy_matching: bool,
    /// Minimum similarity for attaching a spelling to an existing merchant
    pub similarity_threshold: f64,
}

impl Default for MerchantConfig {
    fn default() -> Self {
        Self {
            fuzzy_matching: true,
            similarity_threshold: 0.5,
        }
    }
}

fn normalize_pass(input: &str) -> String {
    let mut s = input.to_lowercase();

    loop {
        let stripped = PROCESSOR_PREFIX.replace(&s, "").trim_start().to_string();
        if stripped == s {
            break;
        }
        s = stripped;
    }

    s = SEPARATORS.replace_all(&s, " ").trim().to_string();
    s = WEB_PREFIX.replace(&s, "").to_string();
    s = WEB_SUFFIX.replace_all(&s, "").to_string();
    s = TRAILING_ID.replace(s.trim_end(), "").to_string();
    s = PUNCTUATION.replace_all(&s, " ").to_string();
    s = COMPANY_SUFFIX.replace(s.trim_end(), "").to_string();

    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical comparison key for raw merchant text
///
/// Idempotent: `normalize(&normalize(x)) == normalize(x)`. Blank input gives "".
pub fn normalize(raw: &str) -> String {
    let mut current = normalize_pass(raw);
    // After the first pass every change only deletes text, so this settles
    // well before the bound
    for _ in 0..=current.len() {
        let next = normalize_pass(&current);
        if next == current {
            break;
        }
        current = next;
    }
    current
}

/// Display form of a normalized name
pub fn beautify(normalized: &str) -> String {
    let key = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    if key.is_empty() {
        return String::new();
    }
    let lower = key.to_lowercase();
    if let Some((_, display)) = KNOWN_MERCHANTS.iter().find(|(k, _)| *k == lower) {
        return display.to_string();
    }
    lower
        .split(' ')
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_word(word: &str) -> String {
    let mut out = String::with_capacity(word.len());
    let mut capitalized = false;
    for c in word.chars() {
        if !capitalized && c.is_alphabetic() {
            out.extend(c.to_uppercase());
            capitalized = true;
        } else {
            out.push(c);
        }
    }
    out
}

fn trigrams(s: &str) -> HashSet<String> {
    let mut set = HashSet::new();
    for word in s
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = format!("  {} ", word).chars().collect();
        for window in padded.windows(3) {
            set.insert(window.iter().collect());
        }
    }
    set
}

/// Trigram similarity (shared / total distinct trigrams), in [0, 1]
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let ta = trigrams(a);
    let tb = trigrams(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let total = ta.union(&tb).count();
    shared as f64 / total as f64
}

/// Character-multiset overlap: |a ∩ b| / max(|a|, |b|), in [0, 1]
pub fn char_overlap(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    let len = a.chars().count().max(b.chars().count());
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in a.chars() {
        *counts.entry(c).or_default() += 1;
    }
    let mut shared = 0usize;
    for c in b.chars() {
        if let Some(n) = counts.get_mut(&c) {
            if *n > 0 {
                *n -= 1;
                shared += 1;
            }
        }
    }
    shared as f64 / len as f64
}

/// Maps raw merchant text onto canonical merchants in the store
pub struct MerchantResolver<'a> {
    db: &'a Database,
    config: MerchantConfig,
    cache: Option<Arc<InMemoryRuleCache>>,
}

impl<'a> MerchantResolver<'a> {
    pub fn new(db: &'a Database, config: MerchantConfig) -> Self {
        Self {
            db,
            config,
            cache: None,
        }
    }

    /// Read the canonical merchant list through a cache
    ///
    /// The cache must also be registered on the database so merchant writes
    /// invalidate it. Usage counts in the cached list may lag the store.
    pub fn with_cache(mut self, cache: Arc<InMemoryRuleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn canonical_merchants(&self) -> Result<Arc<Vec<CanonicalMerchant>>> {
        if let Some(cache) = &self.cache {
            if let Some(merchants) = cache.get_merchants() {
                return Ok(merchants);
            }
            return Ok(cache.put_merchants(self.db.list_merchants()?));
        }
        Ok(Arc::new(self.db.list_merchants()?))
    }

    pub fn config(&self) -> &MerchantConfig {
        &self.config
    }

    /// Similarity between two normalized names, per the configured method
    pub fn similarity_confidence(&self, a: &str, b: &str) -> f64 {
        if self.config.fuzzy_matching {
            trigram_similarity(a, b)
        } else {
            char_overlap(a, b)
        }
    }

    /// Best existing canonical merchant for a normalized name
    ///
    /// With fuzzy matching the best trigram match at or above the threshold
    /// wins (ties go to the more used merchant); without it, only an exact
    /// case-insensitive name match counts.
    pub fn find_similar(&self, normalized: &str) -> Result<Option<CanonicalMerchant>> {
        if normalized.trim().is_empty() {
            return Ok(None);
        }
        if !self.config.fuzzy_matching {
            return self.db.find_merchant_by_normalized(normalized);
        }

        let merchants = self.canonical_merchants()?;
        let mut best: Option<(&CanonicalMerchant, f64)> = None;
        for merchant in merchants.iter() {
            let score = trigram_similarity(normalized, &merchant.normalized_name);
            if score < self.config.similarity_threshold {
                continue;
            }
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((merchant, score));
            }
        }
        Ok(best.map(|(m, _)| m.clone()))
    }

    /// Resolve raw merchant text to its canonical merchant, creating one if needed
    ///
    /// Lookup order: exact raw alias, normalized name (canonical or alias),
    /// similar canonical, new canonical. Every hit bumps the usage count.
    pub fn resolve(&self, raw: &str) -> Result<Option<CanonicalMerchant>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        if let Some(merchant) = self.db.find_merchant_by_alias(raw)? {
            debug!("Merchant '{}' resolved by alias to {}", raw, merchant.id);
            return self.db.increment_merchant_usage(merchant.id).map(Some);
        }

        let normalized = normalize(raw);
        if normalized.is_empty() {
            debug!("Merchant '{}' normalizes to nothing", raw);
            return Ok(None);
        }

        if let Some(merchant) = self.db.find_merchant_by_normalized(&normalized)? {
            debug!(
                "Merchant '{}' resolved by normalized name '{}' to {}",
                raw, normalized, merchant.id
            );
            self.db.add_merchant_alias(merchant.id, raw, 1.0)?;
            return self.db.increment_merchant_usage(merchant.id).map(Some);
        }

        if let Some(merchant) = self.find_similar(&normalized)? {
            let confidence = self.similarity_confidence(&normalized, &merchant.normalized_name);
            debug!(
                "Merchant '{}' resolved by similarity ({:.2}) to {} '{}'",
                raw, confidence, merchant.id, merchant.normalized_name
            );
            self.db.add_merchant_alias(merchant.id, raw, confidence)?;
            return self.db.increment_merchant_usage(merchant.id).map(Some);
        }

        let (merchant, created) = self
            .db
            .insert_merchant_if_absent(&normalized, &beautify(&normalized))?;
        debug!(
            "Merchant '{}' -> '{}' ({})",
            raw,
            merchant.display_name,
            if created { "new" } else { "existing" }
        );
        self.db.add_merchant_alias(merchant.id, raw, 1.0)?;
        self.db.increment_merchant_usage(merchant.id).map(Some)
    }

    /// Merge one canonical merchant into another
    pub fn merge(&self, source_id: i64, target_id: i64) -> Result<CanonicalMerchant> {
        self.db.merge_merchants(source_id, target_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_processor_prefix_and_store_number() {
        assert_eq!(normalize("PAYPAL *AMAZON.COM STORE #1234"), "amazon");
        assert_eq!(normalize("SQ *BLUE BOTTLE #12"), "blue bottle");
        assert_eq!(normalize("TST* JOE'S PIZZA 00421"), "joe's pizza");
        assert_eq!(normalize("POS WHOLE FOODS MKT 10234"), "whole foods mkt");
    }

    #[test]
    fn test_normalize_company_suffixes() {
        assert_eq!(normalize("Acme Widgets, Inc."), "acme widgets");
        assert_eq!(normalize("Globex LLC"), "globex");
        assert_eq!(normalize("Initech Co Ltd"), "initech");
    }

    #[test]
    fn test_normalize_keeps_ampersand_apostrophe_hyphen() {
        assert_eq!(normalize("AT&T WIRELESS"), "at&t wireless");
        assert_eq!(normalize("7-ELEVEN"), "7-eleven");
        assert_eq!(normalize("MCDONALD'S"), "mcdonald's");
    }

    #[test]
    fn test_normalize_blank() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for raw in [
            "PAYPAL *AMAZON.COM STORE #1234",
            "SQ * SQ *COFFEE CART",
            "www.Example.com/billing",
            "Foo_Bar|Baz Corp.",
            "SHELL OIL 57444 LOC 12",
            "  weird   spacing  inc ",
            "acme inc inc inc inc inc inc inc inc inc inc",
            "SHELL OIL #12 #34 #56 #78 #90 1234 5678 9012 3456 7890",
            "ACME LLC CORP LTD INC CO COMPANY",
        ] {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", raw);
        }
        assert_eq!(normalize("acme inc inc inc inc inc inc inc inc inc inc"), "acme");
        assert_eq!(normalize("SHELL OIL #12 #34 #56 1234 5678"), "shell oil");
    }

    #[test]
    fn test_beautify() {
        assert_eq!(beautify("amazon"), "Amazon");
        assert_eq!(beautify("mcdonald's"), "McDonald's");
        assert_eq!(beautify("AT&T"), "AT&T");
        assert_eq!(beautify("blue bottle"), "Blue Bottle");
        assert_eq!(beautify("joe's pizza"), "Joe's Pizza");
        assert_eq!(beautify("  "), "");
    }

    #[test]
    fn test_trigram_similarity() {
        assert!((trigram_similarity("blue bottle", "blue bottle") - 1.0).abs() < 1e-9);
        assert!(trigram_similarity("blue bottle coffee", "blue bottle") > 0.5);
        assert!(trigram_similarity("starbucks", "walmart") < 0.2);
        assert_eq!(trigram_similarity("", "anything"), 0.0);
    }

    #[test]
    fn test_char_overlap() {
        assert!((char_overlap("abc", "abc") - 1.0).abs() < 1e-9);
        assert!((char_overlap("aab", "ab") - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(char_overlap("", ""), 0.0);
        assert_eq!(char_overlap("abc", ""), 0.0);
    }
}
