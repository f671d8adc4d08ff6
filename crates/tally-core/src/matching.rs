//! Atomic rule matching
//!
//! A rule inspects one transaction attribute according to its pattern type.
//! Callers hand in a [`MatchInput`]: either a single bare value (text, amount,
//! timestamp) or the full set of transaction fields. Inputs a pattern type
//! cannot use never match, and matching never fails: a malformed pattern value
//! simply doesn't match anything.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use chrono::{DateTime, Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use regex::{Regex, RegexBuilder};
use rust_decimal::Decimal;

use crate::models::{non_blank, PatternType, Rule, TimeRange, Transaction};

/// Compiled-size cap for rule regexes
pub const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Distinct rule regexes kept compiled before the cache is reset
const REGEX_CACHE_CAPACITY: usize = 1024;

/// Compiled rule regexes by pattern text; `None` records a pattern that fails to compile
static COMPILED_PATTERNS: LazyLock<Mutex<HashMap<String, Option<Regex>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static AMOUNT_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(-?\d+(?:\.\d+)?)\s*-\s*(-?\d+(?:\.\d+)?)\s*$").expect("valid regex")
});

/// Transaction fields visible to a matcher
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchFields<'a> {
    pub merchant: Option<&'a str>,
    pub description: Option<&'a str>,
    pub amount: Option<Decimal>,
    pub timestamp: Option<NaiveDateTime>,
}

/// What a rule is matched against
#[derive(Debug, Clone, Copy)]
pub enum MatchInput<'a> {
    /// A bare string (merchant text, description, amount or timestamp text)
    Text(&'a str),
    Amount(Decimal),
    Timestamp(NaiveDateTime),
    /// A transaction-like record
    Fields(MatchFields<'a>),
}

impl<'a> From<&'a Transaction> for MatchInput<'a> {
    fn from(tx: &'a Transaction) -> Self {
        MatchInput::Fields(MatchFields {
            merchant: tx.merchant_name.as_deref(),
            description: tx.description.as_deref(),
            amount: tx.amount,
            timestamp: tx.timestamp,
        })
    }
}

impl<'a> From<&'a str> for MatchInput<'a> {
    fn from(text: &'a str) -> Self {
        MatchInput::Text(text)
    }
}

impl<'a> From<&'a String> for MatchInput<'a> {
    fn from(text: &'a String) -> Self {
        MatchInput::Text(text.as_str())
    }
}

impl From<Decimal> for MatchInput<'_> {
    fn from(amount: Decimal) -> Self {
        MatchInput::Amount(amount)
    }
}

impl From<NaiveDateTime> for MatchInput<'_> {
    fn from(timestamp: NaiveDateTime) -> Self {
        MatchInput::Timestamp(timestamp)
    }
}

impl<'a> From<MatchFields<'a>> for MatchInput<'a> {
    fn from(fields: MatchFields<'a>) -> Self {
        MatchInput::Fields(fields)
    }
}

/// A parsed `time` pattern value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePattern {
    /// 06:00-11:59
    Morning,
    /// 12:00-16:59
    Afternoon,
    /// 17:00-20:59
    Evening,
    /// 21:00-05:59
    Night,
    Weekend,
    Weekday,
    Range(TimeRange),
}

impl TimePattern {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "morning" => Some(Self::Morning),
            "afternoon" => Some(Self::Afternoon),
            "evening" => Some(Self::Evening),
            "night" => Some(Self::Night),
            "weekend" => Some(Self::Weekend),
            "weekday" => Some(Self::Weekday),
            other => other.parse::<TimeRange>().ok().map(Self::Range),
        }
    }

    pub fn matches(&self, timestamp: NaiveDateTime) -> bool {
        let hour = timestamp.hour();
        match self {
            Self::Morning => (6..=11).contains(&hour),
            Self::Afternoon => (12..=16).contains(&hour),
            Self::Evening => (17..=20).contains(&hour),
            Self::Night => hour >= 21 || hour <= 5,
            Self::Weekend => is_weekend(timestamp.weekday()),
            Self::Weekday => !is_weekend(timestamp.weekday()),
            Self::Range(range) => range.contains(timestamp.time()),
        }
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// Parse an `amount_range` value such as `"10.00-50.00"` or `"-100--50"`
pub fn parse_amount_range(value: &str) -> Option<(Decimal, Decimal)> {
    let caps = AMOUNT_RANGE.captures(value)?;
    let min = caps.get(1)?.as_str().parse::<Decimal>().ok()?;
    let max = caps.get(2)?.as_str().parse::<Decimal>().ok()?;
    Some((min, max))
}

/// Parse amount text like "42.50", "$1,200.00" or "-12"
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<Decimal>().ok()
}

/// Parse timestamp text in the common ISO-ish layouts
pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.naive_local());
    }
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            // Bare time of day, anchored to an arbitrary date
            let time = NaiveTime::parse_from_str(text, "%H:%M").ok()?;
            chrono::NaiveDate::from_ymd_opt(1970, 1, 1).map(|d| d.and_time(time))
        })
}

/// Compile a rule regex the way matching uses it
pub fn compile_pattern(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
}

/// Compiled form of a rule regex, shared across calls
fn cached_pattern(pattern: &str) -> Option<Regex> {
    let Ok(mut compiled) = COMPILED_PATTERNS.lock() else {
        return compile_pattern(pattern).ok();
    };
    if let Some(re) = compiled.get(pattern) {
        return re.clone();
    }
    if compiled.len() >= REGEX_CACHE_CAPACITY {
        compiled.clear();
    }
    let re = compile_pattern(pattern).ok();
    compiled.insert(pattern.to_string(), re.clone());
    re
}

/// Canonical lookup key for a pattern value
///
/// Two rules in the same category with the same type and key are duplicates.
/// Text-like types compare case-insensitively so their keys are lowercased;
/// regex keys keep their case because escapes like `\D` are case-sensitive.
pub fn pattern_key(pattern_type: PatternType, value: &str) -> String {
    match pattern_type {
        PatternType::Regex => value.trim().to_string(),
        PatternType::AmountRange => value.split_whitespace().collect::<String>(),
        _ => value
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

/// Evaluate one pattern against an input
pub fn pattern_matches(pattern_type: PatternType, pattern_value: &str, input: &MatchInput<'_>) -> bool {
    match pattern_type {
        PatternType::Merchant | PatternType::Keyword | PatternType::Description => {
            let needle = pattern_value.trim().to_lowercase();
            if needle.is_empty() {
                return false;
            }
            let haystack = match (pattern_type, input) {
                (_, MatchInput::Text(text)) => non_blank(Some(*text)),
                (PatternType::Merchant, MatchInput::Fields(f)) => non_blank(f.merchant),
                (PatternType::Keyword, MatchInput::Fields(f)) => {
                    non_blank(f.description).or_else(|| non_blank(f.merchant))
                }
                (PatternType::Description, MatchInput::Fields(f)) => non_blank(f.description),
                _ => None,
            };
            haystack.is_some_and(|h| contains_ci(h, &needle))
        }
        PatternType::AmountRange => {
            let Some((min, max)) = parse_amount_range(pattern_value) else {
                return false;
            };
            let amount = match input {
                MatchInput::Amount(a) => Some(*a),
                MatchInput::Text(text) => parse_amount(text),
                MatchInput::Fields(f) => f.amount,
                MatchInput::Timestamp(_) => None,
            };
            amount.is_some_and(|a| min <= a && a <= max)
        }
        PatternType::Regex => {
            let text = match input {
                MatchInput::Text(text) => non_blank(Some(*text)).map(str::to_string),
                MatchInput::Fields(f) => {
                    let parts: Vec<&str> = [non_blank(f.description), non_blank(f.merchant)]
                        .into_iter()
                        .flatten()
                        .collect();
                    (!parts.is_empty()).then(|| parts.join(" "))
                }
                _ => None,
            };
            let Some(text) = text else {
                return false;
            };
            cached_pattern(pattern_value).is_some_and(|re| re.is_match(&text))
        }
        PatternType::Time => {
            let Some(pattern) = TimePattern::parse(pattern_value) else {
                return false;
            };
            let timestamp = match input {
                MatchInput::Timestamp(ts) => Some(*ts),
                MatchInput::Text(text) => parse_timestamp(text),
                MatchInput::Fields(f) => f.timestamp,
                MatchInput::Amount(_) => None,
            };
            timestamp.is_some_and(|ts| pattern.matches(ts))
        }
    }
}

impl Rule {
    /// Does this rule's single condition hold for the input?
    pub fn matches<'a>(&self, input: impl Into<MatchInput<'a>>) -> bool {
        pattern_matches(self.pattern_type, &self.pattern_value, &input.into())
    }
}
