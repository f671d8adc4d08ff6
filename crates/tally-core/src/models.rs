//! Domain models for Tally

use chrono::{DateTime, NaiveDateTime, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// JSON object attached to rules (provenance, notes)
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Default configured importance of a rule
pub const DEFAULT_CONFIDENCE_WEIGHT: f64 = 1.0;
/// Lowest allowed configured importance
pub const MIN_CONFIDENCE_WEIGHT: f64 = 0.1;
/// Highest allowed configured importance
pub const MAX_CONFIDENCE_WEIGHT: f64 = 5.0;

/// A transaction as seen by the rule engine (read-only, every field optional)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Option<i64>,
    pub merchant_name: Option<String>,
    pub description: Option<String>,
    pub amount: Option<Decimal>,
    pub timestamp: Option<NaiveDateTime>,
}

impl Transaction {
    pub fn with_merchant(mut self, merchant: &str) -> Self {
        self.merchant_name = Some(merchant.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_timestamp(mut self, timestamp: NaiveDateTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Merchant name if present and not blank
    pub fn merchant(&self) -> Option<&str> {
        non_blank(self.merchant_name.as_deref())
    }

    /// Description if present and not blank
    pub fn description_text(&self) -> Option<&str> {
        non_blank(self.description.as_deref())
    }
}

pub(crate) fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|v| !v.trim().is_empty())
}

/// A spending category (opaque to the engine; only the id is compared)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Which transaction attribute an atomic rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Case-insensitive substring of the merchant name
    Merchant,
    /// Case-insensitive substring of description, falling back to merchant
    Keyword,
    /// Case-insensitive substring of description only
    Description,
    /// Inclusive "min-max" amount range
    AmountRange,
    /// Case-insensitive regular expression over description + merchant
    Regex,
    /// Time-of-day keyword, weekend/weekday, or "HH:MM-HH:MM"
    Time,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merchant => "merchant",
            Self::Keyword => "keyword",
            Self::Description => "description",
            Self::AmountRange => "amount_range",
            Self::Regex => "regex",
            Self::Time => "time",
        }
    }

    pub fn all() -> &'static [PatternType] {
        &[
            Self::Merchant,
            Self::Keyword,
            Self::Description,
            Self::AmountRange,
            Self::Regex,
            Self::Time,
        ]
    }

    /// Text-substring types compare case-insensitively, so their stored
    /// lookup key is lowercased
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Merchant | Self::Keyword | Self::Description)
    }
}

impl std::str::FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "merchant" => Ok(Self::Merchant),
            "keyword" => Ok(Self::Keyword),
            "description" => Ok(Self::Description),
            "amount_range" | "amount" => Ok(Self::AmountRange),
            "regex" => Ok(Self::Regex),
            "time" => Ok(Self::Time),
            _ => Err(format!("Unknown pattern type: {}", s)),
        }
    }
}

impl std::fmt::Display for PatternType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Usage and accuracy bookkeeping shared by atomic and composite rules
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub usage_count: i64,
    pub success_count: i64,
    pub success_rate: f64,
}

impl UsageStats {
    /// Build stats from raw counters, deriving the success rate
    pub fn new(usage_count: i64, success_count: i64) -> Self {
        Self {
            usage_count,
            success_count,
            success_rate: success_rate(usage_count, success_count),
        }
    }

    /// Record one evaluated outcome
    pub fn record(&mut self, successful: bool) {
        self.usage_count += 1;
        if successful {
            self.success_count += 1;
        }
        self.success_rate = success_rate(self.usage_count, self.success_count);
    }

    pub fn is_consistent(&self) -> bool {
        self.usage_count >= 0 && self.success_count >= 0 && self.success_count <= self.usage_count
    }
}

/// success_count / usage_count, 0 when unused, always within [0, 1]
pub fn success_rate(usage_count: i64, success_count: i64) -> f64 {
    if usage_count <= 0 {
        return 0.0;
    }
    (success_count as f64 / usage_count as f64).clamp(0.0, 1.0)
}

/// An atomic single-condition categorization rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub category_id: i64,
    pub pattern_type: PatternType,
    pub pattern_value: String,
    pub confidence_weight: f64,
    #[serde(flatten)]
    pub stats: UsageStats,
    pub active: bool,
    /// Created by a person (manually or through a correction); never auto-retired
    pub user_created: bool,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// `type:value` label used in descriptions and listings
    pub fn label(&self) -> String {
        format!("{}:{}", self.pattern_type.as_str(), self.pattern_value)
    }
}

/// A rule to be created (before DB insertion)
#[derive(Debug, Clone)]
pub struct NewRule {
    pub category_id: i64,
    pub pattern_type: PatternType,
    pub pattern_value: String,
    pub confidence_weight: f64,
    pub user_created: bool,
    pub metadata: Metadata,
}

impl NewRule {
    pub fn new(category_id: i64, pattern_type: PatternType, pattern_value: &str) -> Self {
        Self {
            category_id,
            pattern_type,
            pattern_value: pattern_value.to_string(),
            confidence_weight: DEFAULT_CONFIDENCE_WEIGHT,
            user_created: false,
            metadata: Metadata::new(),
        }
    }

    pub fn weight(mut self, confidence_weight: f64) -> Self {
        self.confidence_weight = confidence_weight;
        self
    }

    pub fn user_created(mut self, user_created: bool) -> Self {
        self.user_created = user_created;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Partial update for an existing rule (None = leave unchanged)
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub pattern_value: Option<String>,
    pub confidence_weight: Option<f64>,
    pub active: Option<bool>,
    pub metadata: Option<Metadata>,
}

/// Boolean operator combining composite members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CompositeOperator {
    /// Every member matches
    And,
    /// At least one member matches
    Or,
    /// No member matches
    Not,
}

impl CompositeOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
        }
    }
}

impl std::str::FromStr for CompositeOperator {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AND" => Ok(Self::And),
            "OR" => Ok(Self::Or),
            "NOT" => Ok(Self::Not),
            _ => Err(format!("Unknown operator: {} (expected AND, OR or NOT)", s)),
        }
    }
}

impl std::fmt::Display for CompositeOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A time-of-day window, "HH:MM-HH:MM"; start after end wraps past midnight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Inclusive on both ends; crosses midnight when start > end
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time <= self.end
        } else {
            time >= self.start || time <= self.end
        }
    }
}

impl std::str::FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (start, end) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| format!("Invalid time range '{}': expected HH:MM-HH:MM", s))?;
        let parse = |part: &str| {
            NaiveTime::parse_from_str(part.trim(), "%H:%M")
                .map_err(|_| format!("Invalid time '{}' in range '{}'", part.trim(), s))
        };
        Ok(Self::new(parse(start)?, parse(end)?))
    }
}

impl TryFrom<String> for TimeRange {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeRange> for String {
    fn from(range: TimeRange) -> Self {
        range.to_string()
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start.format("%H:%M"), self.end.format("%H:%M"))
    }
}

/// Side conditions a transaction must satisfy before composite members are evaluated
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositeConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<Weekday>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_ranges: Vec<TimeRange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merchant_blacklist: Vec<String>,
}

impl CompositeConditions {
    pub fn is_empty(&self) -> bool {
        self.min_amount.is_none()
            && self.max_amount.is_none()
            && self.days_of_week.is_none()
            && self.time_ranges.is_empty()
            && self.merchant_blacklist.is_empty()
    }
}

/// A boolean combination of atomic rules plus side conditions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeRule {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
    pub operator: CompositeOperator,
    /// Soft references to atomic rules, resolved by id at read time
    pub member_ids: Vec<i64>,
    pub conditions: CompositeConditions,
    pub confidence_weight: f64,
    #[serde(flatten)]
    pub stats: UsageStats,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A composite rule to be created (before DB insertion)
#[derive(Debug, Clone)]
pub struct NewCompositeRule {
    pub category_id: i64,
    pub name: String,
    pub operator: CompositeOperator,
    pub member_ids: Vec<i64>,
    pub conditions: CompositeConditions,
    pub confidence_weight: f64,
}

impl NewCompositeRule {
    pub fn new(category_id: i64, name: &str, operator: CompositeOperator, member_ids: Vec<i64>) -> Self {
        Self {
            category_id,
            name: name.to_string(),
            operator,
            member_ids,
            conditions: CompositeConditions::default(),
            confidence_weight: DEFAULT_CONFIDENCE_WEIGHT,
        }
    }

    pub fn conditions(mut self, conditions: CompositeConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn weight(mut self, confidence_weight: f64) -> Self {
        self.confidence_weight = confidence_weight;
        self
    }
}

/// Deduplicated identity for many raw merchant spellings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalMerchant {
    pub id: i64,
    /// Output of `normalize`; unique, compared case-insensitively
    pub normalized_name: String,
    pub display_name: String,
    pub category_hint: Option<i64>,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A raw merchant spelling seen for a canonical merchant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerchantAlias {
    pub id: i64,
    pub merchant_id: i64,
    /// Text exactly as it arrived (e.g., "SQ *BLUE BOTTLE #12")
    pub raw_name: String,
    /// 1.0 = exact/new canonical, <1.0 = attached by similarity
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

/// What the user said about a categorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    /// The suggested category was accepted
    Accepted,
    /// The suggestion was rejected without supplying a replacement
    Rejected,
    /// The suggestion was replaced by the user
    Corrected,
    /// The system's choice was wrong and a rule should be learned
    Correction,
}

impl FeedbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Corrected => "corrected",
            Self::Correction => "correction",
        }
    }

    pub fn all() -> &'static [FeedbackKind] {
        &[Self::Accepted, Self::Rejected, Self::Corrected, Self::Correction]
    }
}

impl std::str::FromStr for FeedbackKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "corrected" => Ok(Self::Corrected),
            "correction" => Ok(Self::Correction),
            _ => Err(format!("Unknown feedback kind: {}", s)),
        }
    }
}

impl std::fmt::Display for FeedbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted feedback event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correction {
    pub id: i64,
    pub transaction_id: Option<i64>,
    pub category_id: i64,
    pub rule_id: Option<i64>,
    pub was_correct: bool,
    pub confidence: Option<f64>,
    pub kind: FeedbackKind,
    /// Merchant text at the time of feedback (transactions are external)
    pub merchant_name: Option<String>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A feedback event to be recorded (before DB insertion)
#[derive(Debug, Clone)]
pub struct NewCorrection {
    pub transaction_id: Option<i64>,
    pub category_id: i64,
    pub rule_id: Option<i64>,
    pub was_correct: bool,
    pub confidence: Option<f64>,
    pub kind: FeedbackKind,
    pub merchant_name: Option<String>,
    pub description: Option<String>,
}

/// Aggregate feedback counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedbackSummary {
    pub total: i64,
    pub accepted: i64,
    pub rejected: i64,
    pub corrected: i64,
    pub corrections: i64,
    /// Share of events where the system's choice was right
    pub acceptance_ratio: f64,
    pub learned_rules: i64,
    pub inactive_rules: i64,
}
