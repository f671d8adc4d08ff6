//! Feedback loop: learn from user corrections
//!
//! Every piece of feedback is persisted, forwarded to the rule that produced
//! the categorization (usage counters, then the deactivation check), and, for
//! corrections, turned into a new user-owned rule so the same merchant lands
//! in the right category next time.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::confidence::DeactivationConfig;
use crate::db::Database;
use crate::error::Result;
use crate::models::{
    Correction, FeedbackKind, FeedbackSummary, Metadata, NewCorrection, NewRule, PatternType,
    Rule, Transaction, UsageStats,
};

/// Feedback loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Configured weight of rules learned from corrections
    pub learned_rule_weight: f64,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            learned_rule_weight: 1.2,
        }
    }
}

/// What the user said about one categorization
#[derive(Debug, Clone)]
pub struct Feedback {
    /// The category the transaction actually belongs to
    pub category_id: i64,
    /// The rule that produced the categorization, if any
    pub rule_id: Option<i64>,
    pub was_correct: bool,
    /// Confidence reported with the original categorization
    pub confidence: Option<f64>,
    pub kind: FeedbackKind,
}

impl Feedback {
    pub fn new(kind: FeedbackKind, category_id: i64, was_correct: bool) -> Self {
        Self {
            category_id,
            rule_id: None,
            was_correct,
            confidence: None,
            kind,
        }
    }

    /// The suggestion was right
    pub fn accepted(category_id: i64) -> Self {
        Self::new(FeedbackKind::Accepted, category_id, true)
    }

    /// The suggestion was wrong; `category_id` is the right one and a rule
    /// should be learned for it
    pub fn correction(category_id: i64) -> Self {
        Self::new(FeedbackKind::Correction, category_id, false)
    }

    pub fn rule(mut self, rule_id: Option<i64>) -> Self {
        self.rule_id = rule_id;
        self
    }

    pub fn confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence;
        self
    }

    /// Outcome forwarded to the rule used: only accepted and correction
    /// events can count as a success
    pub fn usage_outcome(&self) -> bool {
        match self.kind {
            FeedbackKind::Accepted | FeedbackKind::Correction => self.was_correct,
            FeedbackKind::Rejected | FeedbackKind::Corrected => false,
        }
    }
}

/// Everything `record_feedback` changed
#[derive(Debug, Clone)]
pub struct FeedbackOutcome {
    pub correction: Correction,
    /// Rule learned from a correction (None if one already existed)
    pub created_rule: Option<Rule>,
    /// Post-update counters of the rule used
    pub rule_stats: Option<UsageStats>,
    /// The rule used was retired by this feedback
    pub deactivated: bool,
}

/// Pattern a correction teaches, derived from the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LearnedPattern {
    Merchant(String),
    Description(String),
    /// Neither merchant nor description present; nothing to persist
    Keyword,
}

impl LearnedPattern {
    pub fn from_transaction(tx: &Transaction) -> Self {
        if let Some(merchant) = tx.merchant() {
            return Self::Merchant(merchant.trim().to_string());
        }
        if let Some(description) = tx.description_text() {
            return Self::Description(description.trim().to_string());
        }
        Self::Keyword
    }
}

/// Consumes feedback and keeps the rule bank honest
pub struct FeedbackLoop<'a> {
    db: &'a Database,
    config: FeedbackConfig,
    deactivation: DeactivationConfig,
}

impl<'a> FeedbackLoop<'a> {
    pub fn new(db: &'a Database, config: FeedbackConfig, deactivation: DeactivationConfig) -> Self {
        Self {
            db,
            config,
            deactivation,
        }
    }

    /// Record feedback for a transaction
    ///
    /// Persists the event, updates the rule used (if any) and retires it when
    /// it performs poorly, and for corrections learns a new rule. All of it is
    /// one store transaction, so a failure, including failure to create the
    /// learned rule, leaves nothing behind and the call can be retried.
    /// Feedback naming a rule that has since been deleted is still recorded.
    pub fn record_feedback(&self, tx: &Transaction, feedback: &Feedback) -> Result<FeedbackOutcome> {
        let correction = NewCorrection {
            transaction_id: tx.id,
            category_id: feedback.category_id,
            rule_id: feedback.rule_id,
            was_correct: feedback.was_correct,
            confidence: feedback.confidence,
            kind: feedback.kind,
            merchant_name: tx.merchant().map(str::to_string),
            description: tx.description_text().map(str::to_string),
        };

        let outcome = self.db.apply_feedback(
            &correction,
            feedback.usage_outcome(),
            &self.deactivation,
            |stored| {
                if stored.kind == FeedbackKind::Correction {
                    self.learned_rule(tx, stored)
                } else {
                    None
                }
            },
        )?;

        debug!(
            "Recorded {} feedback {} for category {}",
            outcome.correction.kind, outcome.correction.id, outcome.correction.category_id
        );
        if let Some(rule) = &outcome.created_rule {
            info!(
                "Learned rule {} ({}) for category {} from correction {}",
                rule.id,
                rule.label(),
                rule.category_id,
                outcome.correction.id
            );
        }
        Ok(outcome)
    }

    fn learned_rule(&self, tx: &Transaction, correction: &Correction) -> Option<NewRule> {
        let (pattern_type, value) = match LearnedPattern::from_transaction(tx) {
            LearnedPattern::Merchant(value) => (PatternType::Merchant, value),
            LearnedPattern::Description(value) => (PatternType::Description, value),
            LearnedPattern::Keyword => {
                debug!(
                    "Correction {} has no merchant or description; no rule learned",
                    correction.id
                );
                return None;
            }
        };

        let mut metadata = Metadata::new();
        metadata.insert("source".to_string(), json!("feedback"));
        metadata.insert("correction_id".to_string(), json!(correction.id));
        metadata.insert("transaction_id".to_string(), json!(correction.transaction_id));

        Some(
            NewRule::new(correction.category_id, pattern_type, &value)
                .weight(self.config.learned_rule_weight)
                .user_created(true)
                .metadata(metadata),
        )
    }

    /// Counts per feedback kind and acceptance ratio
    pub fn feedback_summary(&self) -> Result<FeedbackSummary> {
        self.db.feedback_summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_outcome_by_kind() {
        assert!(Feedback::accepted(1).usage_outcome());
        assert!(!Feedback::new(FeedbackKind::Accepted, 1, false).usage_outcome());
        assert!(!Feedback::new(FeedbackKind::Rejected, 1, true).usage_outcome());
        assert!(!Feedback::new(FeedbackKind::Corrected, 1, true).usage_outcome());
        assert!(!Feedback::correction(1).usage_outcome());
        assert!(Feedback::new(FeedbackKind::Correction, 1, true).usage_outcome());
    }

    #[test]
    fn test_learned_pattern_preference() {
        let tx = Transaction::default()
            .with_merchant(" Coffee Bar ")
            .with_description("latte");
        assert_eq!(
            LearnedPattern::from_transaction(&tx),
            LearnedPattern::Merchant("Coffee Bar".to_string())
        );

        let tx = Transaction::default()
            .with_merchant("  ")
            .with_description("Monthly rent");
        assert_eq!(
            LearnedPattern::from_transaction(&tx),
            LearnedPattern::Description("Monthly rent".to_string())
        );

        assert_eq!(
            LearnedPattern::from_transaction(&Transaction::default()),
            LearnedPattern::Keyword
        );
    }
}
