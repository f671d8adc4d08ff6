//! Confidence scoring for atomic and composite rules
//!
//! A rule's effective confidence balances its configured importance
//! (`confidence_weight`) against its observed accuracy. Rules with too few
//! recorded outcomes are penalized, accurate rules are boosted, and the result
//! is always clamped to `[floor, ceiling]`. Non-finite inputs never escape.

use serde::{Deserialize, Serialize};

use crate::models::{CompositeRule, Rule, UsageStats};

/// Tunable coefficients for the confidence formulas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    pub floor: f64,
    pub ceiling: f64,
    /// Below this many recorded outcomes the sparse-data penalty applies
    pub min_usage: i64,
    pub sparse_penalty: f64,
    pub composite_sparse_penalty: f64,
    /// Share of the member average added on top for composites
    pub composite_member_boost: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            floor: 0.3,
            ceiling: 5.0,
            min_usage: 5,
            sparse_penalty: 0.5,
            composite_sparse_penalty: 0.8,
            composite_member_boost: 0.3,
        }
    }
}

/// When a poorly performing rule gets retired
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeactivationConfig {
    pub min_usage: i64,
    pub min_success_rate: f64,
}

impl Default for DeactivationConfig {
    fn default() -> Self {
        Self {
            min_usage: 20,
            min_success_rate: 0.3,
        }
    }
}

impl DeactivationConfig {
    /// Enough evidence that the rule is mostly wrong, and nobody asked for it
    pub fn should_deactivate(&self, stats: &UsageStats, user_created: bool) -> bool {
        !user_created
            && stats.usage_count >= self.min_usage
            && stats.success_rate < self.min_success_rate
    }
}

/// Computes effective confidence for rules and composites
#[derive(Debug, Clone, Default)]
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    fn clamp(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return self.config.floor;
        }
        value.clamp(self.config.floor, self.config.ceiling)
    }

    /// Multiplier from observed accuracy, 0.5 at 0% and 1.0 at 100%
    fn accuracy_factor(stats: &UsageStats) -> f64 {
        let rate = if stats.success_rate.is_finite() {
            stats.success_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        0.5 + rate * 0.5
    }

    /// Effective confidence of an atomic rule
    pub fn rule_confidence(&self, rule: &Rule) -> f64 {
        let base = rule.confidence_weight;
        if !base.is_finite() {
            return self.config.floor;
        }
        let scored = if rule.stats.usage_count < self.config.min_usage {
            base * self.config.sparse_penalty
        } else {
            base * Self::accuracy_factor(&rule.stats)
        };
        self.clamp(scored)
    }

    /// Effective confidence of a composite given its resolved members
    ///
    /// Returns 0.0 when no member resolves.
    pub fn composite_confidence(&self, composite: &CompositeRule, members: &[&Rule]) -> f64 {
        if members.is_empty() {
            return 0.0;
        }
        let weight = composite.confidence_weight;
        if !weight.is_finite() {
            return self.config.floor;
        }

        let avg = members.iter().map(|r| self.rule_confidence(r)).sum::<f64>() / members.len() as f64;
        let adjusted = weight * (avg + avg * self.config.composite_member_boost);
        let mut scored = adjusted * Self::accuracy_factor(&composite.stats);
        if composite.stats.usage_count < self.config.min_usage {
            scored *= self.config.composite_sparse_penalty;
        }
        self.clamp(scored)
    }
}

impl Rule {
    /// Effective confidence under the default coefficients
    pub fn effective_confidence(&self) -> f64 {
        ConfidenceScorer::default().rule_confidence(self)
    }

    /// Record one evaluated outcome on this in-memory copy
    ///
    /// The store's `record_rule_usage` is the authoritative, atomic version.
    pub fn record_usage(&mut self, successful: bool) {
        self.stats.record(successful);
    }

    /// Retire the rule if it has enough usage and a poor success rate.
    /// Returns true when the rule was just deactivated.
    pub fn check_and_deactivate_if_poor_performance(&mut self) -> bool {
        self.deactivate_if(&DeactivationConfig::default())
    }

    pub(crate) fn deactivate_if(&mut self, config: &DeactivationConfig) -> bool {
        if self.active && config.should_deactivate(&self.stats, self.user_created) {
            self.active = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompositeConditions, CompositeOperator, PatternType};
    use chrono::Utc;

    fn rule(weight: f64, usage: i64, success: i64) -> Rule {
        Rule {
            id: 1,
            category_id: 1,
            pattern_type: PatternType::Merchant,
            pattern_value: "acme".to_string(),
            confidence_weight: weight,
            stats: UsageStats::new(usage, success),
            active: true,
            user_created: false,
            metadata: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn composite(weight: f64, usage: i64, success: i64) -> CompositeRule {
        CompositeRule {
            id: 1,
            category_id: 1,
            name: "test".to_string(),
            operator: CompositeOperator::And,
            member_ids: vec![1, 2],
            conditions: CompositeConditions::default(),
            confidence_weight: weight,
            stats: UsageStats::new(usage, success),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_sparse_rule_is_halved() {
        assert!(approx(rule(2.0, 3, 3).effective_confidence(), 1.0));
    }

    #[test]
    fn test_accuracy_scales_confidence() {
        // 2.0 * (0.5 + 0.8 * 0.5) = 1.8
        assert!(approx(rule(2.0, 10, 8).effective_confidence(), 1.8));
        // Perfect accuracy keeps the full weight
        assert!(approx(rule(2.0, 10, 10).effective_confidence(), 2.0));
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert!(approx(rule(0.1, 0, 0).effective_confidence(), 0.3));
        assert!(approx(rule(5.0, 100, 100).effective_confidence(), 5.0));
        assert!(approx(rule(50.0, 100, 100).effective_confidence(), 5.0));
    }

    #[test]
    fn test_non_finite_weights_fall_to_floor() {
        for weight in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let c = rule(weight, 10, 5).effective_confidence();
            assert!(c.is_finite());
            assert!(approx(c, 0.3));
        }
    }

    #[test]
    fn test_confidence_range_for_edge_weights() {
        for weight in [f64::NAN, f64::INFINITY, 0.1, 5.0] {
            for (usage, success) in [(0, 0), (4, 4), (5, 0), (50, 25), (100, 100)] {
                let c = rule(weight, usage, success).effective_confidence();
                assert!((0.3..=5.0).contains(&c), "weight {weight} gave {c}");
            }
        }
    }

    #[test]
    fn test_composite_confidence() {
        let scorer = ConfidenceScorer::default();
        let a = rule(1.0, 10, 10);
        let b = rule(1.0, 10, 10);
        // avg 1.0, adjusted 1.3, full accuracy 1.3
        let c = composite(1.0, 10, 10);
        assert!(approx(scorer.composite_confidence(&c, &[&a, &b]), 1.3));

        // Sparse composite: 1.3 * 0.5 * 0.8
        let sparse = composite(1.0, 0, 0);
        assert!(approx(scorer.composite_confidence(&sparse, &[&a, &b]), 0.52));
    }

    #[test]
    fn test_composite_without_members_scores_zero() {
        let scorer = ConfidenceScorer::default();
        assert_eq!(scorer.composite_confidence(&composite(1.0, 10, 10), &[]), 0.0);
    }

    #[test]
    fn test_deactivation_thresholds() {
        let mut poor = rule(1.0, 25, 5);
        assert!(poor.check_and_deactivate_if_poor_performance());
        assert!(!poor.active);

        let mut user_rule = rule(1.0, 25, 5);
        user_rule.user_created = true;
        assert!(!user_rule.check_and_deactivate_if_poor_performance());
        assert!(user_rule.active);

        let mut too_new = rule(1.0, 19, 0);
        assert!(!too_new.check_and_deactivate_if_poor_performance());

        let mut ok = rule(1.0, 30, 9);
        assert!(!ok.check_and_deactivate_if_poor_performance());
    }

    #[test]
    fn test_record_usage_updates_in_memory_stats() {
        let mut r = rule(1.0, 0, 0);
        r.record_usage(true);
        r.record_usage(false);
        assert_eq!(r.stats.usage_count, 2);
        assert_eq!(r.stats.success_count, 1);
        assert!(approx(r.stats.success_rate, 0.5));
    }
}
