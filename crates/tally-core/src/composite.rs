//! Composite rules: boolean combinations of atomic rules
//!
//! Members are stored as rule ids and resolved against whatever rules the
//! caller loaded. An id that no longer resolves is treated as "not a member".

use chrono::Datelike;

use crate::confidence::ConfidenceScorer;
use crate::matching::MatchInput;
use crate::models::{CompositeOperator, CompositeRule, Rule, Transaction};

/// Members listed in a description before truncation
const DESCRIPTION_MEMBER_LIMIT: usize = 5;

impl CompositeRule {
    /// Members that still exist, in member-list order
    pub fn resolve_members<'r>(&self, rules: &'r [Rule]) -> Vec<&'r Rule> {
        self.member_ids
            .iter()
            .filter_map(|id| rules.iter().find(|r| r.id == *id))
            .collect()
    }

    /// Side conditions (amount, day, time, blacklist) hold for the transaction
    pub fn conditions_hold(&self, tx: &Transaction) -> bool {
        let c = &self.conditions;

        if c.min_amount.is_some() || c.max_amount.is_some() {
            let Some(amount) = tx.amount else {
                return false;
            };
            if c.min_amount.is_some_and(|min| amount < min) {
                return false;
            }
            if c.max_amount.is_some_and(|max| amount > max) {
                return false;
            }
        }

        if let Some(days) = &c.days_of_week {
            match tx.timestamp {
                Some(ts) if days.contains(&ts.weekday()) => {}
                _ => return false,
            }
        }

        if !c.time_ranges.is_empty() {
            let Some(ts) = tx.timestamp else {
                return false;
            };
            if !c.time_ranges.iter().any(|r| r.contains(ts.time())) {
                return false;
            }
        }

        if !c.merchant_blacklist.is_empty() {
            if let Some(merchant) = tx.merchant() {
                let merchant = merchant.to_lowercase();
                let blocked = c
                    .merchant_blacklist
                    .iter()
                    .map(|b| b.trim().to_lowercase())
                    .any(|b| !b.is_empty() && merchant.contains(&b));
                if blocked {
                    return false;
                }
            }
        }

        true
    }

    /// Evaluate the composite against a transaction
    pub fn matches(&self, rules: &[Rule], tx: &Transaction) -> bool {
        self.matches_views(rules, &[tx])
    }

    /// Evaluate the composite against several views of one transaction
    ///
    /// Views differ only in merchant name (raw statement text, canonical
    /// display name). A member matches if it matches any view; side
    /// conditions must hold for every view, so a blacklisted name in any
    /// view vetoes the composite.
    pub fn matches_views(&self, rules: &[Rule], views: &[&Transaction]) -> bool {
        if !self.active || views.is_empty() {
            return false;
        }
        let members = self.resolve_members(rules);
        if members.is_empty() || !views.iter().all(|tx| self.conditions_hold(tx)) {
            return false;
        }

        let mut results = members
            .iter()
            .map(|r| views.iter().any(|tx| r.matches(MatchInput::from(*tx))));
        match self.operator {
            CompositeOperator::And => results.all(|m| m),
            CompositeOperator::Or => results.any(|m| m),
            CompositeOperator::Not => !results.any(|m| m),
        }
    }

    /// Effective confidence under the default coefficients
    pub fn effective_confidence(&self, rules: &[Rule]) -> f64 {
        ConfidenceScorer::default().composite_confidence(self, &self.resolve_members(rules))
    }

    /// Human-readable form such as `merchant:uber AND time:night`
    pub fn description(&self, rules: &[Rule]) -> String {
        let members = self.resolve_members(rules);
        if members.is_empty() {
            return "(no members)".to_string();
        }

        let labels: Vec<String> = members
            .iter()
            .take(DESCRIPTION_MEMBER_LIMIT)
            .map(|r| r.label())
            .collect();
        let hidden = members.len().saturating_sub(DESCRIPTION_MEMBER_LIMIT);
        let more = if hidden > 0 {
            format!(" (+{} more)", hidden)
        } else {
            String::new()
        };

        match self.operator {
            CompositeOperator::And => format!("{}{}", labels.join(" AND "), more),
            CompositeOperator::Or => format!("{}{}", labels.join(" OR "), more),
            CompositeOperator::Not => format!("NOT ({}{})", labels.join(" OR "), more),
        }
    }

    /// Add a member id; returns false if it was already present
    pub fn add_member(&mut self, rule_id: i64) -> bool {
        if self.member_ids.contains(&rule_id) {
            return false;
        }
        self.member_ids.push(rule_id);
        true
    }

    /// Remove a member id; returns false if it wasn't present
    pub fn remove_member(&mut self, rule_id: i64) -> bool {
        let before = self.member_ids.len();
        self.member_ids.retain(|id| *id != rule_id);
        self.member_ids.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CompositeConditions, PatternType, UsageStats};
    use chrono::{NaiveDate, NaiveDateTime, Utc, Weekday};
    use rust_decimal::Decimal;

    fn rule(id: i64, pattern_type: PatternType, value: &str) -> Rule {
        Rule {
            id,
            category_id: 7,
            pattern_type,
            pattern_value: value.to_string(),
            confidence_weight: 1.0,
            stats: UsageStats::default(),
            active: true,
            user_created: false,
            metadata: Default::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn composite(operator: CompositeOperator, member_ids: Vec<i64>) -> CompositeRule {
        CompositeRule {
            id: 1,
            category_id: 7,
            name: "test".to_string(),
            operator,
            member_ids,
            conditions: CompositeConditions::default(),
            confidence_weight: 1.0,
            stats: UsageStats::default(),
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn ts(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn rules() -> Vec<Rule> {
        vec![
            rule(1, PatternType::Merchant, "uber"),
            rule(2, PatternType::Time, "night"),
            rule(3, PatternType::Keyword, "eats"),
        ]
    }

    #[test]
    fn test_and_requires_all_members() {
        let rules = rules();
        let c = composite(CompositeOperator::And, vec![1, 2]);

        let late = Transaction::default()
            .with_merchant("UBER TRIP")
            .with_timestamp(ts(2024, 6, 1, 23));
        assert!(c.matches(&rules, &late));

        let noon = Transaction::default()
            .with_merchant("UBER TRIP")
            .with_timestamp(ts(2024, 6, 1, 12));
        assert!(!c.matches(&rules, &noon));
    }

    #[test]
    fn test_or_requires_any_member() {
        let rules = rules();
        let c = composite(CompositeOperator::Or, vec![1, 3]);
        let tx = Transaction::default().with_description("eats delivery");
        assert!(c.matches(&rules, &tx));
        let tx = Transaction::default().with_merchant("Lyft");
        assert!(!c.matches(&rules, &tx));
    }

    #[test]
    fn test_not_matches_iff_no_member_matches() {
        let rules = rules();
        let c = composite(CompositeOperator::Not, vec![1, 3]);

        let neither = Transaction::default().with_merchant("Lyft");
        assert!(c.matches(&rules, &neither));

        let first = Transaction::default().with_merchant("Uber");
        assert!(!c.matches(&rules, &first));

        let second = Transaction::default()
            .with_merchant("Lyft")
            .with_description("Eats");
        assert!(!c.matches(&rules, &second));
    }

    #[test]
    fn test_dangling_members_are_ignored() {
        let rules = rules();
        let c = composite(CompositeOperator::And, vec![1, 99]);
        let tx = Transaction::default().with_merchant("uber");
        assert!(c.matches(&rules, &tx));

        let gone = composite(CompositeOperator::Or, vec![98, 99]);
        assert!(!gone.matches(&rules, &tx));
        assert_eq!(gone.effective_confidence(&rules), 0.0);
    }

    #[test]
    fn test_inactive_composite_never_matches() {
        let rules = rules();
        let mut c = composite(CompositeOperator::Or, vec![1]);
        c.active = false;
        assert!(!c.matches(&rules, &Transaction::default().with_merchant("uber")));
    }

    #[test]
    fn test_amount_condition_requires_amount() {
        let rules = rules();
        let mut c = composite(CompositeOperator::Or, vec![1]);
        c.conditions.min_amount = Some(Decimal::new(2000, 2));
        c.conditions.max_amount = Some(Decimal::new(5000, 2));

        let tx = Transaction::default().with_merchant("uber");
        assert!(!c.matches(&rules, &tx));
        assert!(c.matches(&rules, &tx.clone().with_amount(Decimal::new(2000, 2))));
        assert!(!c.matches(&rules, &tx.clone().with_amount(Decimal::new(5001, 2))));
    }

    #[test]
    fn test_day_and_time_conditions() {
        let rules = rules();
        let mut c = composite(CompositeOperator::Or, vec![1]);
        c.conditions.days_of_week = Some(vec![Weekday::Sat]);
        c.conditions.time_ranges = vec!["22:00-03:00".parse().unwrap()];

        // 2024-06-01 is a Saturday
        let sat_late = Transaction::default()
            .with_merchant("uber")
            .with_timestamp(ts(2024, 6, 1, 23));
        assert!(c.matches(&rules, &sat_late));

        let sat_noon = Transaction::default()
            .with_merchant("uber")
            .with_timestamp(ts(2024, 6, 1, 12));
        assert!(!c.matches(&rules, &sat_noon));

        let sun_late = Transaction::default()
            .with_merchant("uber")
            .with_timestamp(ts(2024, 6, 2, 23));
        assert!(!c.matches(&rules, &sun_late));

        assert!(!c.matches(&rules, &Transaction::default().with_merchant("uber")));
    }

    #[test]
    fn test_blacklist_is_case_insensitive() {
        let rules = rules();
        let mut c = composite(CompositeOperator::Or, vec![1]);
        c.conditions.merchant_blacklist = vec!["Eats".to_string()];
        assert!(!c.matches(&rules, &Transaction::default().with_merchant("UBER EATS")));
        assert!(c.matches(&rules, &Transaction::default().with_merchant("UBER TRIP")));
    }

    #[test]
    fn test_views_are_merged_before_the_operator() {
        let rules = vec![rule(1, PatternType::Merchant, "coffee")];
        let raw = Transaction::default().with_merchant("SQ *BLUE BOTTLE #12");
        let canonical = Transaction::default().with_merchant("Blue Bottle Coffee");

        let not = composite(CompositeOperator::Not, vec![1]);
        assert!(not.matches(&rules, &raw));
        assert!(!not.matches_views(&rules, &[&raw, &canonical]));

        let or = composite(CompositeOperator::Or, vec![1]);
        assert!(or.matches_views(&rules, &[&raw, &canonical]));
    }

    #[test]
    fn test_blacklist_checks_every_view() {
        let rules = rules();
        let mut c = composite(CompositeOperator::Or, vec![1]);
        c.conditions.merchant_blacklist = vec!["eats".to_string()];

        let raw = Transaction::default().with_merchant("UBER *TRIP 8812");
        let canonical = Transaction::default().with_merchant("Uber Eats");
        assert!(c.matches(&rules, &raw));
        assert!(!c.matches_views(&rules, &[&raw, &canonical]));
        assert!(!c.matches_views(&rules, &[]));
    }

    #[test]
    fn test_description_formats() {
        let rules = rules();
        let and = composite(CompositeOperator::And, vec![1, 2]);
        assert_eq!(and.description(&rules), "merchant:uber AND time:night");

        let not = composite(CompositeOperator::Not, vec![1, 3]);
        assert_eq!(not.description(&rules), "NOT (merchant:uber OR keyword:eats)");
    }

    #[test]
    fn test_description_truncates_long_member_lists() {
        let rules: Vec<Rule> = (1..=7)
            .map(|i| rule(i, PatternType::Keyword, &format!("k{}", i)))
            .collect();
        let c = composite(CompositeOperator::Or, (1..=7).collect());
        assert_eq!(
            c.description(&rules),
            "keyword:k1 OR keyword:k2 OR keyword:k3 OR keyword:k4 OR keyword:k5 (+2 more)"
        );
    }

    #[test]
    fn test_member_mutation_is_idempotent() {
        let mut c = composite(CompositeOperator::And, vec![1]);
        assert!(c.add_member(2));
        assert!(!c.add_member(2));
        assert_eq!(c.member_ids, vec![1, 2]);

        assert!(c.remove_member(1));
        assert!(!c.remove_member(1));
        assert_eq!(c.member_ids, vec![2]);
    }
}
