//! Definition-time validation for rules, composites and conditions
//!
//! Everything here runs before a definition reaches the store. Matching itself
//! never fails, so a bad pattern caught here is the only place it surfaces.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::matching::{compile_pattern, parse_amount_range, TimePattern};
use crate::models::{
    CompositeConditions, CompositeOperator, NewCompositeRule, NewRule, PatternType, Rule,
    UsageStats, MAX_CONFIDENCE_WEIGHT, MIN_CONFIDENCE_WEIGHT,
};

/// Longest regex pattern accepted
pub const MAX_REGEX_LENGTH: usize = 500;

/// Check a pattern value against its type's format
pub fn validate_pattern(pattern_type: PatternType, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!(
            "{} pattern value cannot be blank",
            pattern_type
        )));
    }

    match pattern_type {
        PatternType::Merchant | PatternType::Keyword | PatternType::Description => Ok(()),
        PatternType::AmountRange => {
            let (min, max) = parse_amount_range(value).ok_or_else(|| {
                Error::validation(format!(
                    "Invalid amount range '{}': expected MIN-MAX such as 10.00-50.00",
                    value
                ))
            })?;
            if min > max {
                return Err(Error::validation(format!(
                    "Invalid amount range '{}': minimum {} exceeds maximum {}",
                    value, min, max
                )));
            }
            Ok(())
        }
        PatternType::Regex => validate_regex(value),
        PatternType::Time => {
            TimePattern::parse(value).map(|_| ()).ok_or_else(|| {
                Error::validation(format!(
                    "Invalid time pattern '{}': expected morning, afternoon, evening, night, \
                     weekend, weekday or HH:MM-HH:MM",
                    value
                ))
            })
        }
    }
}

/// Reject regexes that are too long, catastrophically backtracking, or invalid
pub fn validate_regex(pattern: &str) -> Result<()> {
    if pattern.chars().count() > MAX_REGEX_LENGTH {
        return Err(Error::validation(format!(
            "Regex pattern is longer than {} characters",
            MAX_REGEX_LENGTH
        )));
    }
    if has_nested_quantifier(pattern) {
        return Err(Error::validation(format!(
            "Unsafe regex '{}': nested quantifiers can cause catastrophic backtracking",
            pattern
        )));
    }
    compile_pattern(pattern)
        .map(|_| ())
        .map_err(|e| Error::validation(format!("Invalid regex '{}': {}", pattern, e)))
}

/// True if some quantified group itself contains a quantifier, as in `(a+)+`
fn has_nested_quantifier(pattern: &str) -> bool {
    // One frame per open group: does the group body contain a quantifier?
    let mut groups: Vec<bool> = Vec::new();
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                i += 2;
                continue;
            }
            '[' => {
                // Skip the character class; quantifier chars inside are literals
                i += 1;
                if chars.get(i) == Some(&'^') {
                    i += 1;
                }
                if chars.get(i) == Some(&']') {
                    i += 1;
                }
                while i < chars.len() && chars[i] != ']' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
            }
            '(' => {
                groups.push(false);
                // Group modifiers like (?: or (?i) are not quantifiers
                if chars.get(i + 1) == Some(&'?') {
                    i += 1;
                }
            }
            ')' => {
                let inner_quantified = groups.pop().unwrap_or(false);
                let quantified = is_repeating_quantifier(&chars, i + 1);
                if inner_quantified && quantified {
                    return true;
                }
                if let Some(parent) = groups.last_mut() {
                    *parent |= inner_quantified || quantified;
                }
            }
            '*' | '+' | '?' | '{' => {
                if let Some(top) = groups.last_mut() {
                    *top = true;
                }
            }
            _ => {}
        }
        i += 1;
    }

    false
}

/// `*`, `+` or a `{n,m}` that allows more than one repetition
fn is_repeating_quantifier(chars: &[char], at: usize) -> bool {
    match chars.get(at) {
        Some('*') | Some('+') => true,
        Some('{') => {
            let body: String = chars[at + 1..].iter().take_while(|c| **c != '}').collect();
            let mut parts = body.splitn(2, ',');
            let low = parts.next().and_then(|p| p.trim().parse::<u32>().ok());
            match parts.next() {
                // {n,} is unbounded
                Some(high) if high.trim().is_empty() => true,
                Some(high) => high.trim().parse::<u32>().map(|h| h > 1).unwrap_or(false),
                None => low.is_some_and(|n| n > 1),
            }
        }
        _ => false,
    }
}

/// Configured importance must be a finite value in [0.1, 5.0]
pub fn validate_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || !(MIN_CONFIDENCE_WEIGHT..=MAX_CONFIDENCE_WEIGHT).contains(&weight) {
        return Err(Error::validation(format!(
            "Confidence weight {} must be between {} and {}",
            weight, MIN_CONFIDENCE_WEIGHT, MAX_CONFIDENCE_WEIGHT
        )));
    }
    Ok(())
}

pub fn validate_stats(stats: &UsageStats) -> Result<()> {
    if stats.usage_count < 0 || stats.success_count < 0 {
        return Err(Error::validation("Usage counters cannot be negative"));
    }
    if stats.success_count > stats.usage_count {
        return Err(Error::validation(format!(
            "Success count {} exceeds usage count {}",
            stats.success_count, stats.usage_count
        )));
    }
    Ok(())
}

pub fn validate_new_rule(rule: &NewRule) -> Result<()> {
    validate_pattern(rule.pattern_type, &rule.pattern_value)?;
    validate_weight(rule.confidence_weight)
}

/// Parse an operator name, reporting unknown ones as validation errors
pub fn parse_operator(s: &str) -> Result<CompositeOperator> {
    s.parse::<CompositeOperator>().map_err(Error::Validation)
}

pub fn validate_conditions(conditions: &CompositeConditions) -> Result<()> {
    if let (Some(min), Some(max)) = (conditions.min_amount, conditions.max_amount) {
        if min > max {
            return Err(Error::validation(format!(
                "Condition min_amount {} exceeds max_amount {}",
                min, max
            )));
        }
    }
    if let Some(days) = &conditions.days_of_week {
        if days.is_empty() {
            return Err(Error::validation("days_of_week cannot be an empty list"));
        }
    }
    if conditions
        .merchant_blacklist
        .iter()
        .any(|entry| entry.trim().is_empty())
    {
        return Err(Error::validation("Merchant blacklist entries cannot be blank"));
    }
    Ok(())
}

/// Member list must be non-empty, unique, and point at rules of the same category
pub fn validate_members(category_id: i64, member_ids: &[i64], existing: &[Rule]) -> Result<()> {
    if member_ids.is_empty() {
        return Err(Error::validation("A composite rule needs at least one member"));
    }

    let mut seen = HashSet::new();
    for id in member_ids {
        if !seen.insert(*id) {
            return Err(Error::validation(format!("Duplicate member rule id {}", id)));
        }
        let rule = existing
            .iter()
            .find(|r| r.id == *id)
            .ok_or_else(|| Error::validation(format!("Member rule {} does not exist", id)))?;
        if rule.category_id != category_id {
            return Err(Error::validation(format!(
                "Member rule {} belongs to category {}, not {}",
                id, rule.category_id, category_id
            )));
        }
    }
    Ok(())
}

pub fn validate_new_composite(composite: &NewCompositeRule, existing: &[Rule]) -> Result<()> {
    if composite.name.trim().is_empty() {
        return Err(Error::validation("Composite rule name cannot be blank"));
    }
    validate_weight(composite.confidence_weight)?;
    validate_conditions(&composite.conditions)?;
    validate_members(composite.category_id, &composite.member_ids, existing)
}
