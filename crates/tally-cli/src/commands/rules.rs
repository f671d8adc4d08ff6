//! Atomic rule command implementations

use std::collections::HashMap;

use anyhow::Result;
use tally_core::db::Database;
use tally_core::models::{NewRule, PatternType, RuleUpdate};
use tally_core::{Categorizer, ConfidenceScorer, EngineConfig};

use super::{build_transaction, resolve_category, truncate};

/// Parse a pattern type argument
pub fn parse_pattern_type(value: &str) -> Result<PatternType> {
    value.parse().map_err(|e: String| {
        let valid: Vec<&str> = PatternType::all().iter().map(|p| p.as_str()).collect();
        anyhow::anyhow!("{} (valid types: {})", e, valid.join(", "))
    })
}

pub fn cmd_rules_list(
    db: &Database,
    config: &EngineConfig,
    all: bool,
    category: Option<&str>,
) -> Result<()> {
    let rules = match category {
        Some(arg) => {
            let category = resolve_category(db, arg)?;
            db.list_rules_for_category(category.id)?
                .into_iter()
                .filter(|r| all || r.active)
                .collect()
        }
        None => db.list_rules(!all)?,
    };

    if rules.is_empty() {
        println!("No rules found. Add one with 'tally rules add <category> <type> <value>'.");
        return Ok(());
    }

    let names: HashMap<i64, String> = db
        .list_categories()?
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect();
    let scorer = ConfidenceScorer::new(config.confidence.clone());

    println!();
    println!("📋 Rules");
    println!("   ─────────────────────────────────────────────────────────────────────────────");
    println!(
        "   {:>5}  {:<16}  {:<12}  {:<28}  {:>6}  {:>9}  {:>5}",
        "ID", "Category", "Type", "Value", "Weight", "Uses", "Conf"
    );

    for rule in rules {
        let category = names
            .get(&rule.category_id)
            .map(String::as_str)
            .unwrap_or("?");
        let mut flags = String::new();
        if !rule.active {
            flags.push_str(" (inactive)");
        }
        if rule.user_created {
            flags.push_str(" 👤");
        }
        println!(
            "   {:>5}  {:<16}  {:<12}  {:<28}  {:>6.2}  {:>4}/{:<4}  {:>5.2}{}",
            rule.id,
            truncate(category, 16),
            rule.pattern_type.as_str(),
            truncate(&rule.pattern_value, 28),
            rule.confidence_weight,
            rule.stats.success_count,
            rule.stats.usage_count,
            scorer.rule_confidence(&rule),
            flags
        );
    }

    Ok(())
}

pub fn cmd_rules_add(
    db: &Database,
    category: &str,
    pattern_type: &str,
    value: &str,
    weight: f64,
) -> Result<()> {
    let category = resolve_category(db, category)?;
    let pattern_type = parse_pattern_type(pattern_type)?;

    let rule = db.create_rule(
        &NewRule::new(category.id, pattern_type, value)
            .weight(weight)
            .user_created(true),
    )?;
    println!(
        "✅ Created rule #{} for '{}': {}",
        rule.id,
        category.name,
        rule.label()
    );

    Ok(())
}

pub fn cmd_rules_update(
    db: &Database,
    id: i64,
    value: Option<String>,
    weight: Option<f64>,
) -> Result<()> {
    if value.is_none() && weight.is_none() {
        anyhow::bail!("Nothing to update: give --value and/or --weight");
    }

    let rule = db.update_rule(
        id,
        &RuleUpdate {
            pattern_value: value,
            confidence_weight: weight,
            ..Default::default()
        },
    )?;
    println!(
        "✅ Updated rule #{}: {} (weight {:.2})",
        rule.id,
        rule.label(),
        rule.confidence_weight
    );

    Ok(())
}

pub fn cmd_rules_delete(db: &Database, id: i64) -> Result<()> {
    if !db.delete_rule(id)? {
        anyhow::bail!("Rule not found: #{}", id);
    }
    println!("✅ Deleted rule #{}", id);

    Ok(())
}

pub fn cmd_rules_stats(db: &Database, config: &EngineConfig, id: i64) -> Result<()> {
    let rule = db
        .get_rule(id)?
        .ok_or_else(|| anyhow::anyhow!("Rule not found: #{}", id))?;
    let scorer = ConfidenceScorer::new(config.confidence.clone());
    let stats = &rule.stats;

    println!();
    println!("📈 Rule #{} ({})", rule.id, rule.label());
    println!("   ─────────────────────────────");
    println!("   Category:      {}", rule.category_id);
    println!("   Weight:        {:.2}", rule.confidence_weight);
    println!("   Uses:          {}", stats.usage_count);
    println!("   Successes:     {}", stats.success_count);
    println!("   Success rate:  {:.1}%", stats.success_rate * 100.0);
    println!("   Confidence:    {:.2}", scorer.rule_confidence(&rule));
    println!(
        "   Status:        {}{}",
        if rule.active { "active" } else { "inactive" },
        if rule.user_created { " (user-created)" } else { "" }
    );
    if stats.usage_count < config.confidence.min_usage {
        println!(
            "   💡 Sparse data: {} more uses before accuracy counts fully",
            config.confidence.min_usage - stats.usage_count
        );
    } else if config.deactivation.should_deactivate(stats, rule.user_created) && rule.active {
        println!("   ⚠️  Below the deactivation threshold");
    }
    if !rule.metadata.is_empty() {
        println!("   Metadata:      {}", serde_json::to_string(&rule.metadata)?);
    }

    Ok(())
}

pub fn cmd_rules_set_active(db: &Database, id: i64, active: bool) -> Result<()> {
    let rule = db.set_rule_active(id, active)?;
    println!(
        "✅ Rule #{} ({}) {}",
        rule.id,
        rule.label(),
        if active { "enabled" } else { "disabled" }
    );

    Ok(())
}

pub fn cmd_rules_test(
    db: &Database,
    config: &EngineConfig,
    args: &crate::cli::TransactionArgs,
) -> Result<()> {
    let tx = build_transaction(args)?;
    let matches = Categorizer::new(db, config).matching_rules(&tx)?;

    if matches.is_empty() {
        println!("No rules match this transaction");
        return Ok(());
    }

    println!();
    println!("🔍 Matching rules (best first):");
    println!("   ─────────────────────────────────────────────────────────────");

    for m in matches {
        let category = db
            .get_category(m.category_id)?
            .map(|c| c.name)
            .unwrap_or_else(|| format!("#{}", m.category_id));
        println!(
            "   {} -> {} ({:.2}): {}",
            m.rule,
            category,
            m.confidence,
            truncate(&m.label, 50)
        );
    }

    Ok(())
}
