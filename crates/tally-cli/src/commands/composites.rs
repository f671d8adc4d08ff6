//! Composite rule command implementations

use anyhow::Result;
use chrono::Weekday;
use tally_core::db::Database;
use tally_core::models::{CompositeConditions, CompositeOperator, NewCompositeRule, TimeRange};
use tally_core::{ConfidenceScorer, EngineConfig};

use super::{resolve_category, truncate};
use crate::cli::ConditionArgs;

/// Turn condition flags into composite conditions
pub fn build_conditions(args: &ConditionArgs) -> Result<CompositeConditions> {
    let days_of_week = if args.days.is_empty() {
        None
    } else {
        let days = args
            .days
            .iter()
            .map(|d| {
                d.trim()
                    .parse::<Weekday>()
                    .map_err(|_| anyhow::anyhow!("Invalid weekday: {}", d))
            })
            .collect::<Result<Vec<_>>>()?;
        Some(days)
    };

    let time_ranges = args
        .times
        .iter()
        .map(|t| t.parse::<TimeRange>().map_err(|e| anyhow::anyhow!(e)))
        .collect::<Result<Vec<_>>>()?;

    Ok(CompositeConditions {
        min_amount: args.min_amount,
        max_amount: args.max_amount,
        days_of_week,
        time_ranges,
        merchant_blacklist: args.blacklist.clone(),
    })
}

pub fn cmd_composites_list(db: &Database, config: &EngineConfig, all: bool) -> Result<()> {
    let composites = db.list_composites(!all)?;

    if composites.is_empty() {
        println!("No composite rules found.");
        return Ok(());
    }

    let scorer = ConfidenceScorer::new(config.confidence.clone());

    println!();
    println!("🧩 Composite rules");
    println!("   ─────────────────────────────────────────────────────────────");

    for composite in composites {
        let members = db.composite_members(&composite)?;
        let member_refs: Vec<_> = members.iter().collect();
        let status = if composite.active { "" } else { " (inactive)" };
        println!(
            "   #{} {} -> category {} (confidence {:.2}){}",
            composite.id,
            composite.name,
            composite.category_id,
            scorer.composite_confidence(&composite, &member_refs),
            status
        );
        println!("      {}", truncate(&composite.description(&members), 70));
        if !composite.conditions.is_empty() {
            println!(
                "      conditions: {}",
                serde_json::to_string(&composite.conditions)?
            );
        }
        let dangling = composite.member_ids.len().saturating_sub(members.len());
        if dangling > 0 {
            println!("      ⚠️  {} member(s) no longer exist", dangling);
        }
    }

    Ok(())
}

pub fn cmd_composites_add(
    db: &Database,
    category: &str,
    name: &str,
    operator: &str,
    members: &[i64],
    weight: f64,
    conditions: &ConditionArgs,
) -> Result<()> {
    let category = resolve_category(db, category)?;
    let operator: CompositeOperator = operator.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let composite = db.create_composite(
        &NewCompositeRule::new(category.id, name, operator, members.to_vec())
            .conditions(build_conditions(conditions)?)
            .weight(weight),
    )?;
    let rules = db.composite_members(&composite)?;
    println!(
        "✅ Created composite #{} '{}' for '{}': {}",
        composite.id,
        composite.name,
        category.name,
        composite.description(&rules)
    );

    Ok(())
}

pub fn cmd_composites_add_member(db: &Database, id: i64, rule_id: i64) -> Result<()> {
    let composite = db.add_composite_member(id, rule_id)?;
    println!(
        "✅ Composite #{} now has {} member(s)",
        composite.id,
        composite.member_ids.len()
    );
    Ok(())
}

pub fn cmd_composites_remove_member(db: &Database, id: i64, rule_id: i64) -> Result<()> {
    let composite = db.remove_composite_member(id, rule_id)?;
    println!(
        "✅ Composite #{} now has {} member(s)",
        composite.id,
        composite.member_ids.len()
    );
    Ok(())
}

pub fn cmd_composites_set_active(db: &Database, id: i64, active: bool) -> Result<()> {
    let composite = db.set_composite_active(id, active)?;
    println!(
        "✅ Composite #{} '{}' {}",
        composite.id,
        composite.name,
        if active { "enabled" } else { "disabled" }
    );
    Ok(())
}

pub fn cmd_composites_delete(db: &Database, id: i64) -> Result<()> {
    if !db.delete_composite(id)? {
        anyhow::bail!("Composite rule not found: #{}", id);
    }
    println!("✅ Deleted composite #{}", id);
    Ok(())
}
