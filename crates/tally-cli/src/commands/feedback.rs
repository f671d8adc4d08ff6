//! Feedback command implementations

use anyhow::Result;
use tally_core::db::Database;
use tally_core::models::FeedbackKind;
use tally_core::{EngineConfig, Feedback, FeedbackLoop};

use super::{build_transaction, resolve_category, truncate};
use crate::cli::TransactionArgs;

fn feedback_loop<'a>(db: &'a Database, config: &EngineConfig) -> FeedbackLoop<'a> {
    FeedbackLoop::new(db, config.feedback.clone(), config.deactivation.clone())
}

pub fn cmd_feedback_record(
    db: &Database,
    config: &EngineConfig,
    kind: &str,
    category: &str,
    rule: Option<i64>,
    confidence: Option<f64>,
    args: &TransactionArgs,
) -> Result<()> {
    let kind: FeedbackKind = kind.parse().map_err(|e: String| {
        let valid: Vec<&str> = FeedbackKind::all().iter().map(|k| k.as_str()).collect();
        anyhow::anyhow!("{} (valid kinds: {})", e, valid.join(", "))
    })?;
    let category = resolve_category(db, category)?;
    let tx = build_transaction(args)?;

    let was_correct = kind == FeedbackKind::Accepted;
    let feedback = Feedback::new(kind, category.id, was_correct)
        .rule(rule)
        .confidence(confidence);

    let outcome = feedback_loop(db, config).record_feedback(&tx, &feedback)?;
    println!(
        "✅ Recorded {} feedback #{} for '{}'",
        outcome.correction.kind, outcome.correction.id, category.name
    );

    if let (Some(rule_id), None) = (rule, outcome.correction.rule_id) {
        println!("   ⚠️  Rule #{} no longer exists; recorded without it", rule_id);
    }
    if let (Some(rule_id), Some(stats)) = (rule, outcome.rule_stats) {
        println!(
            "   Rule #{}: {}/{} successful ({:.0}%)",
            rule_id,
            stats.success_count,
            stats.usage_count,
            stats.success_rate * 100.0
        );
    }
    if outcome.deactivated {
        println!("   ⚠️  Rule deactivated for poor performance");
    }
    if let Some(learned) = outcome.created_rule {
        println!("   📚 Learned rule #{}: {}", learned.id, learned.label());
    }

    Ok(())
}

pub fn cmd_feedback_summary(db: &Database, config: &EngineConfig) -> Result<()> {
    let summary = feedback_loop(db, config).feedback_summary()?;

    println!();
    println!("📊 Feedback summary");
    println!("   ─────────────────────────────");
    println!("   Total events:     {}", summary.total);
    println!("   Accepted:         {}", summary.accepted);
    println!("   Rejected:         {}", summary.rejected);
    println!("   Corrected:        {}", summary.corrected);
    println!("   Corrections:      {}", summary.corrections);
    println!(
        "   Acceptance ratio: {:.1}%",
        summary.acceptance_ratio * 100.0
    );
    println!("   Learned rules:    {}", summary.learned_rules);
    println!("   Inactive rules:   {}", summary.inactive_rules);

    Ok(())
}

pub fn cmd_feedback_list(db: &Database, limit: i64) -> Result<()> {
    let corrections = db.list_corrections(limit)?;

    if corrections.is_empty() {
        println!("No feedback recorded yet.");
        return Ok(());
    }

    println!();
    println!("📝 Recent feedback");
    println!("   ─────────────────────────────────────────────────────────────");

    for c in corrections {
        let subject = c
            .merchant_name
            .as_deref()
            .or(c.description.as_deref())
            .unwrap_or("-");
        let rule = c
            .rule_id
            .map(|id| format!("rule #{}", id))
            .unwrap_or_else(|| "no rule".to_string());
        println!(
            "   {:>5}  {}  {:<10}  category {:<4}  {:<10}  {}",
            c.id,
            c.created_at.format("%Y-%m-%d"),
            c.kind.as_str(),
            c.category_id,
            rule,
            truncate(subject, 30)
        );
    }

    Ok(())
}
