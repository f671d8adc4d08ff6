//! Core command implementations and shared utilities
//!
//! This module contains:
//! - `open_db` / `load_config` - Shared utilities to open the store and read config
//! - `resolve_category` / `build_transaction` - Argument helpers shared by commands
//! - `cmd_init`, `cmd_config`, `cmd_categories_*`, `cmd_categorize`

use std::path::Path;

use anyhow::{Context, Result};
use tally_core::matching::parse_timestamp;
use tally_core::models::{Category, Transaction};
use tally_core::{db::Database, Categorizer, EngineConfig};
use tracing::debug;

use super::truncate;

/// Open the database, creating and migrating it if needed
pub fn open_db(db_path: &Path) -> Result<Database> {
    let path_str = db_path
        .to_str()
        .context("Database path is not valid UTF-8")?;
    debug!("Opening database at {}", path_str);
    Database::new(path_str).context("Failed to open database")
}

/// Load engine config from an explicit path, else the data-dir override or defaults
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => EngineConfig::load().context("Failed to load engine config"),
    }
}

/// Resolve a category argument (ID or name)
pub fn resolve_category(db: &Database, arg: &str) -> Result<Category> {
    if let Ok(id) = arg.parse::<i64>() {
        if let Some(category) = db.get_category(id)? {
            return Ok(category);
        }
    }
    db.get_category_by_name(arg)?.ok_or_else(|| {
        anyhow::anyhow!(
            "Category not found: {} (add it with 'tally categories add')",
            arg
        )
    })
}

/// Build a transaction from CLI arguments
pub fn build_transaction(args: &crate::cli::TransactionArgs) -> Result<Transaction> {
    let timestamp = match args.at.as_deref() {
        Some(text) => Some(
            parse_timestamp(text).ok_or_else(|| anyhow::anyhow!("Invalid timestamp: {}", text))?,
        ),
        None => None,
    };

    let tx = Transaction {
        id: args.id,
        merchant_name: args.merchant.clone(),
        description: args.description.clone(),
        amount: args.amount,
        timestamp,
    };

    if tx.merchant().is_none()
        && tx.description_text().is_none()
        && tx.amount.is_none()
        && tx.timestamp.is_none()
    {
        anyhow::bail!("Give at least one of --merchant, --description, --amount or --at");
    }
    Ok(tx)
}

pub fn cmd_init(db_path: &Path) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    let db = open_db(db_path)?;
    let categories = db.list_categories()?;
    let rules = db.list_rules(false)?;
    println!(
        "   {} categories, {} rules",
        categories.len(),
        rules.len()
    );

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Add a category: tally categories add Dining");
    println!("  2. Add a rule:     tally rules add Dining merchant starbucks");
    println!("  3. Categorize:     tally categorize -m \"SQ *STARBUCKS #123\"");

    Ok(())
}

pub fn cmd_config(config: &EngineConfig) -> Result<()> {
    let c = &config.confidence;
    let d = &config.deactivation;
    let m = &config.merchants;

    println!();
    println!("⚙️  Engine configuration");
    println!("   ─────────────────────────────────────────────");
    println!("   confidence.floor                     {}", c.floor);
    println!("   confidence.ceiling                   {}", c.ceiling);
    println!("   confidence.min_usage                 {}", c.min_usage);
    println!("   confidence.sparse_penalty            {}", c.sparse_penalty);
    println!(
        "   confidence.composite_sparse_penalty  {}",
        c.composite_sparse_penalty
    );
    println!(
        "   confidence.composite_member_boost    {}",
        c.composite_member_boost
    );
    println!("   deactivation.min_usage               {}", d.min_usage);
    println!("   deactivation.min_success_rate        {}", d.min_success_rate);
    println!("   merchants.fuzzy_matching             {}", m.fuzzy_matching);
    println!(
        "   merchants.similarity_threshold       {}",
        m.similarity_threshold
    );
    println!(
        "   feedback.learned_rule_weight         {}",
        config.feedback.learned_rule_weight
    );

    Ok(())
}

pub fn cmd_categories_list(db: &Database) -> Result<()> {
    let categories = db.list_categories()?;

    if categories.is_empty() {
        println!("No categories found. Add one with 'tally categories add <name>'.");
        return Ok(());
    }

    println!();
    println!("📂 Categories");
    println!("   ─────────────────────────────────────────────");
    println!("   {:>5}  {:<30}  {:>6}", "ID", "Name", "Rules");

    for category in categories {
        let rules = db.list_rules_for_category(category.id)?;
        println!(
            "   {:>5}  {:<30}  {:>6}",
            category.id,
            truncate(&category.name, 30),
            rules.len()
        );
    }

    Ok(())
}

pub fn cmd_categories_add(db: &Database, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        anyhow::bail!("Category name cannot be empty");
    }
    let category = db.upsert_category(name)?;
    println!("✅ Category '{}' (id: {})", category.name, category.id);
    Ok(())
}

pub fn cmd_categorize(
    db: &Database,
    config: &EngineConfig,
    args: &crate::cli::TransactionArgs,
    explain: bool,
    json: bool,
) -> Result<()> {
    let tx = build_transaction(args)?;
    let categorizer = Categorizer::new(db, config);
    let decision = categorizer.categorize(&tx)?;

    if json {
        let matches = if explain {
            Some(categorizer.matching_rules(&tx)?)
        } else {
            None
        };
        let output = serde_json::json!({
            "decision": decision,
            "matches": matches,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let Some(decision) = decision else {
        println!("🤷 No rule matched");
        return Ok(());
    };

    let category = db
        .get_category(decision.category_id)?
        .map(|c| c.name)
        .unwrap_or_else(|| format!("#{}", decision.category_id));

    println!();
    println!("🏷️  {} (confidence {:.2})", category, decision.confidence);
    if let Some(merchant) = &decision.merchant {
        println!("   Merchant: {} (id: {})", merchant.display_name, merchant.id);
    }
    println!("   {}", decision.explanation);

    if explain {
        let matches = categorizer.matching_rules(&tx)?;
        println!();
        println!("   All matches:");
        for m in matches {
            println!(
                "   {:<14} {:>5.2}  category {:<4} {}",
                m.rule.to_string(),
                m.confidence,
                m.category_id,
                truncate(&m.label, 50)
            );
        }
    }

    Ok(())
}
