//! Canonical merchant command implementations

use anyhow::Result;
use tally_core::db::Database;
use tally_core::{beautify, normalize, EngineConfig, MerchantResolver};

use super::{resolve_category, truncate};

pub fn cmd_merchants_list(db: &Database, limit: usize) -> Result<()> {
    let merchants = db.list_merchants()?;

    if merchants.is_empty() {
        println!("No merchants yet. They are created as transactions are categorized.");
        return Ok(());
    }

    println!();
    println!("🏪 Merchants");
    println!("   ─────────────────────────────────────────────────────────────");
    println!("   {:>5}  {:<30}  {:>6}  {:>8}", "ID", "Name", "Uses", "Hint");

    for merchant in merchants.iter().take(limit) {
        let hint = merchant
            .category_hint
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   {:>5}  {:<30}  {:>6}  {:>8}",
            merchant.id,
            truncate(&merchant.display_name, 30),
            merchant.usage_count,
            hint
        );
    }
    if merchants.len() > limit {
        println!("   ... and {} more", merchants.len() - limit);
    }

    Ok(())
}

pub fn cmd_merchants_resolve(db: &Database, config: &EngineConfig, raw: &str) -> Result<()> {
    let resolver = MerchantResolver::new(db, config.merchants.clone());
    match resolver.resolve(raw)? {
        Some(merchant) => println!(
            "✅ '{}' -> {} (id: {}, normalized '{}', {} uses)",
            raw,
            merchant.display_name,
            merchant.id,
            merchant.normalized_name,
            merchant.usage_count
        ),
        None => println!("🤷 '{}' does not name a merchant", raw),
    }
    Ok(())
}

pub fn cmd_merchants_aliases(db: &Database, id: i64) -> Result<()> {
    let merchant = db
        .get_merchant(id)?
        .ok_or_else(|| anyhow::anyhow!("Merchant not found: #{}", id))?;
    let aliases = db.list_aliases(id)?;

    println!();
    println!("🏪 {} (id: {})", merchant.display_name, merchant.id);
    println!("   ─────────────────────────────────────────────");
    if aliases.is_empty() {
        println!("   No aliases recorded");
    }
    for alias in aliases {
        println!("   {:>5.2}  {}", alias.confidence, alias.raw_name);
    }

    Ok(())
}

pub fn cmd_merchants_merge(
    db: &Database,
    config: &EngineConfig,
    source: i64,
    into: i64,
) -> Result<()> {
    let resolver = MerchantResolver::new(db, config.merchants.clone());
    let merged = resolver.merge(source, into)?;
    println!(
        "✅ Merged merchant #{} into '{}' (id: {}, {} uses)",
        source, merged.display_name, merged.id, merged.usage_count
    );
    Ok(())
}

pub fn cmd_merchants_hint(db: &Database, id: i64, category: Option<&str>) -> Result<()> {
    let category = category.map(|arg| resolve_category(db, arg)).transpose()?;
    db.set_merchant_category_hint(id, category.as_ref().map(|c| c.id))?;
    match category {
        Some(c) => println!("✅ Merchant #{} now hints '{}'", id, c.name),
        None => println!("✅ Cleared category hint for merchant #{}", id),
    }
    Ok(())
}

pub fn cmd_merchants_normalize(raw: &str) -> Result<()> {
    let normalized = normalize(raw);
    if normalized.is_empty() {
        println!("🤷 '{}' normalizes to nothing", raw);
        return Ok(());
    }
    println!("   raw:        {}", raw);
    println!("   normalized: {}", normalized);
    println!("   display:    {}", beautify(&normalized));
    Ok(())
}
