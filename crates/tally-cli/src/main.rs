//! Tally CLI - Rule-based transaction categorization
//!
//! Usage:
//!   tally init                                   Initialize database
//!   tally rules add Dining merchant starbucks    Add a rule
//!   tally categorize -m "SQ *STARBUCKS #123"     Categorize a transaction
//!   tally feedback record correction Dining -m "Coffee Bar"

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db),
        Commands::Config => commands::cmd_config(&config),
        Commands::Categories { action } => {
            let db = commands::open_db(&cli.db)?;
            match action {
                None | Some(CategoriesAction::List) => commands::cmd_categories_list(&db),
                Some(CategoriesAction::Add { name }) => commands::cmd_categories_add(&db, &name),
            }
        }
        Commands::Categorize { tx, explain, json } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_categorize(&db, &config, &tx, explain, json)
        }
        Commands::Rules { action } => {
            let db = commands::open_db(&cli.db)?;
            match action {
                None => commands::cmd_rules_list(&db, &config, false, None),
                Some(RulesAction::List { all, category }) => {
                    commands::cmd_rules_list(&db, &config, all, category.as_deref())
                }
                Some(RulesAction::Add {
                    category,
                    pattern_type,
                    value,
                    weight,
                }) => commands::cmd_rules_add(&db, &category, &pattern_type, &value, weight),
                Some(RulesAction::Update { id, value, weight }) => {
                    commands::cmd_rules_update(&db, id, value, weight)
                }
                Some(RulesAction::Delete { id }) => commands::cmd_rules_delete(&db, id),
                Some(RulesAction::Stats { id }) => commands::cmd_rules_stats(&db, &config, id),
                Some(RulesAction::Enable { id }) => commands::cmd_rules_set_active(&db, id, true),
                Some(RulesAction::Disable { id }) => commands::cmd_rules_set_active(&db, id, false),
                Some(RulesAction::Test { tx }) => commands::cmd_rules_test(&db, &config, &tx),
            }
        }
        Commands::Composites { action } => {
            let db = commands::open_db(&cli.db)?;
            match action {
                None => commands::cmd_composites_list(&db, &config, false),
                Some(CompositesAction::List { all }) => {
                    commands::cmd_composites_list(&db, &config, all)
                }
                Some(CompositesAction::Add {
                    category,
                    name,
                    operator,
                    members,
                    weight,
                    conditions,
                }) => commands::cmd_composites_add(
                    &db,
                    &category,
                    &name,
                    &operator,
                    &members,
                    weight,
                    &conditions,
                ),
                Some(CompositesAction::AddMember { id, rule_id }) => {
                    commands::cmd_composites_add_member(&db, id, rule_id)
                }
                Some(CompositesAction::RemoveMember { id, rule_id }) => {
                    commands::cmd_composites_remove_member(&db, id, rule_id)
                }
                Some(CompositesAction::Enable { id }) => {
                    commands::cmd_composites_set_active(&db, id, true)
                }
                Some(CompositesAction::Disable { id }) => {
                    commands::cmd_composites_set_active(&db, id, false)
                }
                Some(CompositesAction::Delete { id }) => commands::cmd_composites_delete(&db, id),
            }
        }
        Commands::Merchants { action } => match action {
            Some(MerchantsAction::Normalize { raw }) => commands::cmd_merchants_normalize(&raw),
            action => {
                let db = commands::open_db(&cli.db)?;
                match action {
                    None => commands::cmd_merchants_list(&db, 50),
                    Some(MerchantsAction::List { limit }) => commands::cmd_merchants_list(&db, limit),
                    Some(MerchantsAction::Resolve { raw }) => {
                        commands::cmd_merchants_resolve(&db, &config, &raw)
                    }
                    Some(MerchantsAction::Aliases { id }) => commands::cmd_merchants_aliases(&db, id),
                    Some(MerchantsAction::Merge { source, into }) => {
                        commands::cmd_merchants_merge(&db, &config, source, into)
                    }
                    Some(MerchantsAction::Hint { id, category }) => {
                        commands::cmd_merchants_hint(&db, id, category.as_deref())
                    }
                    Some(MerchantsAction::Normalize { raw }) => {
                        commands::cmd_merchants_normalize(&raw)
                    }
                }
            }
        },
        Commands::Feedback { action } => {
            let db = commands::open_db(&cli.db)?;
            match action {
                FeedbackAction::Record {
                    kind,
                    category,
                    rule,
                    confidence,
                    tx,
                } => commands::cmd_feedback_record(
                    &db, &config, &kind, &category, rule, confidence, &tx,
                ),
                FeedbackAction::Summary => commands::cmd_feedback_summary(&db, &config),
                FeedbackAction::List { limit } => commands::cmd_feedback_list(&db, limit),
            }
        }
    }
}
