//! CLI argument definitions using clap
//!
//! This module contains all the clap structs and enums for parsing CLI arguments.
//! The actual command implementations are in the `commands` module.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;

/// Tally - Rule-based transaction categorization
#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Categorize transactions with learned, self-correcting rules", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "tally.db", global = true)]
    pub db: PathBuf,

    /// Engine config file (defaults to the data-dir override, then built-in defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Show the effective engine configuration
    Config,

    /// List or add categories
    Categories {
        #[command(subcommand)]
        action: Option<CategoriesAction>,
    },

    /// Categorize a single transaction
    Categorize {
        #[command(flatten)]
        tx: TransactionArgs,

        /// Print every matching rule, not just the winner
        #[arg(long)]
        explain: bool,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage atomic rules (list, add, update, delete, enable, disable, test)
    Rules {
        #[command(subcommand)]
        action: Option<RulesAction>,
    },

    /// Manage composite rules (list, add, add-member, remove-member, delete)
    Composites {
        #[command(subcommand)]
        action: Option<CompositesAction>,
    },

    /// Manage canonical merchants (list, resolve, aliases, merge, normalize)
    Merchants {
        #[command(subcommand)]
        action: Option<MerchantsAction>,
    },

    /// Record feedback and inspect what the engine learned
    Feedback {
        #[command(subcommand)]
        action: FeedbackAction,
    },
}

/// Transaction fields accepted by categorize and rule testing
#[derive(Args, Debug, Clone, Default)]
pub struct TransactionArgs {
    /// Raw merchant name as it appears on the statement
    #[arg(short, long)]
    pub merchant: Option<String>,

    /// Transaction description
    #[arg(short, long)]
    pub description: Option<String>,

    /// Amount (e.g., 42.50 or -12)
    #[arg(short, long, allow_hyphen_values = true)]
    pub amount: Option<Decimal>,

    /// Timestamp (e.g., 2024-03-08T22:15:00 or "2024-03-08 22:15")
    #[arg(long)]
    pub at: Option<String>,

    /// External transaction id
    #[arg(long)]
    pub id: Option<i64>,
}

#[derive(Subcommand)]
pub enum CategoriesAction {
    /// List categories
    List,

    /// Add a category (no-op if it exists)
    Add {
        /// Category name
        name: String,
    },
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// List rules
    List {
        /// Include inactive rules
        #[arg(long)]
        all: bool,

        /// Only rules for this category (name or id)
        #[arg(long)]
        category: Option<String>,
    },

    /// Add a new rule
    Add {
        /// Category to assign when the rule matches (name or id)
        category: String,
        /// Pattern type: merchant, keyword, description, amount_range, regex, time
        pattern_type: String,
        /// Pattern value (e.g., "starbucks", "10.00-50.00", "night", "09:00-17:00")
        value: String,
        /// Configured confidence weight (0.1 to 5.0)
        #[arg(long, default_value = "1.0")]
        weight: f64,
    },

    /// Change a rule's value or weight
    Update {
        /// Rule ID
        id: i64,
        /// New pattern value
        #[arg(long)]
        value: Option<String>,
        /// New confidence weight
        #[arg(long)]
        weight: Option<f64>,
    },

    /// Delete a rule
    Delete {
        /// Rule ID to delete
        id: i64,
    },

    /// Show usage statistics and effective confidence for a rule
    Stats {
        /// Rule ID
        id: i64,
    },

    /// Re-enable a rule
    Enable {
        /// Rule ID
        id: i64,
    },

    /// Disable a rule
    Disable {
        /// Rule ID
        id: i64,
    },

    /// Show which active rules match a transaction
    Test {
        #[command(flatten)]
        tx: TransactionArgs,
    },
}

#[derive(Subcommand)]
pub enum CompositesAction {
    /// List composite rules
    List {
        /// Include inactive composites
        #[arg(long)]
        all: bool,
    },

    /// Add a composite rule
    Add {
        /// Category (name or id)
        category: String,
        /// Composite name
        name: String,
        /// Operator: AND, OR, NOT
        #[arg(long, default_value = "AND")]
        operator: String,
        /// Member rule IDs, comma-separated
        #[arg(long, value_delimiter = ',', required = true)]
        members: Vec<i64>,
        /// Configured confidence weight (0.1 to 5.0)
        #[arg(long, default_value = "1.0")]
        weight: f64,
        #[command(flatten)]
        conditions: ConditionArgs,
    },

    /// Add a member rule
    AddMember {
        /// Composite ID
        id: i64,
        /// Rule ID
        rule_id: i64,
    },

    /// Remove a member rule
    RemoveMember {
        /// Composite ID
        id: i64,
        /// Rule ID
        rule_id: i64,
    },

    /// Re-enable a composite
    Enable {
        /// Composite ID
        id: i64,
    },

    /// Disable a composite
    Disable {
        /// Composite ID
        id: i64,
    },

    /// Delete a composite rule
    Delete {
        /// Composite ID
        id: i64,
    },
}

/// Side conditions for a composite rule
#[derive(Args, Debug, Clone, Default)]
pub struct ConditionArgs {
    /// Minimum amount (inclusive)
    #[arg(long, allow_hyphen_values = true)]
    pub min_amount: Option<Decimal>,

    /// Maximum amount (inclusive)
    #[arg(long, allow_hyphen_values = true)]
    pub max_amount: Option<Decimal>,

    /// Allowed weekdays, comma-separated (e.g., mon,tue,sat)
    #[arg(long, value_delimiter = ',')]
    pub days: Vec<String>,

    /// Allowed time windows, comma-separated HH:MM-HH:MM
    #[arg(long, value_delimiter = ',')]
    pub times: Vec<String>,

    /// Merchant substrings that veto the composite, comma-separated
    #[arg(long, value_delimiter = ',')]
    pub blacklist: Vec<String>,
}

#[derive(Subcommand)]
pub enum MerchantsAction {
    /// List canonical merchants by usage
    List {
        /// Maximum number to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Resolve a raw merchant name to its canonical merchant
    Resolve {
        /// Raw merchant name
        raw: String,
    },

    /// Show the known spellings of a merchant
    Aliases {
        /// Merchant ID
        id: i64,
    },

    /// Merge one merchant into another
    Merge {
        /// Merchant ID to merge away
        source: i64,
        /// Merchant ID to keep
        into: i64,
    },

    /// Show the normalized and display forms of a raw name (no database changes)
    Normalize {
        /// Raw merchant name
        raw: String,
    },

    /// Set or clear a merchant's category hint
    Hint {
        /// Merchant ID
        id: i64,
        /// Category (name or id); omit to clear
        category: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum FeedbackAction {
    /// Record feedback for a categorization
    Record {
        /// Feedback kind: accepted, rejected, corrected, correction
        kind: String,
        /// The correct category (name or id)
        category: String,
        /// Rule that produced the categorization
        #[arg(long)]
        rule: Option<i64>,
        /// Confidence reported with the categorization
        #[arg(long)]
        confidence: Option<f64>,
        #[command(flatten)]
        tx: TransactionArgs,
    },

    /// Show feedback counts and acceptance ratio
    Summary,

    /// List recent feedback events
    List {
        /// Maximum number to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}
