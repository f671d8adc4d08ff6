//! Tally Core Library
//!
//! Rule engine for automatic transaction categorization:
//! - Atomic rules over merchant, keyword, description, amount, regex and time patterns
//! - Composite rules combining atomic rules with AND / OR / NOT plus side conditions
//! - Confidence scoring that balances configured weight against observed accuracy
//! - Feedback loop that learns rules from corrections and retires poor performers
//! - Merchant name normalization and deduplication
//! - SQLite rule store with atomic usage counters and explicit cache invalidation

pub mod cache;
pub mod categorizer;
pub mod composite;
pub mod confidence;
pub mod config;
pub mod db;
pub mod error;
pub mod feedback;
pub mod matching;
pub mod merchant;
pub mod models;
pub mod validation;

pub use cache::{CacheInvalidator, CacheKey, InMemoryRuleCache, RuleCache, StoreEvent};
pub use categorizer::{CategoryDecision, Categorizer, RuleMatch, RuleRef};
pub use confidence::{ConfidenceConfig, ConfidenceScorer, DeactivationConfig};
pub use config::EngineConfig;
pub use db::Database;
pub use error::{Error, Result};
pub use feedback::{Feedback, FeedbackConfig, FeedbackLoop, FeedbackOutcome, LearnedPattern};
pub use matching::{MatchFields, MatchInput, TimePattern};
pub use merchant::{beautify, normalize, MerchantConfig, MerchantResolver};
pub use models::*;
