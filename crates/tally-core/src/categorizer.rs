//! End-to-end categorization
//!
//! Resolves the merchant, evaluates every active atomic and composite rule,
//! and picks the match with the highest effective confidence. Ties prefer
//! composites (they encode more context), then the lowest id.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheKey, InMemoryRuleCache};
use crate::confidence::ConfidenceScorer;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::Result;
use crate::merchant::MerchantResolver;
use crate::models::{CanonicalMerchant, CompositeRule, Rule, Transaction};

/// Which rule produced a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum RuleRef {
    Atomic(i64),
    Composite(i64),
}

impl RuleRef {
    pub fn id(&self) -> i64 {
        match self {
            Self::Atomic(id) | Self::Composite(id) => *id,
        }
    }

    fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }
}

impl fmt::Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atomic(id) => write!(f, "rule #{}", id),
            Self::Composite(id) => write!(f, "composite #{}", id),
        }
    }
}

/// One rule that matched a transaction
#[derive(Debug, Clone, Serialize)]
pub struct RuleMatch {
    pub rule: RuleRef,
    pub category_id: i64,
    pub confidence: f64,
    /// `type:value` for atomic rules, the boolean description for composites
    pub label: String,
}

/// The chosen category for a transaction
#[derive(Debug, Clone, Serialize)]
pub struct CategoryDecision {
    pub category_id: i64,
    pub rule: RuleRef,
    pub confidence: f64,
    pub merchant: Option<CanonicalMerchant>,
    pub explanation: String,
}

fn rank(a: &RuleMatch, b: &RuleMatch) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.rule.is_composite().cmp(&a.rule.is_composite()))
        .then_with(|| a.rule.id().cmp(&b.rule.id()))
}

/// Picks a category for transactions using the rule store
pub struct Categorizer<'a> {
    db: &'a Database,
    resolver: MerchantResolver<'a>,
    scorer: ConfidenceScorer,
    cache: Option<Arc<InMemoryRuleCache>>,
}

impl<'a> Categorizer<'a> {
    pub fn new(db: &'a Database, config: &EngineConfig) -> Self {
        Self {
            db,
            resolver: MerchantResolver::new(db, config.merchants.clone()),
            scorer: ConfidenceScorer::new(config.confidence.clone()),
            cache: None,
        }
    }

    /// Read active rules and canonical merchants through a cache
    ///
    /// The cache must also be registered on the database (`Database::with_cache`)
    /// so writes invalidate it.
    pub fn with_cache(mut self, cache: Arc<InMemoryRuleCache>) -> Self {
        self.resolver = self.resolver.with_cache(Arc::clone(&cache));
        self.cache = Some(cache);
        self
    }

    fn active_rules(&self) -> Result<Arc<Vec<Rule>>> {
        if let Some(cache) = &self.cache {
            if let Some(rules) = cache.get_rules(&CacheKey::ActiveRules) {
                return Ok(rules);
            }
            return Ok(cache.put_rules(CacheKey::ActiveRules, self.db.list_rules(true)?));
        }
        Ok(Arc::new(self.db.list_rules(true)?))
    }

    fn active_composites(&self) -> Result<Arc<Vec<CompositeRule>>> {
        if let Some(cache) = &self.cache {
            if let Some(composites) = cache.get_composites(&CacheKey::ActiveComposites) {
                return Ok(composites);
            }
            return Ok(cache.put_composites(
                CacheKey::ActiveComposites,
                self.db.list_composites(true)?,
            ));
        }
        Ok(Arc::new(self.db.list_composites(true)?))
    }

    fn evaluate(&self, tx: &Transaction, merchant: Option<&CanonicalMerchant>) -> Result<Vec<RuleMatch>> {
        // Also try the canonical display name, so a rule written against
        // "Blue Bottle" catches "SQ *BLUEBOTTLE 0042" once it is resolved.
        // Composites see both views at once so NOT and blacklists stay exact.
        let canonical_tx = merchant
            .filter(|m| tx.merchant() != Some(m.display_name.as_str()))
            .map(|m| Transaction {
                merchant_name: Some(m.display_name.clone()),
                ..tx.clone()
            });
        let candidates: Vec<&Transaction> = std::iter::once(tx).chain(canonical_tx.as_ref()).collect();

        let mut matches = Vec::new();

        let rules = self.active_rules()?;
        for rule in rules.iter() {
            if candidates.iter().any(|t| rule.matches(*t)) {
                let confidence = self.scorer.rule_confidence(rule);
                debug!("Rule {} ({}) matched, confidence {:.2}", rule.id, rule.label(), confidence);
                matches.push(RuleMatch {
                    rule: RuleRef::Atomic(rule.id),
                    category_id: rule.category_id,
                    confidence,
                    label: rule.label(),
                });
            }
        }

        let composites = self.active_composites()?;
        if !composites.is_empty() {
            let member_ids: BTreeSet<i64> = composites
                .iter()
                .flat_map(|c| c.member_ids.iter().copied())
                .collect();
            let members = self
                .db
                .get_rules_by_ids(&member_ids.into_iter().collect::<Vec<_>>())?;

            for composite in composites.iter() {
                if composite.matches_views(&members, &candidates) {
                    let confidence = self
                        .scorer
                        .composite_confidence(composite, &composite.resolve_members(&members));
                    debug!(
                        "Composite {} '{}' matched, confidence {:.2}",
                        composite.id, composite.name, confidence
                    );
                    matches.push(RuleMatch {
                        rule: RuleRef::Composite(composite.id),
                        category_id: composite.category_id,
                        confidence,
                        label: composite.description(&members),
                    });
                }
            }
        }

        matches.sort_by(rank);
        Ok(matches)
    }

    /// Every rule that matches, best first (read-only: no merchant resolution)
    pub fn matching_rules(&self, tx: &Transaction) -> Result<Vec<RuleMatch>> {
        self.evaluate(tx, None)
    }

    /// Choose a category for the transaction, if any rule matches
    pub fn categorize(&self, tx: &Transaction) -> Result<Option<CategoryDecision>> {
        let merchant = match tx.merchant() {
            Some(raw) => self.resolver.resolve(raw)?,
            None => None,
        };

        let Some(best) = self.evaluate(tx, merchant.as_ref())?.into_iter().next() else {
            debug!("No rule matched transaction {:?}", tx.id);
            return Ok(None);
        };

        let explanation = match &merchant {
            Some(m) => format!(
                "{} matched {} for merchant '{}' (confidence {:.2})",
                best.rule, best.label, m.display_name, best.confidence
            ),
            None => format!(
                "{} matched {} (confidence {:.2})",
                best.rule, best.label, best.confidence
            ),
        };

        Ok(Some(CategoryDecision {
            category_id: best.category_id,
            rule: best.rule,
            confidence: best.confidence,
            merchant,
            explanation,
        }))
    }
}
