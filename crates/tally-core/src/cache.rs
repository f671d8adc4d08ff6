//! Rule cache boundary and explicit invalidation
//!
//! Reads of the active rule set are cacheable; every committed write to the
//! store emits a [`StoreEvent`], and the [`CacheInvalidator`] maps that event
//! to the cache keys it makes stale. Invalidation failures are logged and
//! swallowed: a stale cache must never fail a write that already committed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::matching::pattern_key;
use crate::models::{CanonicalMerchant, CompositeRule, PatternType, Rule};

/// A cacheable read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    ActiveRules,
    ActiveComposites,
    /// Rules belonging to one category
    Category(i64),
    /// Rules with a given type and pattern key
    Pattern(PatternType, String),
    /// Canonical merchants scanned by similarity search
    Merchants,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActiveRules => write!(f, "rules:active"),
            Self::ActiveComposites => write!(f, "composites:active"),
            Self::Category(id) => write!(f, "rules:category:{}", id),
            Self::Pattern(pt, key) => write!(f, "rules:pattern:{}:{}", pt, key),
            Self::Merchants => write!(f, "merchants"),
        }
    }
}

/// A committed store mutation
#[derive(Debug, Clone)]
pub enum StoreEvent {
    RuleCreated {
        category_id: i64,
        pattern_type: PatternType,
        pattern_value: String,
    },
    /// Pattern, weight, active flag or usage counters changed
    RuleUpdated {
        category_id: i64,
        pattern_type: PatternType,
        pattern_value: String,
    },
    RuleDeleted {
        category_id: i64,
        pattern_type: PatternType,
        pattern_value: String,
    },
    CompositeChanged {
        category_id: i64,
    },
    MerchantChanged,
}

impl StoreEvent {
    pub(crate) fn rule_created(rule: &Rule) -> Self {
        Self::RuleCreated {
            category_id: rule.category_id,
            pattern_type: rule.pattern_type,
            pattern_value: rule.pattern_value.clone(),
        }
    }

    pub(crate) fn rule_updated(rule: &Rule) -> Self {
        Self::RuleUpdated {
            category_id: rule.category_id,
            pattern_type: rule.pattern_type,
            pattern_value: rule.pattern_value.clone(),
        }
    }

    pub(crate) fn rule_deleted(rule: &Rule) -> Self {
        Self::RuleDeleted {
            category_id: rule.category_id,
            pattern_type: rule.pattern_type,
            pattern_value: rule.pattern_value.clone(),
        }
    }

    /// Keys made stale by this event
    pub fn stale_keys(&self) -> Vec<CacheKey> {
        match self {
            Self::RuleCreated {
                category_id,
                pattern_type,
                pattern_value,
            }
            | Self::RuleUpdated {
                category_id,
                pattern_type,
                pattern_value,
            }
            | Self::RuleDeleted {
                category_id,
                pattern_type,
                pattern_value,
            } => vec![
                CacheKey::ActiveRules,
                // Composites resolve members from the rule set
                CacheKey::ActiveComposites,
                CacheKey::Category(*category_id),
                CacheKey::Pattern(*pattern_type, pattern_key(*pattern_type, pattern_value)),
            ],
            Self::CompositeChanged { category_id } => vec![
                CacheKey::ActiveComposites,
                CacheKey::Category(*category_id),
            ],
            Self::MerchantChanged => vec![CacheKey::Merchants],
        }
    }
}

/// External cache of rule reads
pub trait RuleCache: Send + Sync {
    /// Drop whatever is cached under `key`
    fn invalidate(&self, key: &CacheKey) -> Result<()>;
}

#[derive(Debug, Clone)]
enum CachedValue {
    Rules(Arc<Vec<Rule>>),
    Composites(Arc<Vec<CompositeRule>>),
    Merchants(Arc<Vec<CanonicalMerchant>>),
}

/// Process-local rule cache
#[derive(Debug, Default)]
pub struct InMemoryRuleCache {
    entries: Mutex<HashMap<CacheKey, CachedValue>>,
}

impl InMemoryRuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_rules(&self, key: &CacheKey) -> Option<Arc<Vec<Rule>>> {
        let entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(CachedValue::Rules(rules)) => Some(Arc::clone(rules)),
            _ => None,
        }
    }

    pub fn put_rules(&self, key: CacheKey, rules: Vec<Rule>) -> Arc<Vec<Rule>> {
        let rules = Arc::new(rules);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, CachedValue::Rules(Arc::clone(&rules)));
        }
        rules
    }

    pub fn get_composites(&self, key: &CacheKey) -> Option<Arc<Vec<CompositeRule>>> {
        let entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(CachedValue::Composites(composites)) => Some(Arc::clone(composites)),
            _ => None,
        }
    }

    pub fn put_composites(&self, key: CacheKey, composites: Vec<CompositeRule>) -> Arc<Vec<CompositeRule>> {
        let composites = Arc::new(composites);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, CachedValue::Composites(Arc::clone(&composites)));
        }
        composites
    }

    pub fn get_merchants(&self) -> Option<Arc<Vec<CanonicalMerchant>>> {
        let entries = self.entries.lock().ok()?;
        match entries.get(&CacheKey::Merchants) {
            Some(CachedValue::Merchants(merchants)) => Some(Arc::clone(merchants)),
            _ => None,
        }
    }

    pub fn put_merchants(&self, merchants: Vec<CanonicalMerchant>) -> Arc<Vec<CanonicalMerchant>> {
        let merchants = Arc::new(merchants);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(CacheKey::Merchants, CachedValue::Merchants(Arc::clone(&merchants)));
        }
        merchants
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RuleCache for InMemoryRuleCache {
    fn invalidate(&self, key: &CacheKey) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::InvalidData("rule cache lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Fans store events out to registered caches
#[derive(Clone, Default)]
pub struct CacheInvalidator {
    caches: Vec<Arc<dyn RuleCache>>,
}

impl fmt::Debug for CacheInvalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheInvalidator")
            .field("caches", &self.caches.len())
            .finish()
    }
}

impl CacheInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, cache: Arc<dyn RuleCache>) {
        self.caches.push(cache);
    }

    /// Invalidate every key the event makes stale, in every registered cache
    pub fn dispatch(&self, event: &StoreEvent) {
        if self.caches.is_empty() {
            return;
        }
        for key in event.stale_keys() {
            for cache in &self.caches {
                match cache.invalidate(&key) {
                    Ok(()) => debug!("Invalidated cache key {}", key),
                    Err(e) => warn!("Failed to invalidate cache key {}: {}", key, e),
                }
            }
        }
    }
}
