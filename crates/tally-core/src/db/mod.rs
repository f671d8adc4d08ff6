//! Database access layer with connection pooling and migrations
//!
//! This module is organized by domain:
//! - `categories` - Category names
//! - `rules` - Atomic rules and their usage counters
//! - `composite_rules` - Composite rules and member lists
//! - `merchants` - Canonical merchants and raw-name aliases
//! - `corrections` - Feedback events and summaries
//!
//! Every write that commits emits a [`StoreEvent`] to the registered caches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::{info, warn};

use crate::cache::{CacheInvalidator, RuleCache, StoreEvent};
use crate::error::Result;

mod categories;
mod composite_rules;
mod corrections;
mod merchants;
mod rules;


pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// How long a writer waits on a locked database before failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse a SQLite datetime string into a DateTime<Utc>
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    // SQLite stores as "YYYY-MM-DD HH:MM:SS" format
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc())
        .unwrap_or_else(|_| {
            warn!("Unparsable stored timestamp '{}', using now", s);
            Utc::now()
        })
}

/// Parse a JSON column, falling back to the type's default
pub(crate) fn parse_json<T: serde::de::DeserializeOwned + Default>(column: &str, raw: &str) -> T {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("Unparsable {} JSON '{}': {}", column, raw, e);
        T::default()
    })
}

/// Database wrapper with connection pooling
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
    /// Path to the database file
    db_path: String,
    invalidator: CacheInvalidator,
}

impl Database {
    /// Open (or create) the database at `path` and run migrations
    pub fn new(path: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA foreign_keys = ON;")
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self {
            pool,
            db_path: path.to_string(),
            invalidator: CacheInvalidator::new(),
        };
        db.run_migrations()?;

        Ok(db)
    }

    /// Get the path to the database file
    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Create a throwaway database (for testing)
    ///
    /// Uses a unique temporary file rather than `:memory:` because every
    /// pooled connection to `:memory:` would see its own empty database.
    pub fn in_memory() -> Result<Self> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "tally_test_{}_{}.db",
            std::process::id(),
            id
        ));

        // Remove any leftovers from an earlier run
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }

        Self::new(&path.to_string_lossy())
    }

    /// Register a cache to be invalidated on every committed write
    pub fn with_cache(mut self, cache: Arc<dyn RuleCache>) -> Self {
        self.invalidator.register(cache);
        self
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Dispatch a committed mutation to the registered caches
    pub(crate) fn notify(&self, event: StoreEvent) {
        self.invalidator.dispatch(&event);
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            -- WAL mode: readers don't block writers; writers serialize on busy_timeout
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            -- Categories (opaque to the engine; named for the CLI)
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Atomic rules
            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                pattern_type TEXT NOT NULL,                -- merchant, keyword, description, amount_range, regex, time
                pattern_value TEXT NOT NULL,               -- as entered
                pattern_key TEXT NOT NULL,                 -- normalized for duplicate detection
                confidence_weight REAL NOT NULL DEFAULT 1.0,
                usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
                success_count INTEGER NOT NULL DEFAULT 0
                    CHECK (success_count >= 0 AND success_count <= usage_count),
                success_rate REAL NOT NULL DEFAULT 0.0,
                active BOOLEAN NOT NULL DEFAULT 1,
                user_created BOOLEAN NOT NULL DEFAULT 0,
                metadata TEXT NOT NULL DEFAULT '{}',       -- JSON object
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(category_id, pattern_type, pattern_key)
            );

            CREATE INDEX IF NOT EXISTS idx_rules_category ON rules(category_id);
            CREATE INDEX IF NOT EXISTS idx_rules_active ON rules(active);
            CREATE INDEX IF NOT EXISTS idx_rules_pattern ON rules(pattern_type, pattern_key);

            -- Composite rules (members are soft references into rules)
            CREATE TABLE IF NOT EXISTS composite_rules (
                id INTEGER PRIMARY KEY,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                operator TEXT NOT NULL,                    -- AND, OR, NOT
                member_ids TEXT NOT NULL DEFAULT '[]',     -- JSON array of rule ids
                conditions TEXT NOT NULL DEFAULT '{}',     -- JSON object
                confidence_weight REAL NOT NULL DEFAULT 1.0,
                usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
                success_count INTEGER NOT NULL DEFAULT 0
                    CHECK (success_count >= 0 AND success_count <= usage_count),
                success_rate REAL NOT NULL DEFAULT 0.0,
                active BOOLEAN NOT NULL DEFAULT 1,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_composite_rules_category ON composite_rules(category_id);

            -- Canonical merchants
            CREATE TABLE IF NOT EXISTS merchants (
                id INTEGER PRIMARY KEY,
                normalized_name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                display_name TEXT NOT NULL,
                category_hint INTEGER REFERENCES categories(id) ON DELETE SET NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            -- Raw merchant spellings
            CREATE TABLE IF NOT EXISTS merchant_aliases (
                id INTEGER PRIMARY KEY,
                merchant_id INTEGER NOT NULL REFERENCES merchants(id) ON DELETE CASCADE,
                raw_name TEXT NOT NULL UNIQUE,             -- "SQ *BLUE BOTTLE #12"
                confidence REAL NOT NULL DEFAULT 1.0,      -- 1.0 = exact, <1.0 = attached by similarity
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_merchant_aliases_merchant ON merchant_aliases(merchant_id);
            CREATE INDEX IF NOT EXISTS idx_merchant_aliases_lower ON merchant_aliases(lower(raw_name));

            -- Feedback events
            CREATE TABLE IF NOT EXISTS corrections (
                id INTEGER PRIMARY KEY,
                transaction_id INTEGER,                    -- external, not enforced
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                rule_id INTEGER REFERENCES rules(id) ON DELETE SET NULL,
                was_correct BOOLEAN NOT NULL,
                confidence REAL,
                kind TEXT NOT NULL,                        -- accepted, rejected, corrected, correction
                merchant_name TEXT,
                description TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_corrections_rule ON corrections(rule_id);
            CREATE INDEX IF NOT EXISTS idx_corrections_kind ON corrections(kind);
            "#,
        )?;

        info!("Database migrations complete");
        Ok(())
    }
}
