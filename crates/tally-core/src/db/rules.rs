//! Atomic rule operations

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{parse_datetime, parse_json, Database};
use crate::cache::StoreEvent;
use crate::confidence::DeactivationConfig;
use crate::error::{Error, Result};
use crate::matching::pattern_key;
use crate::models::{NewRule, PatternType, Rule, RuleUpdate, UsageStats};
use crate::validation;

const RULE_COLUMNS: &str = "id, category_id, pattern_type, pattern_value, confidence_weight, \
     usage_count, success_count, success_rate, active, user_created, metadata, \
     created_at, updated_at";

fn row_to_rule(row: &Row) -> rusqlite::Result<Rule> {
    let pattern_type_str: String = row.get(2)?;
    let pattern_type = pattern_type_str.parse::<PatternType>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    let metadata_json: String = row.get(10)?;
    let created_at_str: String = row.get(11)?;
    let updated_at_str: String = row.get(12)?;

    Ok(Rule {
        id: row.get(0)?,
        category_id: row.get(1)?,
        pattern_type,
        pattern_value: row.get(3)?,
        confidence_weight: row.get(4)?,
        stats: UsageStats {
            usage_count: row.get(5)?,
            success_count: row.get(6)?,
            success_rate: row.get(7)?,
        },
        active: row.get(8)?,
        user_created: row.get(9)?,
        metadata: parse_json("rule metadata", &metadata_json),
        created_at: parse_datetime(&created_at_str),
        updated_at: parse_datetime(&updated_at_str),
    })
}

fn query_rules(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Rule>> {
    let mut stmt = conn.prepare(sql)?;
    let rules = stmt
        .query_map(params, row_to_rule)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

fn duplicate_rule_error(rule: &NewRule) -> Error {
    Error::validation(format!(
        "A {} rule for '{}' already exists in category {}",
        rule.pattern_type, rule.pattern_value, rule.category_id
    ))
}

pub(super) fn fetch_rule(conn: &Connection, id: i64) -> Result<Option<Rule>> {
    let rule = conn
        .query_row(
            &format!("SELECT {} FROM rules WHERE id = ?", RULE_COLUMNS),
            params![id],
            row_to_rule,
        )
        .optional()?;
    Ok(rule)
}

/// Validate and insert; `None` when an equivalent rule already exists
pub(super) fn insert_rule_if_absent(conn: &Connection, rule: &NewRule) -> Result<Option<i64>> {
    validation::validate_new_rule(rule)?;
    let metadata_json = serde_json::to_string(&rule.metadata)?;

    let id: Option<i64> = conn
        .query_row(
            r#"
            INSERT INTO rules (
                category_id, pattern_type, pattern_value, pattern_key,
                confidence_weight, user_created, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(category_id, pattern_type, pattern_key) DO NOTHING
            RETURNING id
            "#,
            params![
                rule.category_id,
                rule.pattern_type.as_str(),
                rule.pattern_value.trim(),
                pattern_key(rule.pattern_type, &rule.pattern_value),
                rule.confidence_weight,
                rule.user_created,
                metadata_json,
            ],
            |row| row.get(0),
        )
        .optional()?;

    if id.is_none() {
        debug!(
            "Rule {}:{} already exists in category {}",
            rule.pattern_type, rule.pattern_value, rule.category_id
        );
    }
    Ok(id)
}

/// Bump a rule's counters in one statement; `None` if the rule is gone
///
/// SQLite evaluates every SET expression against the pre-update row, hence
/// the `+ 1` in the rate.
pub(super) fn increment_rule_usage(
    conn: &Connection,
    id: i64,
    successful: bool,
) -> Result<Option<(UsageStats, StoreEvent)>> {
    let row = conn
        .query_row(
            r#"
            UPDATE rules
            SET usage_count = usage_count + 1,
                success_count = success_count + ?1,
                success_rate = CAST(success_count + ?1 AS REAL) / (usage_count + 1),
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?2
            RETURNING usage_count, success_count, success_rate,
                      category_id, pattern_type, pattern_value
            "#,
            params![i64::from(successful), id],
            |row| {
                let pattern_type_str: String = row.get(4)?;
                let pattern_type = pattern_type_str.parse::<PatternType>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, e.into())
                })?;
                Ok((
                    UsageStats {
                        usage_count: row.get(0)?,
                        success_count: row.get(1)?,
                        success_rate: row.get(2)?,
                    },
                    StoreEvent::RuleUpdated {
                        category_id: row.get(3)?,
                        pattern_type,
                        pattern_value: row.get(5)?,
                    },
                ))
            },
        )
        .optional()?;

    if let Some((stats, _)) = &row {
        debug!(
            "Rule {} usage recorded (success: {}): {}/{}",
            id, successful, stats.success_count, stats.usage_count
        );
    }
    Ok(row)
}

/// Conditional deactivation; true when this statement flipped the rule
pub(super) fn deactivate_if_poor(
    conn: &Connection,
    id: i64,
    config: &DeactivationConfig,
) -> Result<bool> {
    let changed = conn.execute(
        r#"
        UPDATE rules
        SET active = 0, updated_at = CURRENT_TIMESTAMP
        WHERE id = ? AND active = 1 AND user_created = 0
          AND usage_count >= ? AND success_rate < ?
        "#,
        params![id, config.min_usage, config.min_success_rate],
    )?;
    Ok(changed > 0)
}

impl Database {
    /// Create a rule after validating it
    ///
    /// Fails with a validation error if the category already has a rule with
    /// the same type and normalized pattern.
    pub fn create_rule(&self, rule: &NewRule) -> Result<Rule> {
        self.create_rule_if_absent(rule)?
            .ok_or_else(|| duplicate_rule_error(rule))
    }

    /// Create a rule unless an equivalent one exists; `None` means it existed
    ///
    /// Safe under concurrent callers: the uniqueness check and the insert are
    /// one statement.
    pub fn create_rule_if_absent(&self, rule: &NewRule) -> Result<Option<Rule>> {
        let conn = self.conn()?;
        let Some(id) = insert_rule_if_absent(&conn, rule)? else {
            return Ok(None);
        };

        let created = fetch_rule(&conn, id)?
            .ok_or_else(|| Error::NotFound(format!("rule {}", id)))?;
        self.rule_created(&created);
        Ok(Some(created))
    }

    /// Log and dispatch a committed rule insert
    pub(super) fn rule_created(&self, rule: &Rule) {
        info!(
            "Created rule {} ({}) for category {}",
            rule.id,
            rule.label(),
            rule.category_id
        );
        self.notify(StoreEvent::rule_created(rule));
    }

    /// Get a rule by ID
    pub fn get_rule(&self, id: i64) -> Result<Option<Rule>> {
        let conn = self.conn()?;
        fetch_rule(&conn, id)
    }

    /// Find the rule for (category, type, pattern), comparing normalized patterns
    pub fn find_rule(
        &self,
        category_id: i64,
        pattern_type: PatternType,
        pattern_value: &str,
    ) -> Result<Option<Rule>> {
        let conn = self.conn()?;
        let rule = conn
            .query_row(
                &format!(
                    "SELECT {} FROM rules WHERE category_id = ? AND pattern_type = ? AND pattern_key = ?",
                    RULE_COLUMNS
                ),
                params![
                    category_id,
                    pattern_type.as_str(),
                    pattern_key(pattern_type, pattern_value)
                ],
                row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    /// All rules with the given type and pattern, across categories
    pub fn find_rules_by_pattern(
        &self,
        pattern_type: PatternType,
        pattern_value: &str,
    ) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        query_rules(
            &conn,
            &format!(
                "SELECT {} FROM rules WHERE pattern_type = ? AND pattern_key = ? ORDER BY id",
                RULE_COLUMNS
            ),
            params![pattern_type.as_str(), pattern_key(pattern_type, pattern_value)],
        )
    }

    /// List rules, optionally only active ones
    pub fn list_rules(&self, active_only: bool) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        let sql = if active_only {
            format!("SELECT {} FROM rules WHERE active = 1 ORDER BY id", RULE_COLUMNS)
        } else {
            format!("SELECT {} FROM rules ORDER BY id", RULE_COLUMNS)
        };
        query_rules(&conn, &sql, [])
    }

    /// Rules belonging to one category
    pub fn list_rules_for_category(&self, category_id: i64) -> Result<Vec<Rule>> {
        let conn = self.conn()?;
        query_rules(
            &conn,
            &format!(
                "SELECT {} FROM rules WHERE category_id = ? ORDER BY id",
                RULE_COLUMNS
            ),
            params![category_id],
        )
    }

    /// Bulk lookup by id; ids that no longer exist are silently skipped
    pub fn get_rules_by_ids(&self, ids: &[i64]) -> Result<Vec<Rule>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; ids.len()].join(", ");
        query_rules(
            &conn,
            &format!(
                "SELECT {} FROM rules WHERE id IN ({}) ORDER BY id",
                RULE_COLUMNS, placeholders
            ),
            params_from_iter(ids.iter()),
        )
    }

    /// Apply a partial update and return the stored rule
    pub fn update_rule(&self, id: i64, update: &RuleUpdate) -> Result<Rule> {
        let existing = self
            .get_rule(id)?
            .ok_or_else(|| Error::NotFound(format!("rule {}", id)))?;

        let pattern_value = update
            .pattern_value
            .as_deref()
            .map(str::trim)
            .unwrap_or(existing.pattern_value.as_str())
            .to_string();
        let confidence_weight = update.confidence_weight.unwrap_or(existing.confidence_weight);
        let active = update.active.unwrap_or(existing.active);
        let metadata = update.metadata.as_ref().unwrap_or(&existing.metadata);

        validation::validate_pattern(existing.pattern_type, &pattern_value)?;
        validation::validate_weight(confidence_weight)?;

        let conn = self.conn()?;
        let result = conn.execute(
            r#"
            UPDATE rules
            SET pattern_value = ?, pattern_key = ?, confidence_weight = ?, active = ?,
                metadata = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            "#,
            params![
                pattern_value,
                pattern_key(existing.pattern_type, &pattern_value),
                confidence_weight,
                active,
                serde_json::to_string(metadata)?,
                id,
            ],
        );
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(Error::validation(format!(
                    "A {} rule for '{}' already exists in category {}",
                    existing.pattern_type, pattern_value, existing.category_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        // The old pattern's cache entries are stale too
        self.notify(StoreEvent::rule_updated(&existing));
        let updated = self
            .get_rule(id)?
            .ok_or_else(|| Error::NotFound(format!("rule {}", id)))?;
        if updated.pattern_value != existing.pattern_value {
            self.notify(StoreEvent::rule_updated(&updated));
        }
        Ok(updated)
    }

    /// Enable or disable a rule
    pub fn set_rule_active(&self, id: i64, active: bool) -> Result<Rule> {
        self.update_rule(
            id,
            &RuleUpdate {
                active: Some(active),
                ..Default::default()
            },
        )
    }

    /// Delete a rule. Composites referencing it simply lose the member.
    pub fn delete_rule(&self, id: i64) -> Result<bool> {
        let Some(existing) = self.get_rule(id)? else {
            return Ok(false);
        };
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM rules WHERE id = ?", params![id])?;
        if deleted > 0 {
            info!("Deleted rule {} ({})", id, existing.label());
            self.notify(StoreEvent::rule_deleted(&existing));
        }
        Ok(deleted > 0)
    }

    /// Record one evaluated outcome for a rule
    ///
    /// A single statement increments the counters relative to their current
    /// values and returns the post-increment row, so concurrent callers never
    /// lose an update.
    pub fn record_rule_usage(&self, id: i64, successful: bool) -> Result<UsageStats> {
        let conn = self.conn()?;
        let (stats, event) = increment_rule_usage(&conn, id, successful)?
            .ok_or_else(|| Error::NotFound(format!("rule {}", id)))?;
        self.notify(event);
        Ok(stats)
    }

    /// Deactivate the rule if it has enough usage and a poor success rate
    ///
    /// Check and update are one conditional statement. User-created rules are
    /// never deactivated. Returns true when this call deactivated the rule.
    pub fn deactivate_rule_if_poor(&self, id: i64, config: &DeactivationConfig) -> Result<bool> {
        let conn = self.conn()?;
        if !deactivate_if_poor(&conn, id, config)? {
            return Ok(false);
        }
        self.rule_deactivated(id)?;
        Ok(true)
    }

    /// Log and dispatch a committed deactivation
    pub(super) fn rule_deactivated(&self, id: i64) -> Result<()> {
        if let Some(rule) = self.get_rule(id)? {
            info!(
                "Deactivated rule {} ({}): success rate {:.2} over {} uses",
                id,
                rule.label(),
                rule.stats.success_rate,
                rule.stats.usage_count
            );
            self.notify(StoreEvent::rule_updated(&rule));
        }
        Ok(())
    }
}
