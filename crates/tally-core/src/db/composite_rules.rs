//! Composite rule operations

use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use super::{parse_datetime, parse_json, Database};
use crate::cache::StoreEvent;
use crate::error::{Error, Result};
use crate::models::{CompositeOperator, CompositeRule, NewCompositeRule, Rule, UsageStats};
use crate::validation;

const COMPOSITE_COLUMNS: &str = "id, category_id, name, operator, member_ids, conditions, \
     confidence_weight, usage_count, success_count, success_rate, active, created_at, updated_at";

fn row_to_composite(row: &Row) -> rusqlite::Result<CompositeRule> {
    let operator_str: String = row.get(3)?;
    let operator = operator_str.parse::<CompositeOperator>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
    })?;
    let member_ids_json: String = row.get(4)?;
    let conditions_json: String = row.get(5)?;
    let created_at_str: String = row.get(11)?;
    let updated_at_str: String = row.get(12)?;

    Ok(CompositeRule {
        id: row.get(0)?,
        category_id: row.get(1)?,
        name: row.get(2)?,
        operator,
        member_ids: parse_json("composite member_ids", &member_ids_json),
        conditions: parse_json("composite conditions", &conditions_json),
        confidence_weight: row.get(6)?,
        stats: UsageStats {
            usage_count: row.get(7)?,
            success_count: row.get(8)?,
            success_rate: row.get(9)?,
        },
        active: row.get(10)?,
        created_at: parse_datetime(&created_at_str),
        updated_at: parse_datetime(&updated_at_str),
    })
}

impl Database {
    /// Create a composite rule after validating members and conditions
    pub fn create_composite(&self, composite: &NewCompositeRule) -> Result<CompositeRule> {
        let members = self.get_rules_by_ids(&composite.member_ids)?;
        validation::validate_new_composite(composite, &members)?;

        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO composite_rules (
                category_id, name, operator, member_ids, conditions, confidence_weight
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
            params![
                composite.category_id,
                composite.name.trim(),
                composite.operator.as_str(),
                serde_json::to_string(&composite.member_ids)?,
                serde_json::to_string(&composite.conditions)?,
                composite.confidence_weight,
            ],
        )?;
        let id = conn.last_insert_rowid();

        let created = self.require_composite(id)?;
        info!(
            "Created composite rule {} '{}' ({} members) for category {}",
            created.id,
            created.name,
            created.member_ids.len(),
            created.category_id
        );
        self.notify(StoreEvent::CompositeChanged {
            category_id: created.category_id,
        });
        Ok(created)
    }

    /// Get a composite rule by ID
    pub fn get_composite(&self, id: i64) -> Result<Option<CompositeRule>> {
        let conn = self.conn()?;
        let composite = conn
            .query_row(
                &format!("SELECT {} FROM composite_rules WHERE id = ?", COMPOSITE_COLUMNS),
                params![id],
                row_to_composite,
            )
            .optional()?;
        Ok(composite)
    }

    fn require_composite(&self, id: i64) -> Result<CompositeRule> {
        self.get_composite(id)?
            .ok_or_else(|| Error::NotFound(format!("composite rule {}", id)))
    }

    /// List composite rules, optionally only active ones
    pub fn list_composites(&self, active_only: bool) -> Result<Vec<CompositeRule>> {
        let conn = self.conn()?;
        let sql = if active_only {
            format!(
                "SELECT {} FROM composite_rules WHERE active = 1 ORDER BY id",
                COMPOSITE_COLUMNS
            )
        } else {
            format!("SELECT {} FROM composite_rules ORDER BY id", COMPOSITE_COLUMNS)
        };
        let mut stmt = conn.prepare(&sql)?;
        let composites = stmt
            .query_map([], row_to_composite)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(composites)
    }

    /// Resolve a composite's members; dangling ids are dropped
    pub fn composite_members(&self, composite: &CompositeRule) -> Result<Vec<Rule>> {
        let rules = self.get_rules_by_ids(&composite.member_ids)?;
        Ok(composite.resolve_members(&rules).into_iter().cloned().collect())
    }

    fn save_members(&self, composite: &CompositeRule) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE composite_rules SET member_ids = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![serde_json::to_string(&composite.member_ids)?, composite.id],
        )?;
        self.notify(StoreEvent::CompositeChanged {
            category_id: composite.category_id,
        });
        Ok(())
    }

    /// Add a member rule (no-op if already a member)
    pub fn add_composite_member(&self, id: i64, rule_id: i64) -> Result<CompositeRule> {
        let mut composite = self.require_composite(id)?;
        if !composite.add_member(rule_id) {
            debug!("Rule {} is already a member of composite {}", rule_id, id);
            return Ok(composite);
        }

        let members = self.get_rules_by_ids(&composite.member_ids)?;
        validation::validate_members(composite.category_id, &composite.member_ids, &members)?;

        self.save_members(&composite)?;
        self.require_composite(id)
    }

    /// Remove a member rule (no-op if not a member)
    ///
    /// Removing the last member is rejected: a composite needs at least one.
    pub fn remove_composite_member(&self, id: i64, rule_id: i64) -> Result<CompositeRule> {
        let mut composite = self.require_composite(id)?;
        if !composite.remove_member(rule_id) {
            debug!("Rule {} is not a member of composite {}", rule_id, id);
            return Ok(composite);
        }
        if composite.member_ids.is_empty() {
            return Err(Error::validation(format!(
                "Cannot remove the last member of composite rule {}",
                id
            )));
        }

        self.save_members(&composite)?;
        self.require_composite(id)
    }

    /// Enable or disable a composite rule
    pub fn set_composite_active(&self, id: i64, active: bool) -> Result<CompositeRule> {
        let composite = self.require_composite(id)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE composite_rules SET active = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
            params![active, id],
        )?;
        self.notify(StoreEvent::CompositeChanged {
            category_id: composite.category_id,
        });
        self.require_composite(id)
    }

    /// Delete a composite rule
    pub fn delete_composite(&self, id: i64) -> Result<bool> {
        let Some(composite) = self.get_composite(id)? else {
            return Ok(false);
        };
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM composite_rules WHERE id = ?", params![id])?;
        if deleted > 0 {
            info!("Deleted composite rule {} '{}'", id, composite.name);
            self.notify(StoreEvent::CompositeChanged {
                category_id: composite.category_id,
            });
        }
        Ok(deleted > 0)
    }

    /// Record one evaluated outcome for a composite (atomic, like rules)
    pub fn record_composite_usage(&self, id: i64, successful: bool) -> Result<UsageStats> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                UPDATE composite_rules
                SET usage_count = usage_count + 1,
                    success_count = success_count + ?1,
                    success_rate = CAST(success_count + ?1 AS REAL) / (usage_count + 1),
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = ?2
                RETURNING usage_count, success_count, success_rate, category_id
                "#,
                params![i64::from(successful), id],
                |row| {
                    Ok((
                        UsageStats {
                            usage_count: row.get(0)?,
                            success_count: row.get(1)?,
                            success_rate: row.get(2)?,
                        },
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let (stats, category_id) =
            row.ok_or_else(|| Error::NotFound(format!("composite rule {}", id)))?;
        self.notify(StoreEvent::CompositeChanged { category_id });
        Ok(stats)
    }
}
