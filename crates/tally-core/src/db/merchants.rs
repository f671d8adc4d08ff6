//! Canonical merchant and alias operations

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::info;

use super::{parse_datetime, Database};
use crate::cache::StoreEvent;
use crate::error::{Error, Result};
use crate::models::{CanonicalMerchant, MerchantAlias};

const MERCHANT_COLUMNS: &str =
    "m.id, m.normalized_name, m.display_name, m.category_hint, m.usage_count, m.created_at";

fn row_to_merchant(row: &Row) -> rusqlite::Result<CanonicalMerchant> {
    let created_at_str: String = row.get(5)?;
    Ok(CanonicalMerchant {
        id: row.get(0)?,
        normalized_name: row.get(1)?,
        display_name: row.get(2)?,
        category_hint: row.get(3)?,
        usage_count: row.get(4)?,
        created_at: parse_datetime(&created_at_str),
    })
}

fn fetch_merchant(conn: &Connection, id: i64) -> Result<Option<CanonicalMerchant>> {
    let merchant = conn
        .query_row(
            &format!("SELECT {} FROM merchants m WHERE m.id = ?", MERCHANT_COLUMNS),
            params![id],
            row_to_merchant,
        )
        .optional()?;
    Ok(merchant)
}

impl Database {
    /// Get a canonical merchant by ID
    pub fn get_merchant(&self, id: i64) -> Result<Option<CanonicalMerchant>> {
        let conn = self.conn()?;
        fetch_merchant(&conn, id)
    }

    /// Merchant that already owns this exact raw spelling
    pub fn find_merchant_by_alias(&self, raw_name: &str) -> Result<Option<CanonicalMerchant>> {
        let conn = self.conn()?;
        let merchant = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM merchants m
                    INNER JOIN merchant_aliases a ON a.merchant_id = m.id
                    WHERE a.raw_name = ?
                    "#,
                    MERCHANT_COLUMNS
                ),
                params![raw_name],
                row_to_merchant,
            )
            .optional()?;
        Ok(merchant)
    }

    /// Merchant whose canonical name, or one of whose aliases, equals the
    /// normalized name (case-insensitive)
    pub fn find_merchant_by_normalized(&self, normalized: &str) -> Result<Option<CanonicalMerchant>> {
        let conn = self.conn()?;

        let canonical = conn
            .query_row(
                &format!(
                    "SELECT {} FROM merchants m WHERE m.normalized_name = ?",
                    MERCHANT_COLUMNS
                ),
                params![normalized],
                row_to_merchant,
            )
            .optional()?;
        if canonical.is_some() {
            return Ok(canonical);
        }

        let by_alias = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {} FROM merchants m
                    INNER JOIN merchant_aliases a ON a.merchant_id = m.id
                    WHERE lower(a.raw_name) = lower(?)
                    ORDER BY a.confidence DESC, a.id
                    LIMIT 1
                    "#,
                    MERCHANT_COLUMNS
                ),
                params![normalized],
                row_to_merchant,
            )
            .optional()?;
        Ok(by_alias)
    }

    /// List canonical merchants, most used first
    pub fn list_merchants(&self) -> Result<Vec<CanonicalMerchant>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM merchants m ORDER BY m.usage_count DESC, m.normalized_name",
            MERCHANT_COLUMNS
        ))?;
        let merchants = stmt
            .query_map([], row_to_merchant)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(merchants)
    }

    /// Create a canonical merchant unless the normalized name is taken,
    /// returning whichever row owns the name
    pub fn insert_merchant_if_absent(
        &self,
        normalized_name: &str,
        display_name: &str,
    ) -> Result<(CanonicalMerchant, bool)> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT INTO merchants (normalized_name, display_name)
            VALUES (?, ?)
            ON CONFLICT(normalized_name) DO NOTHING
            "#,
            params![normalized_name, display_name],
        )?;

        let merchant = conn.query_row(
            &format!(
                "SELECT {} FROM merchants m WHERE m.normalized_name = ?",
                MERCHANT_COLUMNS
            ),
            params![normalized_name],
            row_to_merchant,
        )?;

        if inserted > 0 {
            info!(
                "Created canonical merchant {} '{}'",
                merchant.id, merchant.display_name
            );
            self.notify(StoreEvent::MerchantChanged);
        }
        Ok((merchant, inserted > 0))
    }

    /// Record a raw spelling for a merchant; false if the spelling was already known
    pub fn add_merchant_alias(&self, merchant_id: i64, raw_name: &str, confidence: f64) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT INTO merchant_aliases (merchant_id, raw_name, confidence)
            VALUES (?, ?, ?)
            ON CONFLICT(raw_name) DO NOTHING
            "#,
            params![merchant_id, raw_name, confidence.clamp(0.0, 1.0)],
        )?;
        if inserted > 0 {
            self.notify(StoreEvent::MerchantChanged);
        }
        Ok(inserted > 0)
    }

    /// Aliases recorded for a merchant
    pub fn list_aliases(&self, merchant_id: i64) -> Result<Vec<MerchantAlias>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, merchant_id, raw_name, confidence, created_at
            FROM merchant_aliases
            WHERE merchant_id = ?
            ORDER BY confidence DESC, raw_name
            "#,
        )?;
        let aliases = stmt
            .query_map(params![merchant_id], |row| {
                let created_at_str: String = row.get(4)?;
                Ok(MerchantAlias {
                    id: row.get(0)?,
                    merchant_id: row.get(1)?,
                    raw_name: row.get(2)?,
                    confidence: row.get(3)?,
                    created_at: parse_datetime(&created_at_str),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(aliases)
    }

    /// Atomically bump a merchant's usage count
    pub fn increment_merchant_usage(&self, id: i64) -> Result<CanonicalMerchant> {
        let conn = self.conn()?;
        let merchant = conn
            .query_row(
                r#"
                UPDATE merchants SET usage_count = usage_count + 1
                WHERE id = ?
                RETURNING id, normalized_name, display_name, category_hint, usage_count, created_at
                "#,
                params![id],
                row_to_merchant,
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("merchant {}", id)))?;
        Ok(merchant)
    }

    /// Set or clear the category hint
    pub fn set_merchant_category_hint(&self, id: i64, category_id: Option<i64>) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE merchants SET category_hint = ? WHERE id = ?",
            params![category_id, id],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("merchant {}", id)));
        }
        self.notify(StoreEvent::MerchantChanged);
        Ok(())
    }

    /// Merge `source_id` into `target_id`
    ///
    /// Usage counts are summed, aliases re-pointed, the longer display name and
    /// the first available category hint kept, and the source deleted. The
    /// source's normalized name becomes an alias of the target. Both rows are
    /// read under the write lock, so concurrent usage increments are not lost.
    pub fn merge_merchants(&self, source_id: i64, target_id: i64) -> Result<CanonicalMerchant> {
        if source_id == target_id {
            return Err(Error::validation("Cannot merge a merchant into itself"));
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let source = fetch_merchant(&tx, source_id)?
            .ok_or_else(|| Error::NotFound(format!("merchant {}", source_id)))?;
        let target = fetch_merchant(&tx, target_id)?
            .ok_or_else(|| Error::NotFound(format!("merchant {}", target_id)))?;

        let display_name = if source.display_name.chars().count() > target.display_name.chars().count() {
            &source.display_name
        } else {
            &target.display_name
        };
        let category_hint = target.category_hint.or(source.category_hint);

        tx.execute(
            "UPDATE merchant_aliases SET merchant_id = ? WHERE merchant_id = ?",
            params![target_id, source_id],
        )?;
        tx.execute("DELETE FROM merchants WHERE id = ?", params![source_id])?;
        tx.execute(
            r#"
            INSERT INTO merchant_aliases (merchant_id, raw_name, confidence)
            VALUES (?, ?, 1.0)
            ON CONFLICT(raw_name) DO NOTHING
            "#,
            params![target_id, source.normalized_name],
        )?;
        tx.execute(
            r#"
            UPDATE merchants
            SET usage_count = usage_count + ?, display_name = ?, category_hint = ?
            WHERE id = ?
            "#,
            params![source.usage_count, display_name, category_hint, target_id],
        )?;
        tx.commit()?;

        info!(
            "Merged merchant {} '{}' into {} '{}'",
            source_id, source.display_name, target_id, target.display_name
        );
        self.notify(StoreEvent::MerchantChanged);

        self.get_merchant(target_id)?
            .ok_or_else(|| Error::NotFound(format!("merchant {}", target_id)))
    }
}
