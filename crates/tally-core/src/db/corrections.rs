//! Feedback event operations

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{parse_datetime, rules, Database};
use crate::confidence::DeactivationConfig;
use crate::error::{Error, Result};
use crate::feedback::FeedbackOutcome;
use crate::models::{Correction, FeedbackKind, FeedbackSummary, NewCorrection, NewRule};

const CORRECTION_COLUMNS: &str = "id, transaction_id, category_id, rule_id, was_correct, \
     confidence, kind, merchant_name, description, created_at";

fn row_to_correction(row: &Row) -> rusqlite::Result<Correction> {
    let kind_str: String = row.get(6)?;
    let kind = kind_str.parse::<FeedbackKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
    })?;
    let created_at_str: String = row.get(9)?;

    Ok(Correction {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        category_id: row.get(2)?,
        rule_id: row.get(3)?,
        was_correct: row.get(4)?,
        confidence: row.get(5)?,
        kind,
        merchant_name: row.get(7)?,
        description: row.get(8)?,
        created_at: parse_datetime(&created_at_str),
    })
}

fn insert_correction(conn: &Connection, correction: &NewCorrection) -> Result<Correction> {
    conn.execute(
        r#"
        INSERT INTO corrections (
            transaction_id, category_id, rule_id, was_correct, confidence,
            kind, merchant_name, description
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
        params![
            correction.transaction_id,
            correction.category_id,
            correction.rule_id,
            correction.was_correct,
            correction.confidence.filter(|c| c.is_finite()),
            correction.kind.as_str(),
            correction.merchant_name,
            correction.description,
        ],
    )?;

    let id = conn.last_insert_rowid();
    fetch_correction(conn, id)?.ok_or_else(|| Error::NotFound(format!("correction {}", id)))
}

fn fetch_correction(conn: &Connection, id: i64) -> Result<Option<Correction>> {
    let correction = conn
        .query_row(
            &format!("SELECT {} FROM corrections WHERE id = ?", CORRECTION_COLUMNS),
            params![id],
            row_to_correction,
        )
        .optional()?;
    Ok(correction)
}

impl Database {
    /// Persist a feedback event
    pub fn create_correction(&self, correction: &NewCorrection) -> Result<Correction> {
        let conn = self.conn()?;
        insert_correction(&conn, correction)
    }

    /// Get a feedback event by ID
    pub fn get_correction(&self, id: i64) -> Result<Option<Correction>> {
        let conn = self.conn()?;
        fetch_correction(&conn, id)
    }

    /// Apply one feedback event in a single transaction
    ///
    /// Stores the event, counts it against the rule used and retires that rule
    /// if it now performs poorly, then inserts the rule `learn` derives from
    /// the stored event, unless an equivalent rule exists. A rule id that no
    /// longer resolves is stored as NULL and skips the usage update. Nothing
    /// is committed if any step fails.
    pub fn apply_feedback<F>(
        &self,
        correction: &NewCorrection,
        successful: bool,
        deactivation: &DeactivationConfig,
        learn: F,
    ) -> Result<FeedbackOutcome>
    where
        F: FnOnce(&Correction) -> Option<NewRule>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let rule_used = match correction.rule_id {
            Some(id) => {
                let rule = rules::fetch_rule(&tx, id)?;
                if rule.is_none() {
                    debug!("Feedback names rule {} which no longer exists", id);
                }
                rule
            }
            None => None,
        };
        let stored = insert_correction(
            &tx,
            &NewCorrection {
                rule_id: rule_used.as_ref().map(|r| r.id),
                ..correction.clone()
            },
        )?;

        let mut usage = None;
        let mut deactivated = false;
        if let Some(rule) = &rule_used {
            usage = rules::increment_rule_usage(&tx, rule.id, successful)?;
            deactivated = rules::deactivate_if_poor(&tx, rule.id, deactivation)?;
        }

        let created_rule = match learn(&stored) {
            Some(new_rule) => match rules::insert_rule_if_absent(&tx, &new_rule)? {
                Some(id) => rules::fetch_rule(&tx, id)?,
                None => None,
            },
            None => None,
        };

        tx.commit()?;

        let rule_stats = usage.map(|(stats, event)| {
            self.notify(event);
            stats
        });
        if deactivated {
            if let Some(rule) = &rule_used {
                self.rule_deactivated(rule.id)?;
            }
        }
        if let Some(rule) = &created_rule {
            self.rule_created(rule);
        }

        Ok(FeedbackOutcome {
            correction: stored,
            created_rule,
            rule_stats,
            deactivated,
        })
    }

    /// Most recent feedback events first
    pub fn list_corrections(&self, limit: i64) -> Result<Vec<Correction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM corrections ORDER BY created_at DESC, id DESC LIMIT ?",
            CORRECTION_COLUMNS
        ))?;
        let corrections = stmt
            .query_map(params![limit], row_to_correction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(corrections)
    }

    /// Counts per feedback kind plus learned/retired rule totals
    pub fn feedback_summary(&self) -> Result<FeedbackSummary> {
        let conn = self.conn()?;

        let mut summary = FeedbackSummary::default();
        let mut stmt = conn.prepare("SELECT kind, COUNT(*) FROM corrections GROUP BY kind")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for (kind, count) in counts {
            match kind.parse::<FeedbackKind>() {
                Ok(FeedbackKind::Accepted) => summary.accepted = count,
                Ok(FeedbackKind::Rejected) => summary.rejected = count,
                Ok(FeedbackKind::Corrected) => summary.corrected = count,
                Ok(FeedbackKind::Correction) => summary.corrections = count,
                Err(_) => {}
            }
            summary.total += count;
        }

        let correct: i64 = conn.query_row(
            "SELECT COUNT(*) FROM corrections WHERE was_correct = 1",
            [],
            |row| row.get(0),
        )?;
        summary.acceptance_ratio = if summary.total > 0 {
            correct as f64 / summary.total as f64
        } else {
            0.0
        };

        summary.learned_rules = conn.query_row(
            "SELECT COUNT(*) FROM rules WHERE json_extract(metadata, '$.source') = 'feedback'",
            [],
            |row| row.get(0),
        )?;
        summary.inactive_rules =
            conn.query_row("SELECT COUNT(*) FROM rules WHERE active = 0", [], |row| row.get(0))?;

        Ok(summary)
    }
}
