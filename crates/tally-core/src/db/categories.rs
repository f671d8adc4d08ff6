//! Category operations

use rusqlite::params;
use tracing::info;

use super::{parse_datetime, Database};
use crate::error::Result;
use crate::models::Category;

impl Database {
    /// Create a category, or return the existing one with the same name
    pub fn upsert_category(&self, name: &str) -> Result<Category> {
        let conn = self.conn()?;
        let name = name.trim();

        let inserted = conn.execute(
            "INSERT INTO categories (name) VALUES (?) ON CONFLICT(name) DO NOTHING",
            params![name],
        )?;
        if inserted > 0 {
            info!("Created category '{}'", name);
        }

        let category = conn.query_row(
            "SELECT id, name, created_at FROM categories WHERE name = ?",
            params![name],
            |row| {
                let created_at_str: String = row.get(2)?;
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: parse_datetime(&created_at_str),
                })
            },
        )?;

        Ok(category)
    }

    /// Look up a category by id
    pub fn get_category(&self, id: i64) -> Result<Option<Category>> {
        let conn = self.conn()?;
        let category = conn
            .query_row(
                "SELECT id, name, created_at FROM categories WHERE id = ?",
                params![id],
                |row| {
                    let created_at_str: String = row.get(2)?;
                    Ok(Category {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: parse_datetime(&created_at_str),
                    })
                },
            )
            .ok();
        Ok(category)
    }

    /// Look up a category by name (case-insensitive)
    pub fn get_category_by_name(&self, name: &str) -> Result<Option<Category>> {
        let conn = self.conn()?;
        let category = conn
            .query_row(
                "SELECT id, name, created_at FROM categories WHERE name = ?",
                params![name.trim()],
                |row| {
                    let created_at_str: String = row.get(2)?;
                    Ok(Category {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: parse_datetime(&created_at_str),
                    })
                },
            )
            .ok();
        Ok(category)
    }

    /// List all categories by name
    pub fn list_categories(&self) -> Result<Vec<Category>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM categories ORDER BY name")?;

        let categories = stmt
            .query_map([], |row| {
                let created_at_str: String = row.get(2)?;
                Ok(Category {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: parse_datetime(&created_at_str),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(categories)
    }
}
