//! Tag and rule storage.
//!
//! Tags are free-form `(item_id, name, value)` triples. `state`, `label`
//! and `filetype` are reserved: they are first-class item fields exposed
//! read-only through [`Database::get_tags`] for uniform filtering, and may
//! not be written through the tag table. Rules attach `(tag_name, tag_value)`
//! pairs to a label and are re-applied idempotently on every item mutation.

use anyhow::Result;
use rusqlite::params;
use std::collections::BTreeMap;

use crate::error::CurataError;

use super::items::FileState;
use super::Database;

/// Tag names that mirror item fields and cannot be added or removed.
pub const RESERVED_TAG_NAMES: &[&str] = &["state", "label", "filetype"];

/// A raw tag row, used by the query engine's generic tag filters.
#[derive(Debug, Clone)]
pub struct TagRow {
    pub item_id: i64,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub label: String,
    pub tag_name: String,
    pub tag_value: String,
}

impl Database {
    /// Add tags to an item. Reserved names are rejected; values already
    /// present are skipped, so re-application is idempotent.
    pub fn add_tags(&self, item_id: i64, tags: &BTreeMap<String, Vec<String>>) -> Result<()> {
        for (name, values) in tags {
            if RESERVED_TAG_NAMES.contains(&name.as_str()) {
                return Err(CurataError::ForbiddenTag(name.clone()).into());
            }

            for value in values {
                let exists: bool = self
                    .conn
                    .query_row(
                        "SELECT 1 FROM tags WHERE item_id = ? AND name = ? AND value = ?",
                        params![item_id, name, value],
                        |_| Ok(true),
                    )
                    .unwrap_or(false);
                if exists {
                    continue;
                }
                self.conn.execute(
                    "INSERT INTO tags (item_id, name, value) VALUES (?, ?, ?)",
                    params![item_id, name, value],
                )?;
            }
        }
        Ok(())
    }

    pub fn remove_tags(&self, item_id: i64, tags: &BTreeMap<String, Vec<String>>) -> Result<()> {
        for (name, values) in tags {
            if RESERVED_TAG_NAMES.contains(&name.as_str()) {
                return Err(CurataError::ForbiddenTag(name.clone()).into());
            }

            for value in values {
                self.conn.execute(
                    "DELETE FROM tags WHERE item_id = ? AND name = ? AND value = ?",
                    params![item_id, name, value],
                )?;
            }
        }
        Ok(())
    }

    /// All tags of an item, with the read-only `label` and `filetype`
    /// pseudo-tags included.
    pub fn get_tags(&self, item_id: i64) -> Result<BTreeMap<String, Vec<String>>> {
        let item = self.require_item(item_id)?;

        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        result.insert("label".to_string(), vec![item.label.clone()]);
        result.insert(
            "filetype".to_string(),
            vec![match item.filetype {
                super::items::FileType::Image => "image".to_string(),
                super::items::FileType::Video => "video".to_string(),
            }],
        );

        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM tags WHERE item_id = ?")?;
        let rows = stmt.query_map([item_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows.filter_map(|r| r.ok()) {
            result.entry(row.0).or_default().push(row.1);
        }

        Ok(result)
    }

    /// Values of a single tag name, sorted; the reserved names read through
    /// to the item fields.
    pub fn get_tag(&self, item_id: i64, tag_name: &str) -> Result<Vec<String>> {
        let item = self.require_item(item_id)?;

        match tag_name {
            "label" => return Ok(vec![item.label]),
            "filetype" => {
                return Ok(vec![match item.filetype {
                    super::items::FileType::Image => "image".to_string(),
                    super::items::FileType::Video => "video".to_string(),
                }])
            }
            "state" => return Ok(vec![item.state.ordinal().to_string()]),
            _ => {}
        }

        let mut stmt = self
            .conn
            .prepare("SELECT value FROM tags WHERE item_id = ? AND name = ? ORDER BY value")?;
        let values = stmt
            .query_map(params![item_id, tag_name], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(values)
    }

    /// Every tag row in the database, for in-memory query evaluation.
    pub fn all_tag_rows(&self) -> Result<Vec<TagRow>> {
        let mut stmt = self.conn.prepare("SELECT item_id, name, value FROM tags")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TagRow {
                    item_id: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn distinct_tags(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT name, value FROM tags ORDER BY name, value",
        )?;
        let tags = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tags)
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Add a rule unless it already exists. Names and values are trimmed.
    pub fn add_rule(&self, label: &str, tag_name: &str, tag_value: &str) -> Result<()> {
        let tag_name = tag_name.trim();
        let tag_value = tag_value.trim();

        let exists: bool = self
            .conn
            .query_row(
                "SELECT 1 FROM rules WHERE label = ? AND tag_name = ? AND tag_value = ?",
                params![label, tag_name, tag_value],
                |_| Ok(true),
            )
            .unwrap_or(false);
        if exists {
            return Ok(());
        }

        self.conn.execute(
            "INSERT INTO rules (label, tag_name, tag_value) VALUES (?, ?, ?)",
            params![label, tag_name, tag_value],
        )?;
        Ok(())
    }

    /// Remove matching rules; returns whether anything was removed.
    pub fn remove_rule(&self, label: &str, tag_name: &str, tag_value: &str) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM rules WHERE label = ? AND tag_name = ? AND tag_value = ?",
            params![label, tag_name, tag_value],
        )?;
        Ok(removed > 0)
    }

    pub fn rules_for_label(&self, label: &str) -> Result<Vec<Rule>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label, tag_name, tag_value FROM rules WHERE label = ?")?;
        let rules = stmt
            .query_map([label], |row| {
                Ok(Rule {
                    label: row.get(0)?,
                    tag_name: row.get(1)?,
                    tag_value: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rules)
    }

    pub fn all_rules(&self) -> Result<Vec<Rule>> {
        let mut stmt = self.conn.prepare(
            "SELECT label, tag_name, tag_value FROM rules ORDER BY tag_name, label",
        )?;
        let rules = stmt
            .query_map([], |row| {
                Ok(Rule {
                    label: row.get(0)?,
                    tag_name: row.get(1)?,
                    tag_value: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rules)
    }

    pub fn delete_rules_for_label(&self, label: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM rules WHERE label = ?", [label])?;
        Ok(removed)
    }

    /// Apply every rule matching the item's label. Safe to call repeatedly;
    /// existing tags are skipped by [`Database::add_tags`].
    pub fn apply_rules(&self, item_id: i64) -> Result<()> {
        let item = self.require_item(item_id)?;

        let mut tags: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for rule in self.rules_for_label(&item.label)? {
            tags.entry(rule.tag_name).or_default().push(rule.tag_value);
        }

        self.add_tags(item_id, &tags)
    }

    /// Labels of labeled-stage items that have no rule for `tag_name`,
    /// most recently used first.
    pub fn missing_rule_labels(&self, tag_name: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT label FROM items WHERE state >= ? ORDER BY id DESC",
        )?;
        let labels: Vec<String> = stmt
            .query_map([FileState::NeedsClip.ordinal()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        let mut seen = std::collections::HashSet::new();
        let mut missing = Vec::new();
        for label in labels {
            if !seen.insert(label.clone()) {
                continue;
            }
            let has_rule: bool = self
                .conn
                .query_row(
                    "SELECT 1 FROM rules WHERE label = ? AND tag_name = ? LIMIT 1",
                    params![label, tag_name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !has_rule {
                missing.push(label);
            }
        }
        Ok(missing)
    }

    /// Historical `labelplus` values no longer carried by any item's label.
    pub fn unused_labelplus_values(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT value FROM tags
            WHERE name = 'labelplus'
              AND value NOT IN (SELECT DISTINCT label FROM items)
            ORDER BY value
            "#,
        )?;
        let values = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(values)
    }
}
