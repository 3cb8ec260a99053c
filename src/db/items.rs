//! Item records: the state-machine catalog over the media tree.

use anyhow::Result;
use rusqlite::params;
use std::path::{Path, PathBuf};

use crate::error::CurataError;

use super::Database;

/// Pipeline stage of an item, ordinal 0..5. Not strictly linear: items can
/// re-enter `NeedsModify` or drop back to `NeedsTags` after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileState {
    NeedsCrop = 0,
    NeedsModify = 1,
    NeedsLabel = 2,
    NeedsClip = 3,
    NeedsTags = 4,
    Complete = 5,
}

impl FileState {
    pub fn from_ordinal(value: i32) -> Result<Self, CurataError> {
        match value {
            0 => Ok(FileState::NeedsCrop),
            1 => Ok(FileState::NeedsModify),
            2 => Ok(FileState::NeedsLabel),
            3 => Ok(FileState::NeedsClip),
            4 => Ok(FileState::NeedsTags),
            5 => Ok(FileState::Complete),
            _ => Err(CurataError::UnknownState(value.to_string())),
        }
    }

    /// Parse a wire value: an ordinal, a numeric string, or a named alias.
    /// Unknown aliases are an explicit error, never a silent passthrough.
    pub fn parse(value: &str) -> Result<Self, CurataError> {
        if let Ok(n) = value.parse::<i32>() {
            return Self::from_ordinal(n);
        }
        match value {
            "uncropped" | "needscrop" => Ok(FileState::NeedsCrop),
            "unmodified" | "needsmodify" => Ok(FileState::NeedsModify),
            "unlabelled" | "needslabel" => Ok(FileState::NeedsLabel),
            "needsclip" => Ok(FileState::NeedsClip),
            "needstags" => Ok(FileState::NeedsTags),
            "complete" => Ok(FileState::Complete),
            other => Err(CurataError::UnknownState(other.to_string())),
        }
    }

    pub fn ordinal(self) -> i32 {
        self as i32
    }

    /// States that require a non-empty label.
    pub fn is_labeled(self) -> bool {
        self >= FileState::NeedsClip
    }

    /// States whose items live in a flat staging folder rather than
    /// `items/{label}/`.
    pub fn staging_folder(self) -> Option<&'static str> {
        match self {
            FileState::NeedsCrop => Some("uncropped"),
            FileState::NeedsModify => Some("needsmodify"),
            FileState::NeedsLabel => Some("unlabelled"),
            _ => None,
        }
    }

    /// Map a top-level folder name back to the state an item found there
    /// should be in. `items` maps to the first labeled stage.
    pub fn from_category(category: &str) -> Result<Self, CurataError> {
        match category {
            "items" => Ok(FileState::NeedsClip),
            "uncropped" => Ok(FileState::NeedsCrop),
            "needsmodify" => Ok(FileState::NeedsModify),
            "unlabelled" => Ok(FileState::NeedsLabel),
            other => Err(CurataError::UnknownCategory(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    Image = 0,
    Video = 1,
}

impl FileType {
    pub fn from_ordinal(value: i32) -> Result<Self, CurataError> {
        match value {
            0 => Ok(FileType::Image),
            1 => Ok(FileType::Video),
            _ => Err(CurataError::UnknownFileType(value.to_string())),
        }
    }

    /// Parse a wire alias (`image`/`images`/`video`/`videos`) or an ordinal.
    pub fn parse(value: &str) -> Result<Self, CurataError> {
        if let Ok(n) = value.parse::<i32>() {
            return Self::from_ordinal(n);
        }
        match value {
            "image" | "images" => Ok(FileType::Image),
            "video" | "videos" => Ok(FileType::Video),
            other => Err(CurataError::UnknownFileType(other.to_string())),
        }
    }

    /// Classify a lowercase file extension.
    pub fn from_extension(ext: &str) -> Result<Self, CurataError> {
        match ext {
            "png" | "gif" | "jpg" | "jpeg" | "webp" => Ok(FileType::Image),
            "mp4" | "mov" => Ok(FileType::Video),
            other => Err(CurataError::UnknownFileType(other.to_string())),
        }
    }

    pub fn ordinal(self) -> i32 {
        self as i32
    }

    /// Canonical extension of managed files.
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Image => "png",
            FileType::Video => "mp4",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            FileType::Image => "image/png",
            FileType::Video => "video/mp4",
        }
    }
}

/// A catalog record. The on-disk location is a pure function of
/// `(state, label, filetype, id)`; see [`Item::path`].
#[derive(Debug, Clone)]
pub struct Item {
    pub id: i64,
    pub state: FileState,
    pub label: String,
    pub filetype: FileType,
    pub width: u32,
    pub height: u32,
    pub embedding: Option<String>,
}

impl Item {
    pub fn string_id(&self) -> String {
        format!("{:010}", self.id)
    }

    /// Derive the item's canonical path under the media root. Staging states
    /// map to flat folders; labeled states map to `items/{label}/`.
    pub fn path(&self, media_root: &Path) -> PathBuf {
        let folder = match self.state.staging_folder() {
            Some(staging) => media_root.join(staging),
            None => media_root.join("items").join(&self.label),
        };
        folder.join(format!("{}.{}", self.string_id(), self.filetype.extension()))
    }

    pub fn parent_dir(&self, media_root: &Path) -> PathBuf {
        let mut path = self.path(media_root);
        path.pop();
        path
    }
}

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    let state_ord: i32 = row.get(1)?;
    let filetype_ord: i32 = row.get(3)?;
    Ok(Item {
        id: row.get(0)?,
        state: FileState::from_ordinal(state_ord)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(1, state_ord as i64))?,
        label: row.get(2)?,
        filetype: FileType::from_ordinal(filetype_ord)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(3, filetype_ord as i64))?,
        width: row.get::<_, i64>(4)? as u32,
        height: row.get::<_, i64>(5)? as u32,
        embedding: row.get(6)?,
    })
}

const ITEM_COLUMNS: &str = "id, state, label, filetype, width, height, embedding";

impl Database {
    pub fn create_item(
        &self,
        label: &str,
        filetype: FileType,
        state: FileState,
        width: u32,
        height: u32,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO items (state, label, filetype, width, height) VALUES (?, ?, ?, ?, ?)",
            params![
                state.ordinal(),
                label,
                filetype.ordinal(),
                width as i64,
                height as i64
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_item(&self, item_id: i64) -> Result<Option<Item>> {
        let result = self.conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"),
            [item_id],
            row_to_item,
        );
        match result {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Like [`Database::get_item`] but a missing record is an error.
    pub fn require_item(&self, item_id: i64) -> Result<Item> {
        self.get_item(item_id)?
            .ok_or_else(|| CurataError::ItemNotFound(item_id).into())
    }

    pub fn all_items(&self) -> Result<Vec<Item>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {ITEM_COLUMNS} FROM items ORDER BY id"))?;
        let items = stmt
            .query_map([], row_to_item)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    pub fn all_item_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM items ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// All other items in the same label+filetype partition.
    pub fn partition_items(
        &self,
        label: &str,
        filetype: FileType,
        exclude_id: i64,
    ) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE label = ? AND filetype = ? AND id != ?"
        ))?;
        let items = stmt
            .query_map(params![label, filetype.ordinal(), exclude_id], row_to_item)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    /// All other items carrying the given label, any filetype.
    pub fn same_label_items(&self, label: &str, exclude_id: i64) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE label = ? AND id != ?"
        ))?;
        let items = stmt
            .query_map(params![label, exclude_id], row_to_item)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    pub fn first_item_in_state(&self, state: FileState) -> Result<Option<Item>> {
        let result = self.conn.query_row(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM items WHERE state = ? ORDER BY label, id LIMIT 1"
            ),
            [state.ordinal()],
            row_to_item,
        );
        match result {
            Ok(item) => Ok(Some(item)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn item_ids_in_state(&self, state: FileState, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM items WHERE state = ? ORDER BY id LIMIT ?")?;
        let ids = stmt
            .query_map(params![state.ordinal(), limit as i64], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    pub fn count_items_in_state(&self, state: FileState) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM items WHERE state = ?",
            [state.ordinal()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Most recent completed items for a label, newest first.
    pub fn latest_complete_items(&self, label: &str, limit: usize) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM items WHERE state = ? AND label = ? ORDER BY id DESC LIMIT ?",
        )?;
        let ids = stmt
            .query_map(
                params![FileState::Complete.ordinal(), label, limit as i64],
                |row| row.get(0),
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Image items at NeedsClip or beyond without a stored embedding.
    pub fn unclipped_items(&self) -> Result<Vec<Item>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE state >= ? AND filetype = ? AND embedding IS NULL
             ORDER BY id"
        ))?;
        let items = stmt
            .query_map(
                params![FileState::NeedsClip.ordinal(), FileType::Image.ordinal()],
                row_to_item,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(items)
    }

    /// Labels carried by items in the labeled stages (NeedsClip and beyond),
    /// distinct, in id order.
    pub fn labels_in_use(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT label FROM items WHERE state >= ? ORDER BY label",
        )?;
        let labels = stmt
            .query_map([FileState::NeedsClip.ordinal()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(labels)
    }

    pub fn all_labels(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT label FROM items ORDER BY label")?;
        let labels = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(labels)
    }

    /// Persist the mutable fields of an item record.
    pub fn save_item(&self, item: &Item) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET state = ?, label = ?, width = ?, height = ? WHERE id = ?",
            params![
                item.state.ordinal(),
                item.label,
                item.width as i64,
                item.height as i64,
                item.id
            ],
        )?;
        Ok(())
    }

    pub fn set_embedding(&self, item_id: i64, embedding: Option<&str>) -> Result<()> {
        self.conn.execute(
            "UPDATE items SET embedding = ? WHERE id = ?",
            params![embedding, item_id],
        )?;
        Ok(())
    }

    pub fn delete_item(&self, item_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM tags WHERE item_id = ?", [item_id])?;
        self.conn
            .execute("DELETE FROM items WHERE id = ?", [item_id])?;
        Ok(())
    }
}
