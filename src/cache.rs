//! FIFO thumbnail cache keyed by item id.

use anyhow::{anyhow, Result};
use image::DynamicImage;
use std::collections::{HashMap, VecDeque};
use std::path::Path;

use crate::db::items::FileType;
use crate::db::Database;
use crate::imaging;

pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

/// Generate a thumbnail for an item's file. Videos have no frame decoder
/// here and are an error.
pub fn get_thumbnail(
    db: &Database,
    media_root: &Path,
    item_id: i64,
    size: u32,
) -> Result<DynamicImage> {
    let item = db.require_item(item_id)?;
    if item.filetype != FileType::Image {
        return Err(anyhow!("no thumbnail for video item {}", item_id));
    }
    let image = imaging::load_image(&item.path(media_root))?;
    Ok(imaging::thumbnail(&image, size))
}

/// Bounded FIFO cache of decoded thumbnails. Eviction is insertion-ordered,
/// not LRU; repeat lookups are cheap enough that recency tracking is not
/// worth the bookkeeping.
pub struct ThumbnailCache {
    entries: HashMap<i64, DynamicImage>,
    order: VecDeque<i64>,
    capacity: usize,
    size: u32,
}

impl ThumbnailCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            size: DEFAULT_THUMBNAIL_SIZE,
        }
    }

    pub fn from_config(config: &crate::config::ClipConfig) -> Self {
        Self::new(config.thumbnail_cache_size)
    }

    pub fn get(
        &mut self,
        db: &Database,
        media_root: &Path,
        item_id: i64,
    ) -> Result<&DynamicImage> {
        if !self.entries.contains_key(&item_id) {
            while self.order.len() >= self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
            let thumbnail = get_thumbnail(db, media_root, item_id, self.size)?;
            self.entries.insert(item_id, thumbnail);
            self.order.push_back(item_id);
        }
        Ok(&self.entries[&item_id])
    }

    /// Drop an entry whose underlying file changed.
    pub fn invalidate(&mut self, item_id: i64) {
        if self.entries.remove(&item_id).is_some() {
            self.order.retain(|id| *id != item_id);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
