//! The curation pipeline: ingestion, the edit operation that drives every
//! state transition, crop processing, and deletion.

use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::clip::ClipIndex;
use crate::config::Config;
use crate::db::items::{FileState, FileType};
use crate::db::{Database, Item};
use crate::error::CurataError;
use crate::imaging;

/// Shared context for pipeline operations. Lives on the worker thread; the
/// connection is not shared across threads.
pub struct Session {
    pub config: Config,
    pub db: Database,
    pub clip: ClipIndex,
    pub video_remover: VideoRemover,
}

impl Session {
    pub fn new(config: Config, db: Database, clip: ClipIndex) -> Self {
        Self {
            config,
            db,
            clip,
            video_remover: VideoRemover::new(),
        }
    }

    fn media_root(&self) -> &Path {
        &self.config.media.root
    }
}

/// Requested changes for [`edit_item`]. `None` fields are left untouched.
#[derive(Debug, Default, Clone)]
pub struct EditItem {
    pub new_state: Option<FileState>,
    pub new_label: Option<String>,
    pub new_width: Option<u32>,
    pub new_height: Option<u32>,
}

/// Apply an edit to an item. This is the single mutation path for state,
/// label and dimensions; it keeps the file location, the stored embedding
/// and the auto-tag rules consistent with the record.
pub fn edit_item(session: &Session, item_id: i64, edit: EditItem) -> Result<Item> {
    let db = &session.db;
    let mut item = db.require_item(item_id)?;
    let mut new_label = edit.new_label;

    // Re-embed before the file moves: the content is about to change shape
    // (or already did, for NeedsModify items) and the stored vector would
    // go stale.
    let geometry_changed = edit.new_width.is_some_and(|w| w != item.width)
        || edit.new_height.is_some_and(|h| h != item.height);
    if (geometry_changed || item.state == FileState::NeedsModify) && item.embedding.is_some() {
        let encoded = session.clip.process_item(&session.config, db, item_id)?;
        item.embedding = Some(encoded);
    }

    let old_path = item.path(session.media_root());

    if let Some(new_state) = edit.new_state {
        // The label that will be in effect after this edit.
        let effective_label_empty = match &new_label {
            Some(label) => label.is_empty(),
            None => item.label.is_empty(),
        };
        if new_state.is_labeled() && effective_label_empty {
            return Err(CurataError::LabelRequired {
                item_id,
                state: item.state.ordinal(),
                new_state: new_state.ordinal(),
            }
            .into());
        }

        // Falling back to a pre-label stage sheds the label.
        if !new_state.is_labeled() {
            new_label = Some(String::new());
        }

        item.state = new_state;
    }

    if let Some(label) = new_label {
        item.label = label.clone();
        if !label.is_empty() {
            // Every label the item ever wore stays queryable as an alias.
            let mut tags = BTreeMap::new();
            tags.insert("labelplus".to_string(), vec![label]);
            db.add_tags(item_id, &tags)?;
        }
    }

    if let Some(width) = edit.new_width {
        item.width = width;
    }
    if let Some(height) = edit.new_height {
        item.height = height;
    }

    // Self-heal: a labeled-stage image off the canonical height gets
    // resized in place. The embedding predates this and is resize-agnostic.
    if item.height != session.config.media.height
        && item.filetype == FileType::Image
        && item.state.is_labeled()
    {
        let resize_path = if old_path.exists() {
            old_path.clone()
        } else {
            item.path(session.media_root())
        };
        if resize_path.exists() {
            let image = imaging::load_image(&resize_path)?;
            let resized = imaging::resize_to_height(&image, session.config.media.height);
            item.width = resized.width();
            item.height = resized.height();
            imaging::save_image(&resized, &resize_path)?;
        }
    }

    db.save_item(&item)?;
    if let Some(encoded) = &item.embedding {
        db.set_embedding(item_id, Some(encoded))?;
    }

    let new_path = item.path(session.media_root());
    std::fs::create_dir_all(item.parent_dir(session.media_root()))?;
    if old_path != new_path && old_path.exists() {
        std::fs::rename(&old_path, &new_path)?;
    }

    db.apply_rules(item_id)?;
    Ok(item)
}

/// Ingest a new file by extension, moving it to its staged location.
pub fn upload_item(session: &Session, path: &Path) -> Result<i64> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| CurataError::UnknownFileType(path.display().to_string()))?;
    match FileType::from_extension(&extension.to_lowercase())? {
        FileType::Image => upload_image_file(session, path),
        FileType::Video => upload_video_file(session, path),
    }
}

/// Ingest an image file: record its dimensions, create a NeedsCrop record
/// and move the file to the staging folder. Non-PNG sources are converted;
/// the managed store is PNG throughout.
pub fn upload_image_file(session: &Session, source: &Path) -> Result<i64> {
    let is_png = source
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("png"));

    let (width, height) = imaging::image_dimensions(source)?;
    let id = session
        .db
        .create_item("", FileType::Image, FileState::NeedsCrop, width, height)?;
    let item = session.db.require_item(id)?;

    let target = item.path(session.media_root());
    std::fs::create_dir_all(item.parent_dir(session.media_root()))?;
    if is_png {
        std::fs::rename(source, &target)?;
    } else {
        let image = imaging::load_image(source)?;
        imaging::save_image(&image, &target)?;
        std::fs::remove_file(source)?;
    }

    tracing::info!(item_id = id, path = %target.display(), "Ingested image");
    Ok(id)
}

/// Ingest an in-memory image (e.g. a fresh crop result saved as new).
pub fn upload_image(session: &Session, image: &image::DynamicImage) -> Result<i64> {
    let id = session.db.create_item(
        "",
        FileType::Image,
        FileState::NeedsCrop,
        image.width(),
        image.height(),
    )?;
    let item = session.db.require_item(id)?;
    imaging::save_image(image, &item.path(session.media_root()))?;
    Ok(id)
}

/// Ingest a video file. Videos skip the crop/modify stages and enter at
/// NeedsLabel. Dimensions are unknown without a decoder and start at zero;
/// an edit can correct them later.
pub fn upload_video_file(session: &Session, source: &Path) -> Result<i64> {
    let id = session
        .db
        .create_item("", FileType::Video, FileState::NeedsLabel, 0, 0)?;
    let item = session.db.require_item(id)?;

    let target = item.path(session.media_root());
    std::fs::create_dir_all(item.parent_dir(session.media_root()))?;
    std::fs::rename(source, &target)?;

    tracing::info!(item_id = id, path = %target.display(), "Ingested video");
    Ok(id)
}

/// Whether a finished crop overwrites the item or spawns a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
    Save,
    New,
}

impl SaveMode {
    pub fn parse(value: &str) -> Result<Self, CurataError> {
        match value {
            "save" => Ok(SaveMode::Save),
            "new" => Ok(SaveMode::New),
            other => Err(CurataError::UnknownSaveMode(other.to_string())),
        }
    }
}

/// Crop an item using corner points picked on a rendered view, apply the
/// optional tonal curve and rotation, normalize to the canonical height,
/// then either save over the item (advancing its state) or mint a new
/// unlabeled item from the crop.
#[allow(clippy::too_many_arguments)]
pub fn crop_and_resize_from_view(
    session: &Session,
    item_id: i64,
    rendered: (u32, u32),
    corner_a: (f64, f64),
    corner_b: (f64, f64),
    new_state: FileState,
    mode: SaveMode,
    curve_alpha: f64,
    rotate_degrees: i32,
) -> Result<i64> {
    let item = session.db.require_item(item_id)?;
    let old_path = item.path(session.media_root());
    let base = imaging::load_image(&old_path)?;

    let mut result = imaging::crop_from_view(
        &base,
        rendered,
        corner_a,
        corner_b,
        session.config.media.height,
    )?;
    result = imaging::apply_rgb_curve(&result, curve_alpha);
    if rotate_degrees != 0 {
        result = imaging::rotate_quarter_turns(&result, rotate_degrees / 90);
    }

    match mode {
        SaveMode::Save => {
            imaging::save_image(&result, &old_path)?;
            edit_item(
                session,
                item_id,
                EditItem {
                    new_state: Some(new_state),
                    new_width: Some(result.width()),
                    new_height: Some(result.height()),
                    ..Default::default()
                },
            )?;
            Ok(item_id)
        }
        SaveMode::New => {
            let id = session.db.create_item(
                "",
                FileType::Image,
                new_state,
                result.width(),
                result.height(),
            )?;
            let new_item = session.db.require_item(id)?;
            imaging::save_image(&result, &new_item.path(session.media_root()))?;
            Ok(id)
        }
    }
}

/// Delete items synchronously: file first, then record.
pub fn delete_items(session: &Session, item_ids: &[i64]) -> Result<()> {
    for &item_id in item_ids {
        let item = session.db.require_item(item_id)?;
        let path = item.path(session.media_root());
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        session.db.delete_item(item_id)?;
    }
    Ok(())
}

/// Delete items, deferring video file removal. A video being streamed holds
/// its file open; the record goes immediately and the file retries until
/// the handle is released.
pub fn delete_items_deferred(session: &Session, item_ids: &[i64]) -> Result<()> {
    for &item_id in item_ids {
        let item = session.db.require_item(item_id)?;
        if item.filetype == FileType::Video {
            session
                .video_remover
                .remove_video(&session.db, session.media_root(), item_id)?;
        } else {
            let path = item.path(session.media_root());
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            session.db.delete_item(item_id)?;
        }
    }
    Ok(())
}

/// Deferred file removals for videos whose handles may still be open.
/// Records are gone by the time a path lands here; paths retry every drain
/// pass until unlink succeeds.
pub struct VideoRemover {
    pending: Mutex<VecDeque<PathBuf>>,
}

impl VideoRemover {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn remove_video(&self, db: &Database, media_root: &Path, item_id: i64) -> Result<()> {
        let item = db.require_item(item_id)?;
        let path = item.path(media_root);
        db.delete_item(item_id)?;
        self.pending
            .lock()
            .map_err(|_| anyhow!("video remover lock poisoned"))?
            .push_back(path);
        Ok(())
    }

    /// One retry pass over the queue. Missing files are dropped, failed
    /// unlinks requeue.
    pub fn process(&self) -> Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("video remover lock poisoned"))?;
        for _ in 0..pending.len() {
            let Some(path) = pending.pop_front() else {
                break;
            };
            if !path.exists() {
                continue;
            }
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Video unlink failed, requeueing");
                pending.push_back(path);
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Default for VideoRemover {
    fn default() -> Self {
        Self::new()
    }
}

/// Next image awaiting a crop, lowest id first.
pub fn next_crop_item(session: &Session) -> Result<Option<i64>> {
    Ok(session
        .db
        .first_item_in_state(FileState::NeedsCrop)?
        .map(|item| item.id))
}

/// Next item awaiting its embedding, ordered by (label, id).
pub fn next_clip_item(session: &Session) -> Result<Option<i64>> {
    Ok(session
        .db
        .first_item_in_state(FileState::NeedsClip)?
        .map(|item| item.id))
}

/// Next item awaiting tags. With `else_random`, falls back to a random
/// already-tagged item so the review surface never goes blank.
pub fn next_tag_item(session: &Session, else_random: bool) -> Result<Option<i64>> {
    if let Some(item) = session.db.first_item_in_state(FileState::NeedsTags)? {
        return Ok(Some(item.id));
    }
    if else_random {
        use rand::seq::SliceRandom;
        let ids = session.db.item_ids_in_state(FileState::Complete, usize::MAX)?;
        let mut rng = rand::thread_rng();
        return Ok(ids.choose(&mut rng).copied());
    }
    Ok(None)
}

pub fn top_unlabelled_ids(session: &Session, limit: usize) -> Result<Vec<i64>> {
    session.db.item_ids_in_state(FileState::NeedsLabel, limit)
}

pub fn top_needs_modify_ids(session: &Session, limit: usize) -> Result<Vec<i64>> {
    session.db.item_ids_in_state(FileState::NeedsModify, limit)
}

/// Most recently confirmed items for a label, newest first.
pub fn latest_confirmed_items(session: &Session, label: &str, limit: usize) -> Result<Vec<i64>> {
    session.db.latest_complete_items(label, limit)
}

pub fn has_items_in_state(session: &Session, state: FileState) -> Result<bool> {
    Ok(session.db.count_items_in_state(state)? > 0)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clip::Embedder;
    use anyhow::Result;
    use image::DynamicImage;

    /// Deterministic embedder: mean brightness and aspect, normalized.
    pub struct StubEmbedder;

    impl Embedder for StubEmbedder {
        fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
            let rgb = image.to_rgb8();
            let total: u64 = rgb.pixels().map(|p| p[0] as u64 + p[1] as u64 + p[2] as u64).sum();
            let mean = total as f32 / (rgb.width() * rgb.height() * 3) as f32 / 255.0;
            let aspect = image.width() as f32 / image.height().max(1) as f32;
            let norm = (mean * mean + aspect * aspect).sqrt().max(f32::MIN_POSITIVE);
            Ok(vec![mean / norm, aspect / norm])
        }
    }

    pub fn test_session(media_root: &Path) -> Session {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        let mut config = Config::default();
        config.media.root = media_root.to_path_buf();
        Session::new(config, db, ClipIndex::new(Box::new(StubEmbedder)))
    }

    pub fn write_png(path: &Path, width: u32, height: u32) -> DynamicImage {
        let image = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            width,
            height,
            image::Rgba([120, 80, 40, 255]),
        ));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        image.save(path).unwrap();
        image
    }
}
