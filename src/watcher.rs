//! Filesystem reconciliation: a debounced event queue over the watched
//! roots, plus the decision tree that folds an observed file back into the
//! catalog.
//!
//! Sync tools write in bursts, so every event waits out a settle window and
//! repeat events for the same path keep pushing the deadline back. Deletes
//! wait several windows; a delete-then-recreate cycle must not drop the
//! record.

use anyhow::Result;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::cleanup;
use crate::config::WatcherConfig;
use crate::db::items::{FileState, FileType};
use crate::error::CurataError;
use crate::pipeline::{self, EditItem, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Created,
    Deleted,
}

type EventKey = (PathBuf, WatchEventKind);

#[derive(Default)]
struct DebounceState {
    /// Min-heap of pending deadlines, one entry per distinct second.
    deadlines: BinaryHeap<Reverse<u64>>,
    unique_deadlines: HashSet<u64>,
    /// Latest deadline per event key.
    file_assignments: HashMap<EventKey, u64>,
    /// Event keys due at each deadline.
    time_assignments: BTreeMap<u64, HashSet<EventKey>>,
}

/// Debounce queue for filesystem events. `add` is called from the notify
/// callback thread, `drain_due` from the worker loop.
pub struct EventProcessor {
    state: Mutex<DebounceState>,
    process_time: u64,
    deleted_scale: u64,
    banned_substrings: Vec<String>,
}

impl EventProcessor {
    pub fn new(config: &WatcherConfig) -> Self {
        Self {
            state: Mutex::new(DebounceState::default()),
            process_time: config.process_time_secs,
            deleted_scale: config.deleted_scale,
            banned_substrings: config.banned_substrings.clone(),
        }
    }

    pub fn add(&self, path: PathBuf, kind: WatchEventKind) {
        self.add_at(path, kind, now_secs());
    }

    fn add_at(&self, path: PathBuf, kind: WatchEventKind, now: u64) {
        let path_str = path.to_string_lossy();
        if self
            .banned_substrings
            .iter()
            .any(|banned| path_str.contains(banned.as_str()))
        {
            return;
        }

        let deadline = match kind {
            WatchEventKind::Deleted => now + self.process_time * self.deleted_scale,
            WatchEventKind::Created => now + self.process_time,
        };

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let key = (path, kind);

        // A repeat event vacates its previous slot; the file gets one
        // deadline, the latest.
        if let Some(previous) = state.file_assignments.get(&key).copied() {
            if let Some(keys) = state.time_assignments.get_mut(&previous) {
                keys.remove(&key);
            }
        }

        state.file_assignments.insert(key.clone(), deadline);
        state.time_assignments.entry(deadline).or_default().insert(key);

        if state.unique_deadlines.insert(deadline) {
            state.deadlines.push(Reverse(deadline));
        }
    }

    /// Remove and return every event whose deadline has passed, in deadline
    /// order.
    fn drain_due(&self, now: u64) -> Vec<EventKey> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        let mut due = Vec::new();

        while let Some(&Reverse(deadline)) = state.deadlines.peek() {
            if now < deadline {
                break;
            }
            state.deadlines.pop();
            state.unique_deadlines.remove(&deadline);

            if let Some(keys) = state.time_assignments.remove(&deadline) {
                for key in keys {
                    state.file_assignments.remove(&key);
                    due.push(key);
                }
            }
        }
        due
    }

    /// Drain and handle everything due. Per-event failures are logged; one
    /// bad path must not wedge the queue.
    pub fn process(&self, session: &Session) {
        for (path, kind) in self.drain_due(now_secs()) {
            let result = match kind {
                WatchEventKind::Created => handle_check(session, &path, true),
                WatchEventKind::Deleted => handle_delete(session, &path),
            };
            if let Err(e) = result {
                tracing::warn!(path = %path.display(), error = %e, "Event handling failed");
            }
        }
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.state.lock().map(|s| s.file_assignments.len()).unwrap_or(0)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// What a path claims about its file, read purely from its location under
/// the media root.
#[derive(Debug, Clone)]
pub struct FileProperties {
    pub name: String,
    pub filetype: FileType,
    /// First path component under the media root: a staging folder name or
    /// `items`. Empty for files outside the root.
    pub category: String,
    /// Second component for `items/{label}/` paths, otherwise empty.
    pub label: String,
}

pub fn get_file_properties(media_root: &Path, path: &Path) -> Result<FileProperties> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| CurataError::UnknownFileType(path.display().to_string()))?;
    let filetype = FileType::from_extension(&extension.to_lowercase())?;
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();

    let (category, label) = match path.strip_prefix(media_root) {
        Ok(relative) => {
            let components: Vec<&str> = relative
                .iter()
                .filter_map(|c| c.to_str())
                .collect();
            let category = components.first().copied().unwrap_or("").to_string();
            let label = if components.len() >= 3 {
                components[1].to_string()
            } else {
                String::new()
            };
            (category, label)
        }
        Err(_) => (String::new(), String::new()),
    };

    Ok(FileProperties {
        name,
        filetype,
        category,
        label,
    })
}

/// Look up the catalog record a path claims to be: digit-named files map to
/// item ids, everything else has no record.
pub fn try_get_item(
    session: &Session,
    path: &Path,
) -> Result<(Option<crate::db::Item>, FileProperties)> {
    let properties = get_file_properties(&session.config.media.root, path)?;
    let item = if !properties.name.is_empty()
        && properties.name.chars().all(|c| c.is_ascii_digit())
    {
        match properties.name.parse::<i64>() {
            Ok(id) => session.db.get_item(id)?,
            Err(_) => None,
        }
    } else {
        None
    };
    Ok((item, properties))
}

/// Reconcile an observed file with the catalog. The file on disk wins: a
/// moved file retro-applies the edit its new location implies.
///
/// `compare_edits` is off during the bulk startup scan, where re-measuring
/// every settled file would be wasted work.
pub fn handle_check(session: &Session, path: &Path, compare_edits: bool) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    let (item, properties) = try_get_item(session, path)?;

    let Some(item) = item else {
        // No record. Digit-named files are ingested even during the startup
        // scan; anything else only ingests from a live event.
        if properties.name.chars().all(|c| c.is_ascii_digit()) || compare_edits {
            pipeline::upload_item(session, path)?;
        }
        return Ok(());
    };

    let expected_path = item.path(&session.config.media.root);
    if expected_path == path {
        return Ok(());
    }

    let expected = get_file_properties(&session.config.media.root, &expected_path)?;

    if properties.label != item.label && properties.category == expected.category {
        // Same stage, different label folder: a label rename. Tags stay
        // valid.
        pipeline::edit_item(
            session,
            item.id,
            EditItem {
                new_label: Some(properties.label),
                new_state: Some(item.state),
                ..Default::default()
            },
        )?;
    } else if properties.category != expected.category {
        // The file moved to a different stage folder; apply the transition
        // it implies.
        let new_state = FileState::from_category(&properties.category)?;
        pipeline::edit_item(
            session,
            item.id,
            EditItem {
                new_label: Some(properties.label),
                new_state: Some(new_state),
                ..Default::default()
            },
        )?;
    } else if compare_edits {
        // Location matches the record; the content may not. Re-measure.
        if item.filetype == FileType::Image {
            let (width, height) = crate::imaging::image_dimensions(path)?;
            pipeline::edit_item(
                session,
                item.id,
                EditItem {
                    new_width: Some(width),
                    new_height: Some(height),
                    ..Default::default()
                },
            )?;
        }
    }

    Ok(())
}

/// Drop a record whose file is gone, double-checking that the item's
/// canonical location is empty too. A file that merely moved gets picked up
/// by its created event instead.
pub fn handle_delete(session: &Session, path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    let (item, _) = try_get_item(session, path)?;
    if let Some(item) = item {
        if !item.path(&session.config.media.root).exists() {
            tracing::info!(item_id = item.id, "File removed, dropping record");
            session.db.delete_item(item.id)?;
        }
    }
    Ok(())
}

/// Walk a directory and reconcile every file in it, skipping sync-tool
/// internals.
pub fn read_directory(session: &Session, directory: &Path) -> Result<()> {
    if !directory.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(directory).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path
            .components()
            .any(|c| c.as_os_str().to_string_lossy().contains(".cache"))
        {
            continue;
        }
        let filename = entry.file_name().to_string_lossy();
        if filename.contains("dropbox") || filename.contains(".ini") {
            continue;
        }

        if let Err(e) = handle_check(session, path, false) {
            tracing::warn!(path = %path.display(), error = %e, "Startup reconcile failed");
        }
    }
    Ok(())
}

fn watched_roots(session: &Session) -> Vec<PathBuf> {
    let mut roots = session.config.watcher.extra_roots.clone();
    roots.push(session.config.media.root.clone());
    roots
}

/// Startup pass: reconcile every watched root against the catalog, then
/// sweep stale records.
pub fn preprocess(session: &Session) -> Result<()> {
    for root in watched_roots(session) {
        read_directory(session, &root)?;
    }
    cleanup::clean_db(session)
}

/// Watch the media tree until the process exits. Events funnel through the
/// debounce queue; the loop drains it every cycle and also retries pending
/// video unlinks.
pub fn run(session: &Session) -> Result<()> {
    let processor = Arc::new(EventProcessor::new(&session.config.watcher));

    let producer = Arc::clone(&processor);
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "Watch error");
                    return;
                }
            };
            let kind = if event.kind.is_remove() {
                WatchEventKind::Deleted
            } else {
                WatchEventKind::Created
            };
            for path in event.paths {
                // Directories and extensionless files are never items.
                if path.extension().is_none() {
                    continue;
                }
                producer.add(path, kind);
            }
        })?;

    for root in watched_roots(session) {
        if root.exists() {
            watcher.watch(&root, RecursiveMode::Recursive)?;
            tracing::info!(root = %root.display(), "Watching");
        }
    }

    let interval = Duration::from_secs(session.config.watcher.process_time_secs);
    loop {
        processor.process(session);
        session.video_remover.process()?;
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{test_session, write_png};
    use tempfile::TempDir;

    fn processor() -> EventProcessor {
        EventProcessor::new(&WatcherConfig::default())
    }

    #[test]
    fn test_debounce_replaces_earlier_slot() {
        let p = processor();
        let path = PathBuf::from("/media/uncropped/0000000001.png");

        p.add_at(path.clone(), WatchEventKind::Created, 100);
        p.add_at(path.clone(), WatchEventKind::Created, 103);
        assert_eq!(p.pending(), 1);

        // The first deadline (105) has passed but the event moved to 108.
        assert!(p.drain_due(105).is_empty());
        let due = p.drain_due(108);
        assert_eq!(due, vec![(path, WatchEventKind::Created)]);
        assert_eq!(p.pending(), 0);
    }

    #[test]
    fn test_deleted_events_wait_longer() {
        let p = processor();
        let path = PathBuf::from("/media/items/cat/0000000001.png");

        p.add_at(path.clone(), WatchEventKind::Created, 100);
        p.add_at(path.clone(), WatchEventKind::Deleted, 100);

        let due = p.drain_due(105);
        assert_eq!(due, vec![(path.clone(), WatchEventKind::Created)]);
        // Delete deadline is 100 + 5 * 3.
        assert!(p.drain_due(114).is_empty());
        assert_eq!(p.drain_due(115), vec![(path, WatchEventKind::Deleted)]);
    }

    #[test]
    fn test_banned_substrings_never_queue() {
        let p = processor();
        p.add_at(PathBuf::from("/media/x.png.TMP"), WatchEventKind::Created, 100);
        p.add_at(PathBuf::from("/media/desktop.ini"), WatchEventKind::Created, 100);
        assert_eq!(p.pending(), 0);
    }

    #[test]
    fn test_file_properties() {
        let root = Path::new("/media");
        let props =
            get_file_properties(root, Path::new("/media/items/cat/0000000007.png")).unwrap();
        assert_eq!(props.name, "0000000007");
        assert_eq!(props.filetype, FileType::Image);
        assert_eq!(props.category, "items");
        assert_eq!(props.label, "cat");

        let props =
            get_file_properties(root, Path::new("/media/uncropped/0000000007.png")).unwrap();
        assert_eq!(props.category, "uncropped");
        assert_eq!(props.label, "");

        // Outside the root: only the filename is meaningful.
        let props = get_file_properties(root, Path::new("/drop/incoming/photo.JPG")).unwrap();
        assert_eq!(props.category, "");
        assert_eq!(props.filetype, FileType::Image);

        assert!(get_file_properties(root, Path::new("/media/uncropped/notes.txt")).is_err());
    }

    #[test]
    fn test_handle_check_label_rename() {
        let tmp = TempDir::new().unwrap();
        let session = test_session(tmp.path());
        let id = session
            .db
            .create_item("cat", FileType::Image, FileState::Complete, 100, 800)
            .unwrap();

        // The file sits in items/dog/ instead of items/cat/.
        let moved = tmp.path().join("items/dog").join(format!("{:010}.png", id));
        write_png(&moved, 100, 800);

        handle_check(&session, &moved, true).unwrap();

        let item = session.db.require_item(id).unwrap();
        assert_eq!(item.label, "dog");
        assert_eq!(item.state, FileState::Complete);
        // Labelplus history picked up the rename.
        let tags = session.db.get_tags(id).unwrap();
        assert!(tags["labelplus"].contains(&"dog".to_string()));
    }

    #[test]
    fn test_handle_check_category_change() {
        let tmp = TempDir::new().unwrap();
        let session = test_session(tmp.path());
        let id = session
            .db
            .create_item("cat", FileType::Image, FileState::Complete, 100, 800)
            .unwrap();

        // Dragged back into uncropped/: the item restarts the pipeline.
        let moved = tmp.path().join("uncropped").join(format!("{:010}.png", id));
        write_png(&moved, 100, 800);

        handle_check(&session, &moved, true).unwrap();

        let item = session.db.require_item(id).unwrap();
        assert_eq!(item.state, FileState::NeedsCrop);
        assert_eq!(item.label, "");
    }

    #[test]
    fn test_handle_check_ingests_unknown_file() {
        let tmp = TempDir::new().unwrap();
        let session = test_session(tmp.path());

        let dropped = tmp.path().join("incoming").join("photo.png");
        write_png(&dropped, 200, 100);

        handle_check(&session, &dropped, true).unwrap();

        let items = session.db.all_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].state, FileState::NeedsCrop);
        assert!(!dropped.exists());
    }

    #[test]
    fn test_handle_check_skips_non_digit_during_startup_scan() {
        let tmp = TempDir::new().unwrap();
        let session = test_session(tmp.path());

        let dropped = tmp.path().join("incoming").join("photo.png");
        write_png(&dropped, 200, 100);

        handle_check(&session, &dropped, false).unwrap();
        assert!(session.db.all_items().unwrap().is_empty());
        assert!(dropped.exists());
    }

    #[test]
    fn test_handle_delete_double_checks_expected_path() {
        let tmp = TempDir::new().unwrap();
        let session = test_session(tmp.path());
        let id = session
            .db
            .create_item("cat", FileType::Image, FileState::Complete, 100, 800)
            .unwrap();
        let item = session.db.require_item(id).unwrap();
        write_png(&item.path(tmp.path()), 100, 800);

        // Delete event for a stale path, but the canonical file exists: the
        // record survives.
        let stale = tmp.path().join("uncropped").join(format!("{:010}.png", id));
        handle_delete(&session, &stale).unwrap();
        assert!(session.db.get_item(id).unwrap().is_some());

        // Canonical file gone too: the record goes.
        std::fs::remove_file(item.path(tmp.path())).unwrap();
        handle_delete(&session, &item.path(tmp.path())).unwrap();
        assert!(session.db.get_item(id).unwrap().is_none());
    }

    #[test]
    fn test_read_directory_reconciles_tree() {
        let tmp = TempDir::new().unwrap();
        let session = test_session(tmp.path());
        let id = session
            .db
            .create_item("cat", FileType::Image, FileState::Complete, 100, 800)
            .unwrap();

        // On disk under dog/, recorded under cat/.
        write_png(
            &tmp.path().join("items/dog").join(format!("{:010}.png", id)),
            100,
            800,
        );
        // Sync-tool noise is skipped.
        std::fs::create_dir_all(tmp.path().join(".cache")).unwrap();
        std::fs::write(tmp.path().join(".cache/blob.png"), b"x").unwrap();

        read_directory(&session, tmp.path()).unwrap();
        assert_eq!(session.db.require_item(id).unwrap().label, "dog");
        assert_eq!(session.db.all_items().unwrap().len(), 1);
    }
}
