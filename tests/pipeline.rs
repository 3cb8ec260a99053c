//! End-to-end pipeline tests over a real temp media tree with a stub
//! embedder in place of the ONNX session.

use anyhow::Result;
use image::{DynamicImage, Rgb, RgbImage};
use std::path::Path;
use tempfile::TempDir;

use curata::clip::{self, ClipIndex, Embedder};
use curata::config::Config;
use curata::db::items::{FileState, FileType};
use curata::db::Database;
use curata::pipeline::{self, EditItem, SaveMode, Session};
use curata::query::{self, TagCondition, TagQuery};
use curata::{cleanup, similarity, watcher};

/// Embeds each image as its normalized (mean brightness, aspect ratio).
struct StubEmbedder;

impl Embedder for StubEmbedder {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let rgb = image.to_rgb8();
        let total: u64 = rgb
            .pixels()
            .map(|p| p[0] as u64 + p[1] as u64 + p[2] as u64)
            .sum();
        let mean = total as f32 / (rgb.width() * rgb.height() * 3) as f32 / 255.0;
        let aspect = image.width() as f32 / image.height().max(1) as f32;
        let norm = (mean * mean + aspect * aspect).sqrt().max(f32::MIN_POSITIVE);
        Ok(vec![mean / norm, aspect / norm])
    }
}

fn session(media_root: &Path) -> Session {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    let mut config = Config::default();
    config.media.root = media_root.to_path_buf();
    Session::new(config, db, ClipIndex::new(Box::new(StubEmbedder)))
}

// RGB keeps the JPEG encoder happy for drop-folder fixtures.
fn write_image(path: &Path, width: u32, height: u32, shade: u8) {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(
        width,
        height,
        Rgb([shade, shade, shade]),
    ));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    image.save(path).unwrap();
}

#[test]
fn new_item_path_derivation() {
    let tmp = TempDir::new().unwrap();
    let session = session(tmp.path());

    let id = session
        .db
        .create_item("", FileType::Image, FileState::NeedsCrop, 640, 480)
        .unwrap();
    let item = session.db.require_item(id).unwrap();

    assert_eq!(
        item.path(tmp.path()),
        tmp.path().join("uncropped").join(format!("{:010}.png", id))
    );
}

#[test]
fn labeling_moves_file_and_records_history() {
    let tmp = TempDir::new().unwrap();
    let session = session(tmp.path());

    let id = session
        .db
        .create_item("", FileType::Image, FileState::NeedsLabel, 640, 800)
        .unwrap();
    let unlabeled_path = session.db.require_item(id).unwrap().path(tmp.path());
    write_image(&unlabeled_path, 640, 800, 100);

    pipeline::edit_item(
        &session,
        id,
        EditItem {
            new_state: Some(FileState::NeedsClip),
            new_label: Some("cat".into()),
            ..Default::default()
        },
    )
    .unwrap();

    let item = session.db.require_item(id).unwrap();
    assert_eq!(item.label, "cat");
    assert_eq!(item.state, FileState::NeedsClip);
    assert!(!unlabeled_path.exists());
    assert!(tmp
        .path()
        .join("items/cat")
        .join(format!("{:010}.png", id))
        .exists());

    let tags = session.db.get_tags(id).unwrap();
    assert_eq!(tags["labelplus"], vec!["cat".to_string()]);
}

#[test]
fn untagged_query_excludes_tagged_items() {
    let tmp = TempDir::new().unwrap();
    let session = session(tmp.path());

    let untagged = session
        .db
        .create_item("cat", FileType::Image, FileState::Complete, 100, 800)
        .unwrap();
    let tagged = session
        .db
        .create_item("cat", FileType::Image, FileState::Complete, 100, 800)
        .unwrap();
    let mut tags = std::collections::BTreeMap::new();
    tags.insert("color".to_string(), vec!["black".to_string()]);
    session.db.add_tags(tagged, &tags).unwrap();

    let ids = query::get_untagged_ids(&session.db, tmp.path(), "color", &[]).unwrap();
    assert!(ids.contains(&untagged));
    assert!(!ids.contains(&tagged));
}

#[test]
fn nearest_never_crosses_labels() {
    let tmp = TempDir::new().unwrap();
    let session = session(tmp.path());

    let make = |label: &str, embedding: &[f32]| {
        let id = session
            .db
            .create_item(label, FileType::Image, FileState::Complete, 100, 800)
            .unwrap();
        session
            .db
            .set_embedding(id, Some(&clip::embedding_to_base64(embedding)))
            .unwrap();
        id
    };

    let dog = make("dog", &[1.0, 0.0]);
    make("dog", &[0.0, 1.0]);
    let loner = make("giraffe", &[1.0, 0.0]);

    assert_eq!(
        similarity::get_nearest_item(&session.db, loner, "giraffe", FileType::Image).unwrap(),
        None
    );
    // The same anchor probed against the dog partition finds its twin.
    assert_eq!(
        similarity::get_nearest_item(&session.db, loner, "dog", FileType::Image).unwrap(),
        Some(dog)
    );
}

#[test]
fn full_lifecycle_from_drop_to_complete() {
    let tmp = TempDir::new().unwrap();
    let session = session(tmp.path());

    // A new file appears in a watched drop folder.
    let dropped = tmp.path().join("incoming").join("holiday.jpg");
    write_image(&dropped, 1200, 900, 180);
    watcher::handle_check(&session, &dropped, true).unwrap();

    let id = session.db.all_item_ids().unwrap()[0];
    let item = session.db.require_item(id).unwrap();
    assert_eq!(item.state, FileState::NeedsCrop);
    assert!(item.path(tmp.path()).starts_with(tmp.path().join("uncropped")));

    // Crop it down; the result lands at the canonical height.
    pipeline::crop_and_resize_from_view(
        &session,
        id,
        (1200, 900),
        (100.0, 100.0),
        (700.0, 500.0),
        FileState::NeedsLabel,
        SaveMode::Save,
        0.0,
        0,
    )
    .unwrap();

    let item = session.db.require_item(id).unwrap();
    assert_eq!(item.state, FileState::NeedsLabel);
    assert_eq!(item.height, 800);

    // Label it, embed it, tag it, confirm it.
    pipeline::edit_item(
        &session,
        id,
        EditItem {
            new_state: Some(FileState::NeedsClip),
            new_label: Some("beach".into()),
            ..Default::default()
        },
    )
    .unwrap();

    let embedded = session
        .clip
        .embed_unclipped_items(&session.config, &session.db)
        .unwrap();
    assert_eq!(embedded, 1);
    assert!(session.db.require_item(id).unwrap().embedding.is_some());

    pipeline::edit_item(
        &session,
        id,
        EditItem {
            new_state: Some(FileState::NeedsTags),
            ..Default::default()
        },
    )
    .unwrap();
    let mut tags = std::collections::BTreeMap::new();
    tags.insert("mood".to_string(), vec!["calm".to_string()]);
    session.db.add_tags(id, &tags).unwrap();
    pipeline::edit_item(
        &session,
        id,
        EditItem {
            new_state: Some(FileState::Complete),
            ..Default::default()
        },
    )
    .unwrap();

    let item = session.db.require_item(id).unwrap();
    assert_eq!(item.state, FileState::Complete);
    assert!(item.path(tmp.path()).exists());

    // It is now queryable by its tag.
    let mut query = TagQuery::new();
    query
        .entry(("mood".to_string(), TagCondition::Is))
        .or_default()
        .push("calm".to_string());
    let results = query::evaluate(&session.db, tmp.path(), &query, None).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, id);
    assert_eq!(results[0].label, "beach");
}

#[test]
fn manual_move_reconciles_and_cleanup_sweeps() {
    let tmp = TempDir::new().unwrap();
    let session = session(tmp.path());

    let id = session
        .db
        .create_item("cat", FileType::Image, FileState::Complete, 100, 800)
        .unwrap();
    let canonical = session.db.require_item(id).unwrap().path(tmp.path());
    write_image(&canonical, 100, 800, 60);

    // The user drags the file into another label folder by hand.
    let moved = tmp.path().join("items/dog").join(format!("{:010}.png", id));
    std::fs::create_dir_all(moved.parent().unwrap()).unwrap();
    std::fs::rename(&canonical, &moved).unwrap();

    watcher::read_directory(&session, tmp.path()).unwrap();
    assert_eq!(session.db.require_item(id).unwrap().label, "dog");

    // The old cat/ folder is now unused and gets swept.
    cleanup::clean_db(&session).unwrap();
    assert!(!tmp.path().join("items/cat").exists());
    assert!(moved.exists());
    assert!(session.db.get_item(id).unwrap().is_some());
}

#[test]
fn stored_embeddings_round_trip_through_sqlite() {
    let tmp = TempDir::new().unwrap();
    let session = session(tmp.path());

    let id = session
        .db
        .create_item("cat", FileType::Image, FileState::NeedsClip, 400, 800)
        .unwrap();
    write_image(
        &session.db.require_item(id).unwrap().path(tmp.path()),
        400,
        800,
        200,
    );

    let encoded = session
        .clip
        .process_item(&session.config, &session.db, id)
        .unwrap();

    let stored = session.db.require_item(id).unwrap().embedding.unwrap();
    assert_eq!(stored, encoded);
    let decoded = clip::base64_to_embedding(&stored).unwrap();
    assert_eq!(decoded.len(), 2);
    // Stub embedder output is L2-normalized.
    let norm: f32 = decoded.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}
