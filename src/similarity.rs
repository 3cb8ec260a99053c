//! Similarity scoring over stored embeddings.
//!
//! Distances are linear scans over decoded embeddings; the catalog is
//! personal-collection sized and SQLite holds the encoded vectors inline.

use anyhow::Result;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::clip::{base64_to_embedding, clip_distance};
use crate::config::SimilarityConfig;
use crate::db::{Database, FileType, Item};

/// Total order over distances so they can live in a heap. NaN compares
/// equal; it only arises from corrupt embeddings.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
struct Dist(f32);

impl Eq for Dist {}

impl Ord for Dist {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

/// Blend of visual and tag-overlap distance. Lower is more similar; more
/// shared tags shrink the tag term toward zero.
pub fn advanced_distance(clip_dist: f32, shared_tags: usize, alpha: f32) -> f32 {
    alpha * clip_dist + (1.0 - alpha) / (shared_tags as f32 + 1.0)
}

/// Count of (name, value) tag pairs two items share. The read-only `label`
/// and `filetype` pseudo-tags count toward the overlap, the same pairs
/// [`Database::get_tags`] exposes, so same-label and same-filetype
/// candidates get their credit in the blended distance.
fn shared_tag_counts(db: &Database, item: &Item) -> Result<HashMap<i64, usize>> {
    let rows = db.all_tag_rows()?;
    let own: HashSet<(String, String)> = rows
        .iter()
        .filter(|r| r.item_id == item.id)
        .map(|r| (r.name.clone(), r.value.clone()))
        .collect();

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for row in &rows {
        if row.item_id != item.id && own.contains(&(row.name.clone(), row.value.clone())) {
            *counts.entry(row.item_id).or_default() += 1;
        }
    }

    for candidate in db.all_items()? {
        if candidate.id == item.id {
            continue;
        }
        let mut pseudo = 0;
        if candidate.label == item.label {
            pseudo += 1;
        }
        if candidate.filetype == item.filetype {
            pseudo += 1;
        }
        if pseudo > 0 {
            *counts.entry(candidate.id).or_default() += pseudo;
        }
    }
    Ok(counts)
}

fn decoded_embedding(item: &Item) -> Option<Vec<f32>> {
    let encoded = item.embedding.as_deref()?;
    match base64_to_embedding(encoded) {
        Ok(embedding) => Some(embedding),
        Err(e) => {
            tracing::warn!(item_id = item.id, error = %e, "Corrupt stored embedding");
            None
        }
    }
}

/// Visually closest item within the given (label, filetype) partition, by
/// pure CLIP distance. The partition is the caller's choice and need not be
/// the anchor's own. `None` if the anchor has no embedding or the partition
/// holds no other embedded item.
pub fn get_nearest_item(
    db: &Database,
    item_id: i64,
    label: &str,
    filetype: FileType,
) -> Result<Option<i64>> {
    let item = db.require_item(item_id)?;
    let Some(own) = decoded_embedding(&item) else {
        return Ok(None);
    };

    let mut best: Option<(Dist, i64)> = None;
    for candidate in db.partition_items(label, filetype, item_id)? {
        let Some(other) = decoded_embedding(&candidate) else {
            continue;
        };
        let dist = Dist(clip_distance(&own, &other));
        if best.map_or(true, |(b, _)| dist < b) {
            best = Some((dist, candidate.id));
        }
    }
    Ok(best.map(|(_, id)| id))
}

/// Items most worth comparing against for duplicate review: the closest
/// same-label item first (visual-heavy blend), then the closest of a
/// bounded random sample of the whole catalog (tag-heavy blend). At most
/// `comparison_count` ids, nearest first.
pub fn get_comparison_items(
    db: &Database,
    similarity: &SimilarityConfig,
    item_id: i64,
) -> Result<Vec<i64>> {
    let item = db.require_item(item_id)?;
    let Some(own) = decoded_embedding(&item) else {
        return Ok(Vec::new());
    };
    let shared = shared_tag_counts(db, &item)?;

    let score = |candidate: &Item, alpha: f32| -> Option<Dist> {
        let other = decoded_embedding(candidate)?;
        let clip = clip_distance(&own, &other);
        let tags = shared.get(&candidate.id).copied().unwrap_or(0);
        Some(Dist(advanced_distance(clip, tags, alpha)))
    };

    let mut result = Vec::new();

    // Same-label pick gets a visual-heavy alpha.
    let mut best: Option<(Dist, i64)> = None;
    for candidate in db.same_label_items(&item.label, item_id)? {
        if let Some(dist) = score(&candidate, similarity.same_label_alpha) {
            if best.map_or(true, |(b, _)| dist < b) {
                best = Some((dist, candidate.id));
            }
        }
    }
    if let Some((_, id)) = best {
        result.push(id);
    }

    // Global pass over a bounded random sample, keeping the k nearest via a
    // max-heap that evicts the current worst.
    let remaining = similarity.comparison_count.saturating_sub(result.len());
    if remaining == 0 {
        return Ok(result);
    }

    let candidates: Vec<Item> = db
        .all_items()?
        .into_iter()
        .filter(|c| c.id != item_id && !result.contains(&c.id))
        .collect();
    let mut rng = rand::thread_rng();
    let sampled: Vec<&Item> = candidates
        .choose_multiple(&mut rng, similarity.sample_cap)
        .collect();

    let mut heap: BinaryHeap<(Dist, i64)> = BinaryHeap::new();
    for candidate in sampled {
        let Some(dist) = score(candidate, similarity.global_alpha) else {
            continue;
        };
        if heap.len() < remaining {
            heap.push((dist, candidate.id));
        } else if let Some(&(worst, _)) = heap.peek() {
            if dist < worst {
                heap.pop();
                heap.push((dist, candidate.id));
            }
        }
    }

    let mut nearest: Vec<(Dist, i64)> = heap.into_iter().collect();
    nearest.sort();
    result.extend(nearest.into_iter().map(|(_, id)| id));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::embedding_to_base64;
    use crate::db::items::{FileState, FileType};
    use std::collections::BTreeMap;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn add_item(db: &Database, label: &str, embedding: Option<&[f32]>) -> i64 {
        add_typed_item(db, label, FileType::Image, embedding)
    }

    fn add_typed_item(
        db: &Database,
        label: &str,
        filetype: FileType,
        embedding: Option<&[f32]>,
    ) -> i64 {
        let id = db
            .create_item(label, filetype, FileState::Complete, 100, 100)
            .unwrap();
        if let Some(e) = embedding {
            db.set_embedding(id, Some(&embedding_to_base64(e))).unwrap();
        }
        id
    }

    fn config() -> SimilarityConfig {
        SimilarityConfig::default()
    }

    #[test]
    fn test_advanced_distance_blend() {
        // alpha=1 is pure visual, alpha=0 pure tag-overlap.
        assert!((advanced_distance(0.4, 0, 1.0) - 0.4).abs() < 1e-6);
        assert!((advanced_distance(0.4, 0, 0.0) - 1.0).abs() < 1e-6);
        assert!((advanced_distance(0.4, 3, 0.0) - 0.25).abs() < 1e-6);
        // More shared tags means closer.
        assert!(advanced_distance(0.4, 5, 0.3) < advanced_distance(0.4, 1, 0.3));
    }

    #[test]
    fn test_nearest_item_stays_in_partition() {
        let db = test_db();
        let anchor = add_item(&db, "cat", Some(&[1.0, 0.0]));
        let close = add_item(&db, "cat", Some(&[0.9, 0.1]));
        let far = add_item(&db, "cat", Some(&[0.0, 1.0]));
        // Visually identical but labeled differently: never a candidate.
        let other_label = add_item(&db, "dog", Some(&[1.0, 0.0]));

        let nearest = get_nearest_item(&db, anchor, "cat", FileType::Image).unwrap();
        assert_eq!(nearest, Some(close));
        assert_ne!(nearest, Some(far));
        assert_ne!(nearest, Some(other_label));

        // The partition is caller-supplied; the anchor can probe another.
        let across = get_nearest_item(&db, anchor, "dog", FileType::Image).unwrap();
        assert_eq!(across, Some(other_label));
    }

    #[test]
    fn test_nearest_item_none_without_embedding() {
        let db = test_db();
        let anchor = add_item(&db, "cat", None);
        add_item(&db, "cat", Some(&[1.0, 0.0]));
        assert_eq!(get_nearest_item(&db, anchor, "cat", FileType::Image).unwrap(), None);

        let embedded = add_item(&db, "solo", Some(&[1.0, 0.0]));
        assert_eq!(
            get_nearest_item(&db, embedded, "solo", FileType::Image).unwrap(),
            None
        );
    }

    #[test]
    fn test_comparison_items_same_label_first() {
        let db = test_db();
        let anchor = add_item(&db, "cat", Some(&[1.0, 0.0]));
        let sibling = add_item(&db, "cat", Some(&[0.8, 0.2]));
        for _ in 0..5 {
            add_item(&db, "dog", Some(&[0.5, 0.5]));
        }

        let result = get_comparison_items(&db, &config(), anchor).unwrap();
        assert_eq!(result[0], sibling);
        assert!(result.len() <= config().comparison_count);
        assert!(!result.contains(&anchor));
        // No duplicate of the same-label pick in the global tail.
        assert_eq!(result.iter().filter(|id| **id == sibling).count(), 1);
    }

    #[test]
    fn test_comparison_items_empty_without_embedding() {
        let db = test_db();
        let anchor = add_item(&db, "cat", None);
        add_item(&db, "cat", Some(&[1.0, 0.0]));
        assert!(get_comparison_items(&db, &config(), anchor).unwrap().is_empty());
    }

    #[test]
    fn test_shared_tags_pull_items_closer() {
        let db = test_db();
        let anchor = add_item(&db, "cat", Some(&[1.0, 0.0]));
        let tagged = add_item(&db, "dog", Some(&[0.0, 1.0]));
        let untagged = add_item(&db, "dog", Some(&[0.0, 1.0]));

        let mut tags: BTreeMap<String, Vec<String>> = BTreeMap::new();
        tags.insert("color".into(), vec!["black".into()]);
        tags.insert("mood".into(), vec!["calm".into()]);
        db.add_tags(anchor, &tags).unwrap();
        db.add_tags(tagged, &tags).unwrap();

        let item = db.require_item(anchor).unwrap();
        let shared = shared_tag_counts(&db, &item).unwrap();
        // Two tag pairs plus the shared filetype pseudo-tag.
        assert_eq!(shared.get(&tagged), Some(&3));
        assert_eq!(shared.get(&untagged), Some(&1));
    }

    #[test]
    fn test_pseudo_tags_count_toward_overlap() {
        let db = test_db();
        // Anchor and both candidates share the label; only the Image
        // candidate shares the filetype too, and its extra overlap outweighs
        // the Video candidate's smaller visual distance.
        let anchor = add_item(&db, "cat", Some(&[1.0, 0.0]));
        let same_type = add_typed_item(&db, "cat", FileType::Image, Some(&[0.8, 0.6]));
        let other_type = add_typed_item(
            &db,
            "cat",
            FileType::Video,
            Some(&[0.9, (0.19f32).sqrt()]),
        );

        let item = db.require_item(anchor).unwrap();
        let shared = shared_tag_counts(&db, &item).unwrap();
        assert_eq!(shared.get(&same_type), Some(&2));
        assert_eq!(shared.get(&other_type), Some(&1));

        let result = get_comparison_items(&db, &config(), anchor).unwrap();
        assert_eq!(result[0], same_type);
    }
}
