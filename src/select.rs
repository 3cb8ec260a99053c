//! Weighted random serving: turn a wire-shaped tag query into one picked
//! item, honoring the pseudo-tag directives the front end sends.

use anyhow::{anyhow, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::HashMap;

use crate::db::items::{FileState, FileType};
use crate::pipeline::Session;
use crate::query::{self, ItemInfo, TagCondition, TagQuery};

/// How serving skews its random pick across the matched set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WeightMode {
    #[default]
    Uniform,
    /// Favor higher ids; newer items surface more often.
    Recent,
    /// Favor rare labels.
    Sparse,
    /// Favor common labels.
    Dense,
}

impl WeightMode {
    /// Unrecognized values fall back to uniform rather than failing the
    /// request.
    pub fn parse(value: &str) -> Self {
        match value {
            "recent" => WeightMode::Recent,
            "sparse" => WeightMode::Sparse,
            "dense" => WeightMode::Dense,
            _ => WeightMode::Uniform,
        }
    }
}

/// Pull the serving directives out of a query: the `random` pseudo-tag
/// names the weight mode, any entry containing the `all` keyword is
/// dropped wholesale, and `play` entries are queueing hints with no filter
/// meaning. Returns the cleaned query.
pub fn extract_directives(mut query: TagQuery) -> (TagQuery, WeightMode) {
    let mut mode = WeightMode::Uniform;

    query.retain(|(name, _), values| {
        if name == "random" {
            if let Some(value) = values.first() {
                mode = WeightMode::parse(value);
            }
            return false;
        }
        if name == "play" {
            return false;
        }
        !values.iter().any(|v| v == "all")
    });

    (query, mode)
}

/// Per-item weights for a result set. The set's own order matters for
/// `Recent`: items are id-ordered, so later indices are newer.
pub fn weights(items: &[ItemInfo], mode: WeightMode) -> Vec<f64> {
    let n = items.len();
    match mode {
        WeightMode::Uniform => vec![1.0; n],
        WeightMode::Recent => (0..n)
            .map(|i| 1.0 / (3.0 * n as f64 / 2.0 - i as f64))
            .collect(),
        WeightMode::Sparse | WeightMode::Dense => {
            let mut class_sizes: HashMap<&str, usize> = HashMap::new();
            for item in items {
                *class_sizes.entry(item.label.as_str()).or_default() += 1;
            }
            items
                .iter()
                .map(|item| {
                    let size = class_sizes[item.label.as_str()] as f64;
                    match mode {
                        WeightMode::Sparse => 1.0 / size.sqrt(),
                        _ => size.sqrt(),
                    }
                })
                .collect()
        }
    }
}

pub fn pick_weighted<'a, R: Rng>(
    items: &'a [ItemInfo],
    mode: WeightMode,
    rng: &mut R,
) -> Result<&'a ItemInfo> {
    if items.is_empty() {
        return Err(anyhow!("no items match the query"));
    }
    let distribution = WeightedIndex::new(weights(items, mode))?;
    Ok(&items[distribution.sample(rng)])
}

/// Build the effective serving query from wire triples: caller tags plus
/// the standing state filter (anything past the crop/modify stages is
/// servable), plus an optional filetype restriction.
pub fn build_serving_query(
    wire_tags: &[(String, String, String)],
    filetype: Option<FileType>,
) -> Result<TagQuery> {
    let mut query = TagQuery::new();
    for (name, condition, value) in wire_tags {
        query::push_wire_tag(&mut query, name, condition, value)?;
    }

    query
        .entry(("state".to_string(), TagCondition::Is))
        .or_default()
        .extend(
            [
                FileState::NeedsLabel,
                FileState::NeedsClip,
                FileState::NeedsTags,
                FileState::Complete,
            ]
            .map(|s| s.ordinal().to_string()),
        );

    if let Some(filetype) = filetype {
        query
            .entry(("filetype".to_string(), TagCondition::Is))
            .or_default()
            .push(filetype.ordinal().to_string());
    }

    Ok(query)
}

/// One random servable item for a wire query.
pub fn random_item(
    session: &Session,
    wire_tags: &[(String, String, String)],
    filetype: Option<FileType>,
) -> Result<ItemInfo> {
    let query = build_serving_query(wire_tags, filetype)?;
    let (query, mode) = extract_directives(query);
    let items = query::evaluate(&session.db, &session.config.media.root, &query, None)?;
    let mut rng = rand::thread_rng();
    pick_weighted(&items, mode, &mut rng).cloned()
}
