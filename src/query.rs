//! Tag-predicate query evaluation.
//!
//! A query is a mapping of `(name, condition) -> [values]` evaluated against
//! the item catalog and the tag table. Entries combine with logical AND,
//! values within one entry with logical OR. `id`, `state`, `label`,
//! `filetype` and `width` are special-cased; every other name filters
//! through the tag table.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::db::items::{FileState, FileType};
use crate::db::{Database, Item};
use crate::error::CurataError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TagCondition {
    Is,
    IsNot,
    Contains,
    DoesNotContain,
    IsNull,
    IsNotNull,
}

impl TagCondition {
    pub fn parse(value: &str) -> Result<Self, CurataError> {
        match value {
            "is" => Ok(TagCondition::Is),
            "is_not" => Ok(TagCondition::IsNot),
            "contains" => Ok(TagCondition::Contains),
            "does_not_contain" => Ok(TagCondition::DoesNotContain),
            "is_null" => Ok(TagCondition::IsNull),
            "is_not_null" => Ok(TagCondition::IsNotNull),
            other => Err(CurataError::UnknownCondition(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TagCondition::Is => "is",
            TagCondition::IsNot => "is_not",
            TagCondition::Contains => "contains",
            TagCondition::DoesNotContain => "does_not_contain",
            TagCondition::IsNull => "is_null",
            TagCondition::IsNotNull => "is_not_null",
        }
    }
}

/// Ephemeral query shape: `(tag name, condition) -> OR-list of values`.
pub type TagQuery = BTreeMap<(String, TagCondition), Vec<String>>;

/// Fold a wire triple into a query, accumulating duplicate name+condition
/// pairs as an OR-list. Names and values are trimmed and lowercased the way
/// the serving layer sends them.
pub fn push_wire_tag(
    query: &mut TagQuery,
    name: &str,
    condition: &str,
    value: &str,
) -> Result<(), CurataError> {
    let condition = TagCondition::parse(condition)?;
    query
        .entry((name.trim().to_lowercase(), condition))
        .or_default()
        .push(value.trim().to_lowercase());
    Ok(())
}

/// The full public shape of a query result row, as consumed by serving and
/// front-end callers.
#[derive(Debug, Clone)]
pub struct ItemInfo {
    pub id: i64,
    pub filetype: FileType,
    pub mime_type: &'static str,
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub state: FileState,
    pub label: String,
}

impl ItemInfo {
    fn from_item(item: &Item, media_root: &Path) -> Self {
        Self {
            id: item.id,
            filetype: item.filetype,
            mime_type: item.filetype.mime_type(),
            path: item.path(media_root),
            width: item.width,
            height: item.height,
            state: item.state,
            label: item.label.clone(),
        }
    }
}

/// Evaluate a query. Results are id-ordered unless `order_by` names item
/// fields (`label`, `id`, `state`, `filetype`, `width`, `height`) to sort by.
pub fn evaluate(
    db: &Database,
    media_root: &Path,
    query: &TagQuery,
    order_by: Option<&[&str]>,
) -> Result<Vec<ItemInfo>> {
    let mut items = db.all_items()?;

    // Tag rows grouped by name, then per item, loaded once per evaluation.
    let mut tags_by_name: HashMap<String, HashMap<i64, Vec<String>>> = HashMap::new();
    for row in db.all_tag_rows()? {
        tags_by_name
            .entry(row.name)
            .or_default()
            .entry(row.item_id)
            .or_default()
            .push(row.value);
    }

    for ((name, condition), values) in query {
        items = match name.as_str() {
            "id" => filter_id(items, *condition, values),
            "state" => filter_state(items, *condition, values)?,
            "label" => filter_label(items, *condition, values, &tags_by_name),
            "filetype" => filter_filetype(items, *condition, values),
            "width" => filter_width(items, *condition, values),
            _ => filter_generic(items, name, *condition, values, &tags_by_name),
        };
    }

    if let Some(fields) = order_by {
        sort_items(&mut items, fields);
    }

    Ok(items
        .iter()
        .map(|item| ItemInfo::from_item(item, media_root))
        .collect())
}

/// Evaluate into an id-keyed map for callers that look results up by id.
pub fn evaluate_map(
    db: &Database,
    media_root: &Path,
    query: &TagQuery,
) -> Result<BTreeMap<i64, ItemInfo>> {
    let infos = evaluate(db, media_root, query, None)?;
    Ok(infos.into_iter().map(|info| (info.id, info)).collect())
}

fn filter_id(items: Vec<Item>, condition: TagCondition, values: &[String]) -> Vec<Item> {
    let ids: HashSet<i64> = values.iter().filter_map(|v| v.parse().ok()).collect();
    match condition {
        TagCondition::Is => items.into_iter().filter(|i| ids.contains(&i.id)).collect(),
        TagCondition::IsNot => items.into_iter().filter(|i| !ids.contains(&i.id)).collect(),
        _ => items,
    }
}

fn filter_state(
    items: Vec<Item>,
    condition: TagCondition,
    values: &[String],
) -> Result<Vec<Item>> {
    // Values may be ordinals, numeric strings, or named aliases; all are
    // normalized before filtering, and an unknown alias is an error.
    let mut states = HashSet::new();
    for value in values {
        states.insert(FileState::parse(value)?);
    }
    Ok(match condition {
        TagCondition::Is => items
            .into_iter()
            .filter(|i| states.contains(&i.state))
            .collect(),
        TagCondition::IsNot => items
            .into_iter()
            .filter(|i| !states.contains(&i.state))
            .collect(),
        _ => items,
    })
}

fn filter_label(
    items: Vec<Item>,
    condition: TagCondition,
    values: &[String],
    tags_by_name: &HashMap<String, HashMap<i64, Vec<String>>>,
) -> Vec<Item> {
    match condition {
        // `Is` also matches any historical label recorded as a labelplus
        // tag, so renamed categories stay reachable under old names.
        TagCondition::Is => {
            let empty = HashMap::new();
            let labelplus = tags_by_name.get("labelplus").unwrap_or(&empty);
            items
                .into_iter()
                .filter(|i| {
                    values.iter().any(|v| *v == i.label)
                        || labelplus
                            .get(&i.id)
                            .is_some_and(|vs| vs.iter().any(|v| values.contains(v)))
                })
                .collect()
        }
        TagCondition::IsNot => items
            .into_iter()
            .filter(|i| !values.iter().any(|v| *v == i.label))
            .collect(),
        TagCondition::Contains => items
            .into_iter()
            .filter(|i| values.iter().any(|v| i.label.contains(v.as_str())))
            .collect(),
        TagCondition::DoesNotContain => items
            .into_iter()
            .filter(|i| !values.iter().any(|v| i.label.contains(v.as_str())))
            .collect(),
        // Labels are stored as strings and are never NULL: empty labels are
        // the empty string. IsNull therefore matches nothing and IsNotNull
        // everything.
        TagCondition::IsNull => Vec::new(),
        TagCondition::IsNotNull => items,
    }
}

fn filter_filetype(items: Vec<Item>, condition: TagCondition, values: &[String]) -> Vec<Item> {
    // Aliases normalize to the ordinal string; anything else passes through
    // and is compared against the ordinal as-is.
    let normalized: Vec<String> = values
        .iter()
        .map(|v| match v.as_str() {
            "image" | "images" => FileType::Image.ordinal().to_string(),
            "video" | "videos" => FileType::Video.ordinal().to_string(),
            other => other.to_string(),
        })
        .collect();

    let ordinal = |item: &Item| item.filetype.ordinal().to_string();

    match condition {
        TagCondition::Is => items
            .into_iter()
            .filter(|i| normalized.contains(&ordinal(i)))
            .collect(),
        TagCondition::IsNot => items
            .into_iter()
            .filter(|i| !normalized.contains(&ordinal(i)))
            .collect(),
        TagCondition::Contains => items
            .into_iter()
            .filter(|i| normalized.iter().any(|v| ordinal(i).contains(v.as_str())))
            .collect(),
        TagCondition::DoesNotContain => items
            .into_iter()
            .filter(|i| !normalized.iter().any(|v| ordinal(i).contains(v.as_str())))
            .collect(),
        // The filetype column is NOT NULL.
        TagCondition::IsNull => Vec::new(),
        TagCondition::IsNotNull => items,
    }
}

fn filter_width(items: Vec<Item>, condition: TagCondition, values: &[String]) -> Vec<Item> {
    // A width entry takes exactly one value; multi-value entries are
    // silently skipped.
    if values.len() != 1 {
        return items;
    }
    let Ok(width) = values[0].parse::<u32>() else {
        return items;
    };

    // `Is` means "at least this wide", `IsNot` means "narrower than this".
    // The two partition the corpus with no overlap and no gap.
    match condition {
        TagCondition::Is => items.into_iter().filter(|i| i.width >= width).collect(),
        TagCondition::IsNot => items.into_iter().filter(|i| i.width < width).collect(),
        _ => items,
    }
}

fn filter_generic(
    items: Vec<Item>,
    name: &str,
    condition: TagCondition,
    values: &[String],
    tags_by_name: &HashMap<String, HashMap<i64, Vec<String>>>,
) -> Vec<Item> {
    let empty = HashMap::new();
    let rows = tags_by_name.get(name).unwrap_or(&empty);

    let has_value_in = |item: &Item| {
        rows.get(&item.id)
            .is_some_and(|vs| vs.iter().any(|v| values.contains(v)))
    };
    let has_substring = |item: &Item| {
        rows.get(&item.id)
            .is_some_and(|vs| vs.iter().any(|v| values.iter().any(|q| v.contains(q.as_str()))))
    };

    match condition {
        TagCondition::Is => items.into_iter().filter(|i| has_value_in(i)).collect(),
        TagCondition::IsNot => items.into_iter().filter(|i| !has_value_in(i)).collect(),
        TagCondition::Contains => items.into_iter().filter(|i| has_substring(i)).collect(),
        TagCondition::DoesNotContain => {
            items.into_iter().filter(|i| !has_substring(i)).collect()
        }
        // IsNull keeps items with no row of this name at all. IsNotNull is
        // NOT its negation: it also keeps items without the name (it
        // excludes by name presence). Long-standing behavior that
        // get_untagged_ids depends on; do not "fix" without a migration
        // plan.
        TagCondition::IsNull => items
            .into_iter()
            .filter(|i| !rows.contains_key(&i.id))
            .collect(),
        TagCondition::IsNotNull => items
            .into_iter()
            .filter(|i| !rows.contains_key(&i.id))
            .collect(),
    }
}

fn sort_items(items: &mut [Item], fields: &[&str]) {
    items.sort_by(|a, b| {
        for field in fields {
            let ordering = match *field {
                "id" => a.id.cmp(&b.id),
                "label" => a.label.cmp(&b.label),
                "state" => a.state.cmp(&b.state),
                "filetype" => a.filetype.ordinal().cmp(&b.filetype.ordinal()),
                "width" => a.width.cmp(&b.width),
                "height" => a.height.cmp(&b.height),
                _ => std::cmp::Ordering::Equal,
            };
            if ordering != std::cmp::Ordering::Equal {
                return ordering;
            }
        }
        std::cmp::Ordering::Equal
    });
}

/// Ids of labeled-stage items lacking any `tag_name` tag, subject to extra
/// constraints, ordered by (label, id). Drives "what still needs tagging"
/// work queues.
pub fn get_untagged_ids(
    db: &Database,
    media_root: &Path,
    tag_name: &str,
    constraints: &[(String, TagCondition, String)],
) -> Result<Vec<i64>> {
    let mut query = TagQuery::new();
    for (name, condition, value) in constraints {
        query
            .entry((name.clone(), *condition))
            .or_default()
            .push(value.clone());
    }

    // Excludes items where the tag name already exists (IsNotNull keeps
    // only items without the name).
    query
        .entry((tag_name.to_string(), TagCondition::IsNotNull))
        .or_default()
        .push("1".to_string());

    query.entry(("state".to_string(), TagCondition::Is)).or_default().extend([
        FileState::NeedsClip.ordinal().to_string(),
        FileState::NeedsTags.ordinal().to_string(),
        FileState::Complete.ordinal().to_string(),
    ]);

    let infos = evaluate(db, media_root, &query, Some(&["label", "id"]))?;
    Ok(infos.into_iter().map(|info| info.id).collect())
}
