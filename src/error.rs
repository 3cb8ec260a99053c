//! Typed errors for pipeline invariants. Most fallible paths use `anyhow`;
//! these variants exist where callers branch on the failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CurataError {
    /// A transition into a labeled stage was requested for an unlabeled
    /// item without supplying a label.
    #[error("label required for item {item_id}: state {state} -> {new_state}")]
    LabelRequired {
        item_id: i64,
        state: i32,
        new_state: i32,
    },

    #[error("unknown file state: {0}")]
    UnknownState(String),

    #[error("unrecognized file type: {0}")]
    UnknownFileType(String),

    #[error("unknown category folder: {0}")]
    UnknownCategory(String),

    #[error("unknown tag condition: {0}")]
    UnknownCondition(String),

    #[error("unknown save mode: {0}")]
    UnknownSaveMode(String),

    #[error("item {0} not found")]
    ItemNotFound(i64),

    /// `state`, `label` and `filetype` are item columns, not tags.
    #[error("tag name is reserved: {0}")]
    ForbiddenTag(String),
}
