//! Curata: a personal media curation pipeline.
//!
//! Items move through a fixed set of stages (crop, modify, label, embed,
//! tag, complete); each item's on-disk location is derived from its state
//! and label, and a filesystem watcher reconciles manual moves back into
//! the catalog. Similarity search runs over CLIP embeddings stored inline
//! in SQLite.

pub mod cache;
pub mod cleanup;
pub mod clip;
pub mod config;
pub mod db;
pub mod error;
pub mod imaging;
pub mod logging;
pub mod pipeline;
pub mod query;
pub mod select;
pub mod similarity;
pub mod watcher;

pub use config::Config;
pub use db::{Database, FileState, FileType, Item};
pub use error::CurataError;
pub use pipeline::Session;
