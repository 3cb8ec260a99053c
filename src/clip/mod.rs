//! CLIP embeddings: generation, storage codec, and distance.
//!
//! Embeddings persist as base64-encoded little-endian f32 dumps so the
//! encode/decode round trip is bit-exact.

pub mod model;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::DynamicImage;
use std::path::Path;

use crate::config::Config;
use crate::db::items::FileType;
use crate::db::Database;
use crate::imaging;

/// Seam between the pipeline and the actual encoder, so tests can substitute
/// a deterministic stub for the ONNX session.
pub trait Embedder: Send {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>>;
}

pub struct ClipIndex {
    embedder: Box<dyn Embedder>,
}

impl ClipIndex {
    pub fn new(embedder: Box<dyn Embedder>) -> Self {
        Self { embedder }
    }

    /// Default index backed by the ONNX visual encoder.
    pub fn onnx(config: &Config) -> Self {
        Self::new(Box::new(model::OnnxClipModel::new(
            config.clip.models_dir.clone(),
        )))
    }

    pub fn embed_image(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        self.embedder.embed(image)
    }

    pub fn embed_file(&self, path: &Path) -> Result<Vec<f32>> {
        let image = imaging::load_image(path)?;
        let thumb = imaging::thumbnail(&image, 224);
        self.embedder.embed(&thumb)
    }

    /// Embed an item's current file and persist the encoded vector. Videos
    /// have no visual embedding and are an error here.
    pub fn process_item(&self, config: &Config, db: &Database, item_id: i64) -> Result<String> {
        let item = db.require_item(item_id)?;
        if item.filetype != FileType::Image {
            return Err(anyhow!("item {} is not an image", item_id));
        }
        let embedding = self.embed_file(&item.path(&config.media.root))?;
        let encoded = embedding_to_base64(&embedding);
        db.set_embedding(item_id, Some(&encoded))?;
        Ok(encoded)
    }

    /// Backfill embeddings for every labeled-stage image that lacks one.
    /// Per-item failures are logged and skipped so one bad file cannot
    /// stall the sweep.
    pub fn embed_unclipped_items(&self, config: &Config, db: &Database) -> Result<usize> {
        let mut embedded = 0;
        for item in db.unclipped_items()? {
            match self.process_item(config, db, item.id) {
                Ok(_) => embedded += 1,
                Err(e) => {
                    tracing::warn!(item_id = item.id, error = %e, "Failed to embed item");
                }
            }
        }
        Ok(embedded)
    }
}

pub fn embedding_to_base64(embedding: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    BASE64.encode(bytes)
}

pub fn base64_to_embedding(encoded: &str) -> Result<Vec<f32>> {
    let bytes = BASE64.decode(encoded)?;
    if bytes.len() % 4 != 0 {
        return Err(anyhow!("embedding blob length {} not a multiple of 4", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// CLIP distance between two normalized embeddings: `1 - dot`. 0 for
/// identical directions, growing as they diverge.
pub fn clip_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    1.0 - dot
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_round_trip_exact() {
        let embedding = vec![0.25f32, -1.5, 3.25e-8, f32::MIN_POSITIVE, 0.0, -0.0];
        let encoded = embedding_to_base64(&embedding);
        let decoded = base64_to_embedding(&encoded).unwrap();
        assert_eq!(decoded.len(), embedding.len());
        for (a, b) in embedding.iter().zip(decoded.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_base64_rejects_truncated_blob() {
        let encoded = BASE64.encode([1u8, 2, 3]);
        assert!(base64_to_embedding(&encoded).is_err());
    }

    #[test]
    fn test_clip_distance() {
        let a = vec![1.0, 0.0];
        let b = vec![1.0, 0.0];
        let c = vec![0.0, 1.0];
        let d = vec![-1.0, 0.0];
        assert!((clip_distance(&a, &b)).abs() < 1e-6);
        assert!((clip_distance(&a, &c) - 1.0).abs() < 1e-6);
        assert!((clip_distance(&a, &d) - 2.0).abs() < 1e-6);
    }
}
