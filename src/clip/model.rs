//! ONNX Runtime CLIP visual encoder.

use anyhow::{anyhow, Result};
use image::DynamicImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use super::Embedder;

const INPUT_SIZE: u32 = 224;

/// CLIP ViT-B/32 visual encoder (ONNX export).
/// Source: https://huggingface.co/Qdrant/clip-ViT-B-32-vision
const VISUAL_MODEL_FILE: &str = "clip-vit-b32-vision.onnx";
const VISUAL_MODEL_URL: &str =
    "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx";

/// The session is process-wide; embedding requests serialize on the mutex.
static VISUAL_MODEL: OnceLock<Mutex<Session>> = OnceLock::new();

/// Visual encoder backed by ONNX Runtime, lazily initialized on first use.
pub struct OnnxClipModel {
    models_dir: PathBuf,
}

impl OnnxClipModel {
    pub fn new(models_dir: PathBuf) -> Self {
        Self { models_dir }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if VISUAL_MODEL.get().is_some() {
            return Ok(());
        }

        let model_path = ensure_model(&self.models_dir, VISUAL_MODEL_FILE, VISUAL_MODEL_URL)?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)?;

        let _ = VISUAL_MODEL.set(Mutex::new(session));
        Ok(())
    }
}

impl Embedder for OnnxClipModel {
    fn embed(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        self.ensure_initialized()?;
        run_visual_encoder(image)
    }
}

/// Download a model file if it doesn't exist yet.
fn ensure_model(models_dir: &Path, filename: &str, url: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading CLIP model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        let mut file = std::fs::File::create(&model_path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        tracing::info!(model = %filename, path = ?model_path, "CLIP model downloaded");
    }

    Ok(model_path)
}

fn run_visual_encoder(img: &DynamicImage) -> Result<Vec<f32>> {
    let mut model = VISUAL_MODEL
        .get()
        .ok_or_else(|| anyhow!("Visual model not initialized"))?
        .lock()
        .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

    let resized = img.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    // CLIP normalization constants (ImageNet stats)
    let mean = [0.48145466, 0.4578275, 0.40821073];
    let std = [0.26862954, 0.26130258, 0.27577711];

    // NCHW layout, (pixel/255 - mean) / std
    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut input_data = vec![0.0f32; 3 * plane];

    for y in 0..INPUT_SIZE as usize {
        for x in 0..INPUT_SIZE as usize {
            let pixel = rgb.get_pixel(x as u32, y as u32);
            let idx = y * INPUT_SIZE as usize + x;

            input_data[idx] = ((pixel[0] as f32 / 255.0) - mean[0]) / std[0];
            input_data[plane + idx] = ((pixel[1] as f32 / 255.0) - mean[1]) / std[1];
            input_data[2 * plane + idx] = ((pixel[2] as f32 / 255.0) - mean[2]) / std[2];
        }
    }

    let input_tensor = Tensor::from_array((
        [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
        input_data.into_boxed_slice(),
    ))?;

    let outputs = model.run(ort::inputs!["pixel_values" => input_tensor])?;

    let embedding_output = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("No embedding output"))?;

    let (_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

    // L2 normalize so downstream dot products are cosine similarities.
    let embedding: Vec<f32> = embedding_data.to_vec();
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm > 0.0 {
        Ok(embedding.iter().map(|x| x / norm).collect())
    } else {
        Ok(embedding)
    }
}
