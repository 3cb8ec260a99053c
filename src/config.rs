use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub media: MediaConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub similarity: SimilarityConfig,

    #[serde(default)]
    pub clip: ClipConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Root of the managed media tree. The staging folders (`uncropped/`,
    /// `needsmodify/`, `unlabelled/`) and `items/{label}/` live under it.
    #[serde(default = "default_media_root")]
    pub root: PathBuf,

    /// Target height for processed images. Every image that reaches the
    /// post-crop stages is normalized to this height.
    #[serde(default = "default_media_height")]
    pub height: u32,
}

fn default_media_root() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("curata")
        .join("media")
}

fn default_media_height() -> u32 {
    800
}

impl MediaConfig {
    pub fn items_dir(&self) -> PathBuf {
        self.root.join("items")
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: default_media_root(),
            height: default_media_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Seconds between drain passes; also the debounce window for created
    /// events.
    #[serde(default = "default_process_time")]
    pub process_time_secs: u64,

    /// Deleted events wait `process_time_secs * deleted_scale` before being
    /// checked, to ride out transient delete-then-recreate windows.
    #[serde(default = "default_deleted_scale")]
    pub deleted_scale: u64,

    /// Additional directories walked at startup and watched alongside the
    /// media root (e.g. a sync-tool drop folder).
    #[serde(default)]
    pub extra_roots: Vec<PathBuf>,

    /// Filename substrings that are never scheduled for processing.
    #[serde(default = "default_banned_substrings")]
    pub banned_substrings: Vec<String>,
}

fn default_process_time() -> u64 {
    5
}

fn default_deleted_scale() -> u64 {
    3
}

fn default_banned_substrings() -> Vec<String> {
    vec![".TMP".to_string(), ".ini".to_string()]
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            process_time_secs: default_process_time(),
            deleted_scale: default_deleted_scale(),
            extra_roots: Vec::new(),
            banned_substrings: default_banned_substrings(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// How many random candidates to score when building a comparison set.
    /// The search is deliberately sampled, not exhaustive; tune with corpus
    /// size.
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,

    /// Embedding/tag blend for the guaranteed same-label pick.
    #[serde(default = "default_same_label_alpha")]
    pub same_label_alpha: f32,

    /// Embedding/tag blend for the sampled global candidates.
    #[serde(default = "default_global_alpha")]
    pub global_alpha: f32,

    /// Default size of a comparison set.
    #[serde(default = "default_comparison_count")]
    pub comparison_count: usize,
}

fn default_sample_cap() -> usize {
    500
}

fn default_same_label_alpha() -> f32 {
    0.3
}

fn default_global_alpha() -> f32 {
    0.2
}

fn default_comparison_count() -> usize {
    10
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            sample_cap: default_sample_cap(),
            same_label_alpha: default_same_label_alpha(),
            global_alpha: default_global_alpha(),
            comparison_count: default_comparison_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipConfig {
    /// Where downloaded ONNX models are stored.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default = "default_thumbnail_cache_size")]
    pub thumbnail_cache_size: usize,
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("curata")
        .join("models")
}

fn default_thumbnail_cache_size() -> usize {
    1000
}

impl Default for ClipConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            thumbnail_cache_size: default_thumbnail_cache_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("curata")
        .join("curata.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            media: MediaConfig::default(),
            watcher: WatcherConfig::default(),
            similarity: SimilarityConfig::default(),
            clip: ClipConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(config_path: &std::path::Path) -> Result<Self> {
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("curata")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("CURATA_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}
