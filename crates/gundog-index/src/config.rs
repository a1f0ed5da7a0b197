//! Project configuration (`config.yaml`) for a single index.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::scanner;

/// Configuration for one index, loaded from `.<index>/config.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
    #[serde(default)]
    pub recency: RecencyConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
}

/// One ingestion root with glob and ignore rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: PathBuf,
    pub glob: String,
    /// Opaque tag propagated onto every document from this source.
    #[serde(rename = "type", default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub ignore_preset: Option<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default = "default_true")]
    pub use_gitignore: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_model")]
    pub model: String,
    /// Output dimension of the configured model.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// OpenAI-compatible embeddings endpoint serving the model.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            dimension: default_dimension(),
            endpoint: default_endpoint(),
            api_key: None,
        }
    }
}

/// Vector store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// Append-only float32 matrix with exact kNN. Suited to small corpora.
    #[serde(rename = "dense-file")]
    DenseFile,
    /// Column-major store with a coarse ANN index. Approximate kNN.
    #[serde(rename = "columnar-ann")]
    ColumnarAnn,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::DenseFile => "dense-file",
            StorageBackend::ColumnarAnn => "columnar-ann",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_expand_threshold")]
    pub expand_threshold: f32,
    #[serde(default = "default_max_expand_depth")]
    pub max_expand_depth: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            expand_threshold: default_expand_threshold(),
            max_expand_depth: default_max_expand_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_half")]
    pub bm25_weight: f64,
    #[serde(default = "default_half")]
    pub vector_weight: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bm25_weight: 0.5,
            vector_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecencyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_recency_weight")]
    pub weight: f64,
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
}

impl Default for RecencyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            weight: default_recency_weight(),
            half_life_days: default_half_life_days(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}
fn default_dimension() -> usize {
    384
}
fn default_endpoint() -> String {
    "http://127.0.0.1:8080/v1/embeddings".to_string()
}
fn default_backend() -> StorageBackend {
    StorageBackend::DenseFile
}
fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_expand_threshold() -> f32 {
    0.5
}
fn default_max_expand_depth() -> usize {
    2
}
fn default_half() -> f64 {
    0.5
}
fn default_recency_weight() -> f64 {
    0.15
}
fn default_half_life_days() -> f64 {
    30.0
}
fn default_max_tokens() -> usize {
    512
}
fn default_overlap_tokens() -> usize {
    50
}

impl ProjectConfig {
    /// Load and validate a project config file.
    ///
    /// Malformed files are refused at startup with the offending path and,
    /// where the parser provides one, the line/column.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IndexError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: ProjectConfig = serde_yaml::from_str(&content).map_err(|e| {
            let loc = e
                .location()
                .map(|l| format!(":{}:{}", l.line(), l.column()))
                .unwrap_or_default();
            IndexError::Config(format!("{}{loc}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate option values and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(IndexError::Config(
                "embedding.dimension must be > 0".to_string(),
            ));
        }
        for w in [self.hybrid.bm25_weight, self.hybrid.vector_weight] {
            if !(0.0..=1.0).contains(&w) {
                return Err(IndexError::Config(
                    "hybrid weights must be in [0.0, 1.0]".to_string(),
                ));
            }
        }
        for t in [
            self.graph.similarity_threshold,
            self.graph.expand_threshold,
        ] {
            if !(0.0..=1.0).contains(&t) {
                return Err(IndexError::Config(
                    "graph thresholds must be in [0.0, 1.0]".to_string(),
                ));
            }
        }
        if self.recency.half_life_days <= 0.0 {
            return Err(IndexError::Config(
                "recency.half_life_days must be > 0".to_string(),
            ));
        }
        if self.chunking.max_tokens == 0 {
            return Err(IndexError::Config(
                "chunking.max_tokens must be > 0".to_string(),
            ));
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(IndexError::Config(
                "chunking.overlap_tokens must be smaller than max_tokens".to_string(),
            ));
        }
        for source in &self.sources {
            if let Some(ref preset) = source.ignore_preset {
                if scanner::preset_patterns(preset).is_none() {
                    return Err(IndexError::Config(format!(
                        "unknown ignore_preset '{preset}' for source {}",
                        source.path.display()
                    )));
                }
            }
        }
        Ok(())
    }
}
