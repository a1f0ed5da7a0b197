//! Index manifest: the authoritative record of what has been ingested.
//!
//! The manifest on disk always reflects a completed ingest. Writers go
//! through a shadow file plus rename (see [`crate::fsutil`]); its atomic
//! replacement is the point at which ingest effects become visible.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::config::{ChunkingConfig, ProjectConfig};
use crate::error::{IndexError, Result};
use crate::fsutil;

/// Manifest format version.
pub const MANIFEST_VERSION: u32 = 2;

/// Per-index metadata tracking ingested files and embedding identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: u32,
    /// Identifier of the embedding model the vectors were produced with.
    pub model: String,
    /// Embedding dimension.
    pub dimension: usize,
    /// Vector store backend the index was built with.
    pub backend: String,
    pub chunking: ChunkingConfig,
    /// Relative path -> file state. Ordered for deterministic serialization.
    pub files: BTreeMap<String, FileEntry>,
    /// Seconds since the epoch of the last completed ingest.
    pub last_ingest: Option<u64>,
}

/// State of one ingested file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub doc_id: String,
    pub content_hash: String,
    pub mtime: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,
    /// Line spans of the file's chunks, in chunk order. A single span
    /// covering the whole file when chunking is off.
    pub chunks: Vec<ChunkSpan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_last_commit_time: Option<i64>,
}

/// Where a chunk sits within its file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkSpan {
    pub start_line: usize,
    pub end_line: usize,
    pub token_count: usize,
    pub content_hash: String,
}

impl IndexManifest {
    /// Create an empty manifest carrying the configured identity.
    pub fn empty(config: &ProjectConfig) -> Self {
        Self {
            version: MANIFEST_VERSION,
            model: config.embedding.model.clone(),
            dimension: config.embedding.dimension,
            backend: config.storage.backend.as_str().to_string(),
            chunking: config.chunking,
            files: BTreeMap::new(),
            last_ingest: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: IndexManifest =
            serde_json::from_str(&content).map_err(|e| IndexError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if manifest.version > MANIFEST_VERSION {
            return Err(IndexError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("unsupported manifest version {}", manifest.version),
            });
        }
        Ok(manifest)
    }

    /// Load the manifest if present, otherwise start empty.
    pub fn load_or_empty(path: &Path, config: &ProjectConfig) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::empty(config))
        }
    }

    /// Refuse to use an index whose identity differs from the configured
    /// model, dimension, or backend. A mismatch requires a full rebuild;
    /// partial reindexing against foreign vectors is never attempted.
    pub fn ensure_compatible(&self, config: &ProjectConfig) -> Result<()> {
        if self.model != config.embedding.model {
            return Err(IndexError::ManifestMismatch {
                field: "embedding model",
                expected: config.embedding.model.clone(),
                found: self.model.clone(),
            });
        }
        if self.dimension != config.embedding.dimension {
            return Err(IndexError::ManifestMismatch {
                field: "embedding dimension",
                expected: config.embedding.dimension.to_string(),
                found: self.dimension.to_string(),
            });
        }
        if self.backend != config.storage.backend.as_str() {
            return Err(IndexError::ManifestMismatch {
                field: "storage backend",
                expected: config.storage.backend.as_str().to_string(),
                found: self.backend.clone(),
            });
        }
        Ok(())
    }

    /// Commit the manifest to disk (shadow write, fsync, rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| IndexError::Store(format!("serialize manifest: {e}")))?;
        fsutil::write_atomic(path, content.as_bytes())?;
        Ok(())
    }

    pub fn stamp_ingest(&mut self) {
        self.last_ingest = Some(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        );
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.files.values().map(|f| f.chunks.len()).sum()
    }

    /// All ids (doc or chunk) belonging to a file entry.
    pub fn ids_for(&self, entry: &FileEntry) -> Vec<String> {
        if self.chunking.enabled {
            (0..entry.chunks.len())
                .map(|i| crate::doc_id::chunk_id(&entry.doc_id, i))
                .collect()
        } else {
            vec![entry.doc_id.clone()]
        }
    }

    /// Map from doc_id to relative path.
    pub fn doc_paths(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(path, entry)| (entry.doc_id.clone(), path.clone()))
            .collect()
    }
}
