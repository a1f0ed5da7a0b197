//! Error types for the retrieval engine.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, IndexError>;

/// Errors surfaced by the engine. The daemon maps these onto wire codes.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("embedding failed: {0}")]
    Embed(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("corrupt index file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("index was built with {field} '{found}' but '{expected}' is configured; run a full reindex")]
    ManifestMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("ingest canceled")]
    Canceled,
}

impl IndexError {
    /// Whether the error means the index must not be opened for queries.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexError::ManifestMismatch { .. } | IndexError::Corrupt { .. }
        )
    }
}
