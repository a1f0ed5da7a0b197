//! Vector storage backends.
//!
//! Two interchangeable backends implement the same capability set:
//! [`dense::DenseFileStore`] (exact kNN over an append-only float32
//! matrix) and [`columnar::ColumnarAnnStore`] (approximate kNN over a
//! column-major store with a coarse inverted-file index).

pub mod columnar;
pub mod dense;

use std::cmp::Ordering;
use std::path::Path;

use crate::config::StorageBackend;
use crate::error::Result;

/// Capability set of a vector backend.
///
/// All stored vectors are L2-normalized on upsert, so dot products are
/// cosines. `knn` results are sorted by score descending with ties broken
/// by ascending id.
pub trait VectorStore: Send + Sync {
    /// Insert or replace a vector. Re-upserting an identical `(id,
    /// vector)` pair is a no-op.
    fn upsert(&mut self, id: &str, vector: Vec<f32>) -> Result<()>;

    /// Remove a vector. Returns whether it was present.
    fn delete(&mut self, id: &str) -> Result<bool>;

    fn get(&self, id: &str) -> Option<Vec<f32>>;

    fn all_ids(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Top-k nearest by cosine, keeping results with cosine >= `min_score`.
    fn knn(&self, query: &[f32], k: usize, min_score: Option<f32>) -> Vec<(String, f32)>;

    /// All unordered pairs with cosine >= `threshold`; used for the
    /// ingest-time graph rebuild.
    fn all_pairs_above(&self, threshold: f32) -> Vec<(String, String, f32)>;

    fn clear(&mut self);

    /// Persist to the store's directory (shadow-then-rename).
    fn save(&mut self) -> Result<()>;
}

/// Open the configured backend rooted at `dir`, loading any persisted
/// state.
pub fn open_store(
    backend: StorageBackend,
    dir: &Path,
    dimension: usize,
) -> Result<Box<dyn VectorStore>> {
    match backend {
        StorageBackend::DenseFile => {
            Ok(Box::new(dense::DenseFileStore::open(dir, dimension)?))
        }
        StorageBackend::ColumnarAnn => {
            Ok(Box::new(columnar::ColumnarAnnStore::open(dir, dimension)?))
        }
    }
}

/// Shared scoring order: descending score, ties by ascending id.
pub(crate) fn sort_hits(hits: &mut Vec<(String, f32)>) {
    hits.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
}
