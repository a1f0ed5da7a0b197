//! Dense-file vector backend.
//!
//! An append-only `D x N` float32 matrix (`vectors.bin`) with a sidecar
//! id list (`vectors.ids`). kNN is an exact full scan, which is the right
//! trade below roughly ten thousand vectors. Deletions tombstone rows;
//! compaction rewrites the matrix once tombstones exceed 20% of rows.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::embedding::normalize;
use crate::error::{IndexError, Result};
use crate::fsutil;
use crate::graph::dot;
use crate::store::{sort_hits, VectorStore};

const MATRIX_FILE: &str = "vectors.bin";
const IDS_FILE: &str = "vectors.ids";

const MAGIC: &[u8; 4] = b"GDVX";
const FORMAT_VERSION: u32 = 1;

/// Tombstone share that triggers compaction.
const COMPACT_THRESHOLD: f64 = 0.2;

pub struct DenseFileStore {
    dir: PathBuf,
    dim: usize,
    /// Row-major matrix, including tombstoned rows until compaction.
    rows: Vec<f32>,
    /// Row index -> id, aligned with `rows`.
    row_ids: Vec<String>,
    /// id -> live row index.
    live: HashMap<String, usize>,
    tombstones: usize,
}

impl DenseFileStore {
    /// Open the store rooted at `dir`, loading persisted state if present.
    pub fn open(dir: &Path, dim: usize) -> Result<Self> {
        let mut store = Self {
            dir: dir.to_path_buf(),
            dim,
            rows: Vec::new(),
            row_ids: Vec::new(),
            live: HashMap::new(),
            tombstones: 0,
        };
        store.load()?;
        Ok(store)
    }

    fn matrix_path(&self) -> PathBuf {
        self.dir.join(MATRIX_FILE)
    }

    fn ids_path(&self) -> PathBuf {
        self.dir.join(IDS_FILE)
    }

    fn row(&self, index: usize) -> &[f32] {
        &self.rows[index * self.dim..(index + 1) * self.dim]
    }

    fn row_count(&self) -> usize {
        self.row_ids.len()
    }

    /// Rewrite the matrix without tombstones, rows in id order.
    fn compact(&mut self) {
        let mut ids: Vec<&String> = self.live.keys().collect();
        ids.sort();

        let mut rows = Vec::with_capacity(self.live.len() * self.dim);
        let mut row_ids = Vec::with_capacity(self.live.len());
        let mut live = HashMap::with_capacity(self.live.len());
        for (new_row, id) in ids.into_iter().enumerate() {
            let old_row = self.live[id];
            rows.extend_from_slice(&self.rows[old_row * self.dim..(old_row + 1) * self.dim]);
            row_ids.push(id.clone());
            live.insert(id.clone(), new_row);
        }

        debug!(
            dropped = self.tombstones,
            kept = row_ids.len(),
            "compacted dense store"
        );
        self.rows = rows;
        self.row_ids = row_ids;
        self.live = live;
        self.tombstones = 0;
    }

    fn maybe_compact(&mut self) {
        if self.row_count() > 0
            && self.tombstones as f64 > self.row_count() as f64 * COMPACT_THRESHOLD
        {
            self.compact();
        }
    }

    fn load(&mut self) -> Result<()> {
        let matrix_path = self.matrix_path();
        if !matrix_path.exists() {
            return Ok(());
        }

        let bytes = std::fs::read(&matrix_path)?;
        let corrupt = |reason: &str| IndexError::Corrupt {
            path: matrix_path.clone(),
            reason: reason.to_string(),
        };

        if bytes.len() < 20 || &bytes[0..4] != MAGIC {
            return Err(corrupt("bad header"));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(corrupt(&format!("unsupported format version {version}")));
        }
        let dim = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        if dim != self.dim {
            return Err(IndexError::Corrupt {
                path: matrix_path.clone(),
                reason: format!("matrix dimension {dim} != configured {}", self.dim),
            });
        }
        let count = u64::from_le_bytes(bytes[12..20].try_into().unwrap()) as usize;
        let expected = 20 + count * dim * 4;
        if bytes.len() != expected {
            return Err(corrupt("truncated matrix"));
        }

        let mut rows = Vec::with_capacity(count * dim);
        for chunk in bytes[20..].chunks_exact(4) {
            rows.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }

        let ids_content = std::fs::read_to_string(self.ids_path())?;
        let row_ids: Vec<String> =
            serde_json::from_str(&ids_content).map_err(|e| IndexError::Corrupt {
                path: self.ids_path(),
                reason: e.to_string(),
            })?;
        if row_ids.len() != count {
            return Err(corrupt("id sidecar out of sync with matrix"));
        }

        self.live = row_ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.clone(), row))
            .collect();
        self.rows = rows;
        self.row_ids = row_ids;
        self.tombstones = 0;
        Ok(())
    }
}

impl VectorStore for DenseFileStore {
    fn upsert(&mut self, id: &str, mut vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(IndexError::Store(format!(
                "vector for '{id}' has dimension {} but store expects {}",
                vector.len(),
                self.dim
            )));
        }
        normalize(&mut vector);

        if let Some(&row) = self.live.get(id) {
            if self.row(row) == vector.as_slice() {
                return Ok(());
            }
            self.tombstones += 1;
        }

        let row = self.row_count();
        self.rows.extend_from_slice(&vector);
        self.row_ids.push(id.to_string());
        self.live.insert(id.to_string(), row);
        self.maybe_compact();
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<bool> {
        if self.live.remove(id).is_none() {
            return Ok(false);
        }
        self.tombstones += 1;
        self.maybe_compact();
        Ok(true)
    }

    fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.live.get(id).map(|&row| self.row(row).to_vec())
    }

    fn all_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn len(&self) -> usize {
        self.live.len()
    }

    fn knn(&self, query: &[f32], k: usize, min_score: Option<f32>) -> Vec<(String, f32)> {
        let floor = min_score.unwrap_or(f32::NEG_INFINITY);
        let mut hits: Vec<(String, f32)> = self
            .live
            .iter()
            .filter_map(|(id, &row)| {
                let score = dot(query, self.row(row));
                (score >= floor).then(|| (id.clone(), score))
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    fn all_pairs_above(&self, threshold: f32) -> Vec<(String, String, f32)> {
        let mut entries: Vec<(&String, usize)> =
            self.live.iter().map(|(id, &row)| (id, row)).collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut pairs = Vec::new();
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let cosine = dot(self.row(entries[i].1), self.row(entries[j].1));
                if cosine >= threshold {
                    pairs.push((entries[i].0.clone(), entries[j].0.clone(), cosine));
                }
            }
        }
        pairs
    }

    fn clear(&mut self) {
        self.rows.clear();
        self.row_ids.clear();
        self.live.clear();
        self.tombstones = 0;
    }

    fn save(&mut self) -> Result<()> {
        // Canonical form on disk: compacted, rows in id order.
        self.compact();

        let mut bytes =
            Vec::with_capacity(20 + self.rows.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dim as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.row_count() as u64).to_le_bytes());
        for value in &self.rows {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        fsutil::write_atomic(&self.matrix_path(), &bytes)?;

        let ids = serde_json::to_string(&self.row_ids)
            .map_err(|e| IndexError::Store(format!("serialize id sidecar: {e}")))?;
        fsutil::write_atomic(&self.ids_path(), ids.as_bytes())?;
        Ok(())
    }
}
