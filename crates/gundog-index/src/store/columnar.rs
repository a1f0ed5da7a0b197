//! Columnar vector backend with a coarse ANN index.
//!
//! Vectors live in column-major segments under `columnar/`. An inverted-
//! file (IVF) index over sqrt(N) centroids is built when the store is
//! persisted; kNN probes the nearest lists and is approximate. Mutations
//! invalidate the IVF index and queries fall back to an exact scan until
//! the next save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::embedding::normalize;
use crate::error::{IndexError, Result};
use crate::fsutil;
use crate::graph::dot;
use crate::store::{sort_hits, VectorStore};

const SEGMENT_FILE: &str = "segment.bin";
const IVF_FILE: &str = "ivf.bin";
const SEGMENT_VERSION: u32 = 1;

/// Below this many vectors the IVF index is not worth building.
const MIN_IVF_ROWS: usize = 64;

/// Lloyd iterations for centroid refinement.
const KMEANS_ITERATIONS: usize = 3;

#[derive(Serialize, Deserialize)]
struct Segment {
    version: u32,
    dim: usize,
    ids: Vec<String>,
    /// `dim` columns, each of length `ids.len()`.
    columns: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct IvfIndex {
    centroids: Vec<Vec<f32>>,
    /// Row indices per centroid.
    lists: Vec<Vec<usize>>,
}

pub struct ColumnarAnnStore {
    dir: PathBuf,
    dim: usize,
    ids: Vec<String>,
    columns: Vec<Vec<f32>>,
    index: HashMap<String, usize>,
    /// None while mutations have outdated the persisted index.
    ivf: Option<IvfIndex>,
}

impl ColumnarAnnStore {
    pub fn open(dir: &Path, dim: usize) -> Result<Self> {
        let mut store = Self {
            dir: dir.join("columnar"),
            dim,
            ids: Vec::new(),
            columns: vec![Vec::new(); dim],
            index: HashMap::new(),
            ivf: None,
        };
        store.load()?;
        Ok(store)
    }

    fn row(&self, row: usize) -> Vec<f32> {
        (0..self.dim).map(|d| self.columns[d][row]).collect()
    }

    fn set_row(&mut self, row: usize, vector: &[f32]) {
        for (d, value) in vector.iter().enumerate() {
            self.columns[d][row] = *value;
        }
    }

    fn push_row(&mut self, vector: &[f32]) {
        for (d, value) in vector.iter().enumerate() {
            self.columns[d].push(*value);
        }
    }

    /// Exact column-major scan: accumulate per-row scores one dimension
    /// at a time.
    fn scan_scores(&self, query: &[f32]) -> Vec<f32> {
        let mut scores = vec![0.0f32; self.ids.len()];
        for (d, q) in query.iter().enumerate() {
            if *q == 0.0 {
                continue;
            }
            for (row, value) in self.columns[d].iter().enumerate() {
                scores[row] += q * value;
            }
        }
        scores
    }

    /// Build the IVF index over the current rows. Deterministic: initial
    /// centroids are evenly spaced over rows sorted by id.
    fn build_ivf(&self) -> Option<IvfIndex> {
        let n = self.ids.len();
        if n < MIN_IVF_ROWS {
            return None;
        }
        let nlist = (n as f64).sqrt().ceil() as usize;

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| self.ids[a].cmp(&self.ids[b]));

        let mut centroids: Vec<Vec<f32>> = (0..nlist)
            .map(|i| self.row(order[i * n / nlist]))
            .collect();

        let mut assignments = vec![0usize; n];
        for _ in 0..KMEANS_ITERATIONS {
            for row in 0..n {
                let vector = self.row(row);
                assignments[row] = nearest_centroid(&centroids, &vector);
            }
            let mut sums = vec![vec![0.0f32; self.dim]; nlist];
            let mut counts = vec![0usize; nlist];
            for row in 0..n {
                let list = assignments[row];
                counts[list] += 1;
                for (d, value) in self.row(row).iter().enumerate() {
                    sums[list][d] += value;
                }
            }
            for list in 0..nlist {
                if counts[list] > 0 {
                    let mut mean: Vec<f32> = sums[list]
                        .iter()
                        .map(|s| s / counts[list] as f32)
                        .collect();
                    normalize(&mut mean);
                    centroids[list] = mean;
                }
            }
        }

        let mut lists: Vec<Vec<usize>> = vec![Vec::new(); nlist];
        for row in 0..n {
            lists[nearest_centroid(&centroids, &self.row(row))].push(row);
        }
        debug!(rows = n, nlist, "built IVF index");
        Some(IvfIndex { centroids, lists })
    }

    fn load(&mut self) -> Result<()> {
        let segment_path = self.dir.join(SEGMENT_FILE);
        if !segment_path.exists() {
            return Ok(());
        }
        let bytes = std::fs::read(&segment_path)?;
        let segment: Segment =
            bincode::deserialize(&bytes).map_err(|e| IndexError::Corrupt {
                path: segment_path.clone(),
                reason: e.to_string(),
            })?;
        if segment.version != SEGMENT_VERSION {
            return Err(IndexError::Corrupt {
                path: segment_path.clone(),
                reason: format!("unsupported segment version {}", segment.version),
            });
        }
        if segment.dim != self.dim {
            return Err(IndexError::Corrupt {
                path: segment_path,
                reason: format!(
                    "segment dimension {} != configured {}",
                    segment.dim, self.dim
                ),
            });
        }

        self.index = segment
            .ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.clone(), row))
            .collect();
        self.ids = segment.ids;
        self.columns = segment.columns;

        let ivf_path = self.dir.join(IVF_FILE);
        if ivf_path.exists() {
            let bytes = std::fs::read(&ivf_path)?;
            self.ivf = bincode::deserialize(&bytes).ok();
        }
        Ok(())
    }

    /// Reorder rows by id so saved segments are deterministic.
    fn canonicalize(&mut self) {
        let mut order: Vec<usize> = (0..self.ids.len()).collect();
        order.sort_by(|&a, &b| self.ids[a].cmp(&self.ids[b]));

        let ids: Vec<String> = order.iter().map(|&r| self.ids[r].clone()).collect();
        let columns: Vec<Vec<f32>> = (0..self.dim)
            .map(|d| order.iter().map(|&r| self.columns[d][r]).collect())
            .collect();

        self.index = ids
            .iter()
            .enumerate()
            .map(|(row, id)| (id.clone(), row))
            .collect();
        self.ids = ids;
        self.columns = columns;
    }
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, centroid) in centroids.iter().enumerate() {
        let score = dot(centroid, vector);
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    best
}

impl VectorStore for ColumnarAnnStore {
    fn upsert(&mut self, id: &str, mut vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dim {
            return Err(IndexError::Store(format!(
                "vector for '{id}' has dimension {} but store expects {}",
                vector.len(),
                self.dim
            )));
        }
        normalize(&mut vector);

        if let Some(&row) = self.index.get(id) {
            if self.row(row) == vector {
                return Ok(());
            }
            self.set_row(row, &vector);
        } else {
            self.index.insert(id.to_string(), self.ids.len());
            self.ids.push(id.to_string());
            self.push_row(&vector);
        }
        self.ivf = None;
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<bool> {
        let Some(row) = self.index.remove(id) else {
            return Ok(false);
        };
        let last = self.ids.len() - 1;
        self.ids.swap_remove(row);
        for column in &mut self.columns {
            column.swap_remove(row);
        }
        if row != last {
            // The former tail row moved into the vacated slot.
            self.index.insert(self.ids[row].clone(), row);
        }
        self.ivf = None;
        Ok(true)
    }

    fn get(&self, id: &str) -> Option<Vec<f32>> {
        self.index.get(id).map(|&row| self.row(row))
    }

    fn all_ids(&self) -> Vec<String> {
        let mut ids = self.ids.clone();
        ids.sort();
        ids
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn knn(&self, query: &[f32], k: usize, min_score: Option<f32>) -> Vec<(String, f32)> {
        let floor = min_score.unwrap_or(f32::NEG_INFINITY);

        let mut hits: Vec<(String, f32)> = match &self.ivf {
            Some(ivf) if !ivf.centroids.is_empty() => {
                // Probe the nearest quarter of the lists.
                let nprobe = (ivf.centroids.len() / 4).max(1);
                let mut ranked: Vec<(usize, f32)> = ivf
                    .centroids
                    .iter()
                    .enumerate()
                    .map(|(i, c)| (i, dot(c, query)))
                    .collect();
                ranked.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                });

                ranked
                    .iter()
                    .take(nprobe)
                    .flat_map(|(list, _)| ivf.lists[*list].iter())
                    .map(|&row| (self.ids[row].clone(), dot(query, &self.row(row))))
                    .filter(|(_, score)| *score >= floor)
                    .collect()
            }
            _ => self
                .scan_scores(query)
                .into_iter()
                .enumerate()
                .filter(|(_, score)| *score >= floor)
                .map(|(row, score)| (self.ids[row].clone(), score))
                .collect(),
        };

        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    fn all_pairs_above(&self, threshold: f32) -> Vec<(String, String, f32)> {
        let mut order: Vec<usize> = (0..self.ids.len()).collect();
        order.sort_by(|&a, &b| self.ids[a].cmp(&self.ids[b]));

        let mut pairs = Vec::new();
        for i in 0..order.len() {
            let row_i = self.row(order[i]);
            for &row_j in order.iter().skip(i + 1) {
                let cosine = dot(&row_i, &self.row(row_j));
                if cosine >= threshold {
                    pairs.push((
                        self.ids[order[i]].clone(),
                        self.ids[row_j].clone(),
                        cosine,
                    ));
                }
            }
        }
        pairs
    }

    fn clear(&mut self) {
        self.ids.clear();
        self.columns = vec![Vec::new(); self.dim];
        self.index.clear();
        self.ivf = None;
    }

    fn save(&mut self) -> Result<()> {
        self.canonicalize();

        let segment = Segment {
            version: SEGMENT_VERSION,
            dim: self.dim,
            ids: self.ids.clone(),
            columns: self.columns.clone(),
        };
        let bytes = bincode::serialize(&segment)
            .map_err(|e| IndexError::Store(format!("serialize segment: {e}")))?;
        fsutil::write_atomic(&self.dir.join(SEGMENT_FILE), &bytes)?;

        self.ivf = self.build_ivf();
        if let Some(ref ivf) = self.ivf {
            let bytes = bincode::serialize(ivf)
                .map_err(|e| IndexError::Store(format!("serialize ivf: {e}")))?;
            fsutil::write_atomic(&self.dir.join(IVF_FILE), &bytes)?;
        } else {
            let _ = std::fs::remove_file(self.dir.join(IVF_FILE));
        }
        Ok(())
    }
}
