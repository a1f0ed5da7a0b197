//! BM25 keyword store for hybrid search.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::fsutil;

/// Term frequency saturation
const K1: f64 = 1.2;
/// Length normalization
const B: f64 = 0.75;

/// Tokens shorter than this are dropped.
const MIN_TOKEN_LEN: usize = 2;
/// Tokens longer than this are dropped.
const MAX_TOKEN_LEN: usize = 40;

/// A tokenized document in the postings store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PostingDoc {
    /// Term -> occurrences within this document.
    term_freqs: BTreeMap<String, u32>,
    /// Token count before dedup (document length for BM25).
    length: usize,
}

/// Okapi BM25 index over tokenized documents.
///
/// Tokenization: lowercase, split on non-alphanumeric, keep tokens of
/// length 2..=40, no stemming.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bm25Index {
    documents: BTreeMap<String, PostingDoc>,
    /// Term -> number of documents containing it.
    doc_freqs: BTreeMap<String, u32>,
    total_length: usize,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tokenize text into query/index terms.
    pub fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| (MIN_TOKEN_LEN..=MAX_TOKEN_LEN).contains(&s.len()))
            .map(String::from)
            .collect()
    }

    /// Insert or replace a document.
    pub fn upsert(&mut self, id: &str, text: &str) {
        self.delete(id);

        let tokens = Self::tokenize(text);
        let length = tokens.len();
        let mut term_freqs: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokens {
            *term_freqs.entry(token).or_insert(0) += 1;
        }

        for term in term_freqs.keys() {
            *self.doc_freqs.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += length;
        self.documents
            .insert(id.to_string(), PostingDoc { term_freqs, length });
    }

    /// Remove a document. Returns whether it was present.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(doc) = self.documents.remove(id) else {
            return false;
        };
        self.total_length -= doc.length;
        for term in doc.term_freqs.keys() {
            if let Some(count) = self.doc_freqs.get_mut(term) {
                *count -= 1;
                if *count == 0 {
                    self.doc_freqs.remove(term);
                }
            }
        }
        true
    }

    fn idf(&self, term: &str) -> f64 {
        let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f64;
        if df == 0.0 {
            return 0.0;
        }
        let n = self.documents.len() as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn avg_length(&self) -> f64 {
        if self.documents.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.documents.len() as f64
        }
    }

    /// BM25 top-k search. Scores are untransformed BM25 values, sorted
    /// descending with ties broken by ascending id.
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f64)> {
        let terms = Self::tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let avg_length = self.avg_length();

        let mut scores: Vec<(String, f64)> = self
            .documents
            .iter()
            .filter_map(|(id, doc)| {
                let mut score = 0.0;
                for term in &terms {
                    let tf = doc.term_freqs.get(term).copied().unwrap_or(0) as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let idf = self.idf(term);
                    let numerator = tf * (K1 + 1.0);
                    let denominator =
                        tf + K1 * (1.0 - B + B * (doc.length as f64 / avg_length));
                    score += idf * (numerator / denominator);
                }
                (score > 0.0).then(|| (id.clone(), score))
            })
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scores.truncate(k);
        scores
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.doc_freqs.clear();
        self.total_length = 0;
    }

    /// Persist the postings to disk (shadow-then-rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| IndexError::Store(format!("serialize keyword store: {e}")))?;
        fsutil::write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Load postings from disk; a missing file yields an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(path)?;
        bincode::deserialize(&bytes).map_err(|e| IndexError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}
