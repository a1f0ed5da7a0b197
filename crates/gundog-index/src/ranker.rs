//! Hybrid result ranking.
//!
//! Vector and keyword candidate lists are fused with Reciprocal Rank
//! Fusion, optionally boosted by recency, deduplicated to one chunk per
//! file, and rescaled to a [0, 1] display score.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::config::{HybridConfig, RecencyConfig};
use crate::doc_id::parse_id;

/// RRF rank constant. Fixed; not a user knob.
pub const RRF_K: f64 = 60.0;

/// Best-cosine floor of the irrelevance gate.
pub const MIN_COSINE_SCORE: f32 = 0.25;

/// Best-BM25 floor of the irrelevance gate. A coarse tf-idf bar; revisit
/// with recall measurements.
pub const MIN_BM25_SCORE: f64 = 0.5;

/// Candidate pool size fetched from each store before fusion.
pub fn k_raw(top_k: usize) -> usize {
    (top_k * 4).max(50)
}

/// A fused result. `display` is the rescaled score shown to users;
/// `cosine` is the raw vector similarity when the id was a vector
/// candidate.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub id: String,
    pub fused: f64,
    pub display: f32,
    pub cosine: Option<f32>,
}

/// Fuse vector and keyword candidates into the final top-k ranking.
///
/// `commit_times` maps doc ids to git commit epochs for the recency
/// boost; `now` is the reference time in epoch seconds.
pub fn fuse(
    vector_hits: &[(String, f32)],
    keyword_hits: &[(String, f64)],
    top_k: usize,
    hybrid: &HybridConfig,
    recency: &RecencyConfig,
    commit_times: &HashMap<String, i64>,
    now: i64,
) -> Vec<RankedHit> {
    // Irrelevance gate: nothing resembles the query in either space.
    let best_cosine = vector_hits
        .iter()
        .map(|(_, s)| *s)
        .fold(f32::NEG_INFINITY, f32::max);
    let best_bm25 = keyword_hits
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);
    if best_cosine < MIN_COSINE_SCORE && best_bm25 < MIN_BM25_SCORE {
        return Vec::new();
    }

    // Reciprocal Rank Fusion over the union of both candidate lists.
    let mut fused: HashMap<String, f64> = HashMap::new();
    let mut cosines: HashMap<String, f32> = HashMap::new();
    for (rank, (id, cosine)) in vector_hits.iter().enumerate() {
        *fused.entry(id.clone()).or_default() +=
            hybrid.vector_weight / (RRF_K + rank as f64);
        cosines.insert(id.clone(), *cosine);
    }
    for (rank, (id, _)) in keyword_hits.iter().enumerate() {
        *fused.entry(id.clone()).or_default() +=
            hybrid.bm25_weight / (RRF_K + rank as f64);
    }

    // Recency boost for documents with a known last commit time.
    if recency.enabled {
        for (id, score) in fused.iter_mut() {
            let (doc, _) = parse_id(id);
            if let Some(&commit_time) = commit_times.get(doc) {
                let age_days = (now - commit_time).max(0) as f64 / 86_400.0;
                let boost = recency.weight
                    * (-(2.0f64.ln()) * age_days / recency.half_life_days).exp();
                *score *= 1.0 + boost;
            }
        }
    }

    // One chunk per file: keep the best-fused chunk of each document.
    let mut best_per_doc: HashMap<String, (String, f64)> = HashMap::new();
    for (id, score) in fused {
        let (doc, _) = parse_id(&id);
        match best_per_doc.get(doc) {
            Some((_, existing)) if *existing >= score => {}
            _ => {
                best_per_doc.insert(doc.to_string(), (id, score));
            }
        }
    }

    let mut hits: Vec<RankedHit> = best_per_doc
        .into_values()
        .map(|(id, fused)| {
            let cosine = cosines.get(&id).copied();
            RankedHit {
                id,
                fused,
                display: 0.0,
                cosine,
            }
        })
        .collect();
    hits.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(top_k);

    rescale(&mut hits);
    hits
}

/// Rescale fused scores to [0, 1] over the returned list. The weakest
/// kept result maps to 0.0 and the strongest to 1.0; a degenerate range
/// puts 1.0 on the top item only.
fn rescale(hits: &mut [RankedHit]) {
    if hits.is_empty() {
        return;
    }
    let max = hits.iter().map(|h| h.fused).fold(f64::NEG_INFINITY, f64::max);
    let floor = hits.iter().map(|h| h.fused).fold(f64::INFINITY, f64::min);

    if max - floor <= 1e-9 {
        for (i, hit) in hits.iter_mut().enumerate() {
            hit.display = if i == 0 { 1.0 } else { 0.0 };
        }
        return;
    }
    for hit in hits.iter_mut() {
        let display = (hit.fused - floor) / (max - floor);
        hit.display = display.clamp(0.0, 1.0) as f32;
    }
}
