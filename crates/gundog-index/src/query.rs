//! End-to-end query execution over a loaded snapshot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use crate::config::ProjectConfig;
use crate::doc_id::parse_id;
use crate::embedding::{normalize, EmbeddingProvider};
use crate::error::Result;
use crate::graph::dot;
use crate::ranker;
use crate::snapshot::IndexSnapshot;

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub top_k: usize,
    pub expand: bool,
    /// Override for the configured `graph.max_expand_depth`.
    pub expand_depth: Option<usize>,
    /// Raw-cosine floor applied to direct results only.
    pub min_score: Option<f32>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            top_k: 10,
            expand: true,
            expand_depth: None,
            min_score: None,
        }
    }
}

/// A direct match from hybrid retrieval.
#[derive(Debug, Clone)]
pub struct DirectHit {
    pub id: String,
    pub doc_id: String,
    pub path: String,
    pub source_type: Option<String>,
    /// Rescaled display score in [0, 1].
    pub score: f32,
    pub fused: f64,
    /// Raw cosine between query and this item's vector.
    pub cosine: Option<f32>,
    pub chunk: Option<usize>,
    pub lines: Option<(usize, usize)>,
}

/// A document reached through graph expansion.
#[derive(Debug, Clone)]
pub struct RelatedHit {
    pub doc_id: String,
    pub path: String,
    pub source_type: Option<String>,
    pub via: String,
    pub via_path: String,
    /// Product of edge weights along the best path.
    pub weight: f32,
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub doc_id: String,
    pub path: String,
    pub direct: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GraphPayload {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<(String, String, f32)>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub query: String,
    pub direct: Vec<DirectHit>,
    pub related: Vec<RelatedHit>,
    pub graph: GraphPayload,
}

/// Executes queries against one immutable snapshot.
pub struct QueryEngine {
    snapshot: Arc<IndexSnapshot>,
    config: Arc<ProjectConfig>,
}

impl QueryEngine {
    pub fn new(snapshot: Arc<IndexSnapshot>, config: Arc<ProjectConfig>) -> Self {
        Self { snapshot, config }
    }

    /// Embed the query text and run retrieval.
    pub async fn query(
        &self,
        embedder: &dyn EmbeddingProvider,
        text: &str,
        opts: &QueryOptions,
    ) -> Result<QueryResult> {
        let mut vectors = embedder.embed_batch(&[text.to_string()]).await?;
        let mut query_vector = vectors.pop().ok_or_else(|| {
            crate::error::IndexError::Embed("embedder returned no vector".to_string())
        })?;
        normalize(&mut query_vector);

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Ok(self.execute(&query_vector, text, opts, now))
    }

    /// CPU-bound retrieval against the snapshot. Safe to run on a worker
    /// thread; takes the already-normalized query vector.
    pub fn execute(
        &self,
        query_vector: &[f32],
        query_text: &str,
        opts: &QueryOptions,
        now: i64,
    ) -> QueryResult {
        let snapshot = &self.snapshot;
        let pool = ranker::k_raw(opts.top_k);

        let vector_hits = snapshot.vectors.knn(query_vector, pool, None);
        let keyword_hits = if self.config.hybrid.enabled {
            snapshot.keywords.search(query_text, pool)
        } else {
            Vec::new()
        };
        debug!(
            vector_candidates = vector_hits.len(),
            keyword_candidates = keyword_hits.len(),
            "retrieved candidate pools"
        );

        let mut ranked = ranker::fuse(
            &vector_hits,
            &keyword_hits,
            opts.top_k,
            &self.config.hybrid,
            &self.config.recency,
            snapshot.commit_times(),
            now,
        );

        // Keyword-only candidates have no cosine from the kNN pass; look
        // it up so the min_score filter treats every hit alike.
        for hit in ranked.iter_mut() {
            if hit.cosine.is_none() {
                if let Some(vector) = snapshot.vectors.get(&hit.id) {
                    hit.cosine = Some(dot(query_vector, &vector));
                }
            }
        }
        if let Some(floor) = opts.min_score {
            ranked.retain(|h| h.cosine.map(|c| c >= floor).unwrap_or(false));
        }

        let direct: Vec<DirectHit> = ranked
            .iter()
            .filter_map(|hit| {
                let (doc, chunk) = parse_id(&hit.id);
                let meta = snapshot.doc(doc)?;
                let lines = chunk.and_then(|idx| {
                    snapshot
                        .file_entry(doc)
                        .and_then(|entry| entry.chunks.get(idx))
                        .map(|span| (span.start_line, span.end_line))
                });
                Some(DirectHit {
                    id: hit.id.clone(),
                    doc_id: doc.to_string(),
                    path: meta.path.clone(),
                    source_type: meta.source_type.clone(),
                    score: hit.display,
                    fused: hit.fused,
                    cosine: hit.cosine,
                    chunk,
                    lines,
                })
            })
            .collect();

        // Phase 2: expansion along the similarity graph.
        let mut related = Vec::new();
        if opts.expand && !direct.is_empty() {
            let seeds: Vec<String> = direct.iter().map(|d| d.doc_id.clone()).collect();
            let depth = opts
                .expand_depth
                .unwrap_or(self.config.graph.max_expand_depth);
            let expanded = snapshot.graph.expand(
                &seeds,
                self.config.graph.expand_threshold,
                depth,
            );
            for item in expanded {
                let Some(meta) = snapshot.doc(&item.id) else {
                    continue;
                };
                let via_path = snapshot
                    .doc(&item.via)
                    .map(|m| m.path.clone())
                    .unwrap_or_else(|| item.via.clone());
                related.push(RelatedHit {
                    doc_id: item.id,
                    path: meta.path.clone(),
                    source_type: meta.source_type.clone(),
                    via: item.via,
                    via_path,
                    weight: item.weight,
                    depth: item.depth,
                });
            }
        }

        let graph = self.assemble_graph(&direct, &related);

        QueryResult {
            query: query_text.to_string(),
            direct,
            related,
            graph,
        }
    }

    /// Induced subgraph over the union of direct and related documents.
    fn assemble_graph(&self, direct: &[DirectHit], related: &[RelatedHit]) -> GraphPayload {
        let direct_docs: HashSet<String> =
            direct.iter().map(|d| d.doc_id.clone()).collect();
        let mut node_ids: HashSet<String> = direct_docs.clone();
        node_ids.extend(related.iter().map(|r| r.doc_id.clone()));

        let mut nodes: Vec<GraphNode> = node_ids
            .iter()
            .filter_map(|doc_id| {
                self.snapshot.doc(doc_id).map(|meta| GraphNode {
                    doc_id: doc_id.clone(),
                    path: meta.path.clone(),
                    direct: direct_docs.contains(doc_id),
                })
            })
            .collect();
        nodes.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));

        let edges = self
            .snapshot
            .graph
            .induced_edges(&node_ids)
            .into_iter()
            .map(|e| (e.a, e.b, e.weight))
            .collect();

        GraphPayload { nodes, edges }
    }
}
