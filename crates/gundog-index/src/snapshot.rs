//! Immutable loaded view of an index.
//!
//! Readers query a snapshot behind an `Arc`; the builder never mutates a
//! published snapshot. After an ingest commits its manifest, the owner
//! replaces the handle and in-flight queries finish against the old view.

use std::collections::HashMap;

use crate::config::ProjectConfig;
use crate::error::Result;
use crate::graph::SimilarityGraph;
use crate::keyword::Bm25Index;
use crate::manifest::{FileEntry, IndexManifest};
use crate::store::{open_store, VectorStore};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const KEYWORDS_FILE: &str = "keywords.db";
pub const GRAPH_FILE: &str = "graph.bin";

/// Per-document lookup data derived from the manifest.
#[derive(Debug, Clone)]
pub struct DocMeta {
    pub path: String,
    pub source_type: Option<String>,
    pub git_last_commit_time: Option<i64>,
}

pub struct IndexSnapshot {
    pub manifest: IndexManifest,
    pub vectors: Box<dyn VectorStore>,
    pub keywords: Bm25Index,
    pub graph: SimilarityGraph,
    docs: HashMap<String, DocMeta>,
    commit_times: HashMap<String, i64>,
}

impl std::fmt::Debug for IndexSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSnapshot")
            .field("manifest", &self.manifest)
            .field("keywords", &self.keywords)
            .field("graph", &self.graph)
            .field("docs", &self.docs)
            .field("commit_times", &self.commit_times)
            .finish_non_exhaustive()
    }
}

impl IndexSnapshot {
    /// Open the index at `config.storage.path` for reading.
    ///
    /// A missing manifest yields an empty snapshot. A manifest whose
    /// model, dimension, or backend differs from the configuration is
    /// refused; the caller surfaces that to clients instead of serving
    /// wrong-model results.
    pub fn open(config: &ProjectConfig) -> Result<Self> {
        let dir = &config.storage.path;
        let manifest = IndexManifest::load_or_empty(&dir.join(MANIFEST_FILE), config)?;
        manifest.ensure_compatible(config)?;

        let vectors = open_store(
            config.storage.backend,
            dir,
            config.embedding.dimension,
        )?;
        let keywords = Bm25Index::load(&dir.join(KEYWORDS_FILE))?;
        let graph = SimilarityGraph::load(&dir.join(GRAPH_FILE))?;

        let mut docs = HashMap::with_capacity(manifest.files.len());
        let mut commit_times = HashMap::new();
        for (path, entry) in &manifest.files {
            if let Some(t) = entry.git_last_commit_time {
                commit_times.insert(entry.doc_id.clone(), t);
            }
            docs.insert(
                entry.doc_id.clone(),
                DocMeta {
                    path: path.clone(),
                    source_type: entry.source_type.clone(),
                    git_last_commit_time: entry.git_last_commit_time,
                },
            );
        }

        Ok(Self {
            manifest,
            vectors,
            keywords,
            graph,
            docs,
            commit_times,
        })
    }

    pub fn doc(&self, doc_id: &str) -> Option<&DocMeta> {
        self.docs.get(doc_id)
    }

    pub fn file_entry(&self, doc_id: &str) -> Option<&FileEntry> {
        let meta = self.docs.get(doc_id)?;
        self.manifest.files.get(&meta.path)
    }

    /// doc_id -> last commit epoch, for the recency boost.
    pub fn commit_times(&self) -> &HashMap<String, i64> {
        &self.commit_times
    }

    /// First `n` relative paths, for index listings.
    pub fn sample_paths(&self, n: usize) -> Vec<String> {
        self.manifest.files.keys().take(n).cloned().collect()
    }
}
