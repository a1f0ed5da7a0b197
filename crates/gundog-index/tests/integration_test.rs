//! End-to-end ingest and query tests using a deterministic mock embedder.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use gundog_index::config::{
    ChunkingConfig, EmbeddingConfig, GraphConfig, HybridConfig, ProjectConfig,
    RecencyConfig, SourceConfig, StorageBackend, StorageConfig,
};
use gundog_index::embedding::{normalize, EmbeddingProvider};
use gundog_index::graph::{Edge, SimilarityGraph};
use gundog_index::indexer::{no_stop, IndexBuilder};
use gundog_index::manifest::{ChunkSpan, FileEntry, IndexManifest};
use gundog_index::query::{QueryEngine, QueryOptions};
use gundog_index::snapshot::{IndexSnapshot, GRAPH_FILE, KEYWORDS_FILE, MANIFEST_FILE};
use gundog_index::store::{dense::DenseFileStore, VectorStore};
use gundog_index::{IndexError, Result};

const MOCK_MODEL: &str = "mock-embedder";

/// Wide enough that unrelated vocabularies land in disjoint buckets.
const DIM: usize = 2048;

/// Deterministic bag-of-words embedder: tokens hash into buckets, so
/// texts sharing vocabulary get high cosine and disjoint texts get ~0.
struct MockEmbeddings {
    dim: usize,
}

impl MockEmbeddings {
    fn new() -> Self {
        Self { dim: DIM }
    }

    fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 2)
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            v[(hasher.finish() % self.dim as u64) as usize] += 1.0;
        }
        if v.iter().all(|x| *x == 0.0) {
            v[0] = 1.0;
        }
        normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }

    fn identifier(&self) -> &str {
        MOCK_MODEL
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

/// An embedder that always fails, for abort-path tests.
struct FailingEmbeddings;

#[async_trait]
impl EmbeddingProvider for FailingEmbeddings {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(IndexError::Embed("model exploded".to_string()))
    }

    fn identifier(&self) -> &str {
        MOCK_MODEL
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

fn config(corpus: &Path, index_dir: &Path) -> ProjectConfig {
    ProjectConfig {
        sources: vec![SourceConfig {
            path: corpus.to_path_buf(),
            glob: "**/*.md".to_string(),
            source_type: Some("docs".to_string()),
            ignore_preset: None,
            ignore: vec![],
            use_gitignore: true,
        }],
        embedding: EmbeddingConfig {
            model: MOCK_MODEL.to_string(),
            dimension: DIM,
            endpoint: "http://127.0.0.1:1/unused".to_string(),
            api_key: None,
        },
        storage: StorageConfig {
            backend: StorageBackend::DenseFile,
            path: index_dir.to_path_buf(),
        },
        graph: GraphConfig::default(),
        hybrid: HybridConfig::default(),
        recency: RecencyConfig::default(),
        chunking: ChunkingConfig::default(),
    }
}

async fn build(config: &ProjectConfig, full: bool) -> gundog_index::IndexStats {
    let builder = IndexBuilder::new(
        Arc::new(config.clone()),
        Arc::new(MockEmbeddings::new()),
    );
    builder.build(full, &no_stop()).await.unwrap()
}

fn engine(config: &ProjectConfig) -> QueryEngine {
    let snapshot = IndexSnapshot::open(config).unwrap();
    QueryEngine::new(Arc::new(snapshot), Arc::new(config.clone()))
}

async fn run_query(config: &ProjectConfig, text: &str, opts: &QueryOptions) -> gundog_index::QueryResult {
    engine(config)
        .query(&MockEmbeddings::new(), text, opts)
        .await
        .unwrap()
}

fn write_corpus(dir: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}

#[tokio::test]
async fn test_full_ingest_and_query() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("auth.md", "authentication login tokens sessions passwords"),
            ("deploy.md", "deployment rollout kubernetes clusters"),
            ("style.md", "formatting lint whitespace conventions"),
        ],
    );
    let config = config(corpus.path(), index.path());

    let stats = build(&config, false).await;
    assert_eq!(stats.files_added, 3);
    assert_eq!(stats.chunks_indexed, 3);

    let result = run_query(&config, "authentication login sessions", &QueryOptions::default()).await;
    assert!(!result.direct.is_empty());
    assert_eq!(result.direct[0].path, "auth.md");
    assert_eq!(result.direct[0].source_type.as_deref(), Some("docs"));
    assert!((result.direct[0].score - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_two_full_ingests_are_deterministic() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("a.md", "shared words alpha beta gamma"),
            ("b.md", "shared words alpha beta delta"),
        ],
    );

    let index_a = tempfile::tempdir().unwrap();
    let index_b = tempfile::tempdir().unwrap();
    let config_a = config(corpus.path(), index_a.path());
    let config_b = config(corpus.path(), index_b.path());
    build(&config_a, true).await;
    build(&config_b, true).await;

    let manifest_a = IndexManifest::load(&index_a.path().join(MANIFEST_FILE)).unwrap();
    let manifest_b = IndexManifest::load(&index_b.path().join(MANIFEST_FILE)).unwrap();
    assert_eq!(
        serde_json::to_string(&manifest_a.files).unwrap(),
        serde_json::to_string(&manifest_b.files).unwrap()
    );

    let graph_a = std::fs::read(index_a.path().join(GRAPH_FILE)).unwrap();
    let graph_b = std::fs::read(index_b.path().join(GRAPH_FILE)).unwrap();
    assert_eq!(graph_a, graph_b);

    let vectors_a = std::fs::read(index_a.path().join("vectors.bin")).unwrap();
    let vectors_b = std::fs::read(index_b.path().join("vectors.bin")).unwrap();
    assert_eq!(vectors_a, vectors_b);
}

#[tokio::test]
async fn test_incremental_add_keeps_prior_vectors() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("one.md", "first document about parsing"),
            ("two.md", "second document about rendering"),
        ],
    );
    let config = config(corpus.path(), index.path());

    build(&config, false).await;
    let before = IndexSnapshot::open(&config).unwrap();
    assert_eq!(before.manifest.file_count(), 2);
    let doc_one = before.manifest.files["one.md"].doc_id.clone();
    let vec_one = before.vectors.get(&doc_one).unwrap();

    write_corpus(corpus.path(), &[("three.md", "third document about caching")]);
    let stats = build(&config, false).await;
    assert_eq!(stats.files_added, 1);
    assert_eq!(stats.files_unchanged, 2);

    let after = IndexSnapshot::open(&config).unwrap();
    assert_eq!(after.manifest.file_count(), 3);
    assert_eq!(after.manifest.files["one.md"].doc_id, doc_one);
    assert_eq!(after.vectors.get(&doc_one).unwrap(), vec_one);

    // A further no-op ingest keeps the new file's id stable.
    let doc_three = after.manifest.files["three.md"].doc_id.clone();
    build(&config, false).await;
    let again = IndexSnapshot::open(&config).unwrap();
    assert_eq!(again.manifest.files["three.md"].doc_id, doc_three);
}

#[tokio::test]
async fn test_incremental_equals_full_rebuild() {
    let corpus = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("a.md", "alpha beta gamma delta"),
            ("b.md", "alpha beta epsilon zeta"),
        ],
    );

    // Incremental path: two files, then a third.
    let index_inc = tempfile::tempdir().unwrap();
    let config_inc = config(corpus.path(), index_inc.path());
    build(&config_inc, false).await;
    write_corpus(corpus.path(), &[("c.md", "fresh content entirely")]);
    build(&config_inc, false).await;

    // Full path over the identical final corpus.
    let index_full = tempfile::tempdir().unwrap();
    let config_full = config(corpus.path(), index_full.path());
    build(&config_full, true).await;

    for file in ["vectors.bin", "vectors.ids", KEYWORDS_FILE, GRAPH_FILE] {
        let inc = std::fs::read(index_inc.path().join(file)).unwrap();
        let full = std::fs::read(index_full.path().join(file)).unwrap();
        assert_eq!(inc, full, "store file {file} differs");
    }

    let manifest_inc = IndexManifest::load(&index_inc.path().join(MANIFEST_FILE)).unwrap();
    let manifest_full = IndexManifest::load(&index_full.path().join(MANIFEST_FILE)).unwrap();
    assert_eq!(
        serde_json::to_string(&manifest_inc.files).unwrap(),
        serde_json::to_string(&manifest_full.files).unwrap()
    );
}

#[tokio::test]
async fn test_deleted_file_removed_everywhere() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("keep.md", "shared topic words here"),
            ("gone.md", "shared topic words there"),
        ],
    );
    let config = config(corpus.path(), index.path());
    build(&config, false).await;

    let before = IndexSnapshot::open(&config).unwrap();
    let gone_id = before.manifest.files["gone.md"].doc_id.clone();
    assert!(before.vectors.get(&gone_id).is_some());

    std::fs::remove_file(corpus.path().join("gone.md")).unwrap();
    let stats = build(&config, false).await;
    assert_eq!(stats.files_removed, 1);

    let after = IndexSnapshot::open(&config).unwrap();
    assert_eq!(after.manifest.file_count(), 1);
    assert!(after.vectors.get(&gone_id).is_none());
    assert!(after.keywords.search("there", 10).is_empty());
    assert!(after.graph.neighbors(&gone_id).is_empty());
}

#[tokio::test]
async fn test_stored_vectors_are_unit_norm() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("a.md", "one two three four five six seven"),
            ("b.md", "different vocabulary entirely present"),
        ],
    );
    let config = config(corpus.path(), index.path());
    build(&config, false).await;

    let snapshot = IndexSnapshot::open(&config).unwrap();
    for id in snapshot.vectors.all_ids() {
        let v = snapshot.vectors.get(&id).unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() <= 1e-4, "vector {id} has norm {norm}");
    }
}

#[tokio::test]
async fn test_graph_edges_match_vector_cosines() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    // Heavy vocabulary overlap forces edges above the 0.7 threshold.
    write_corpus(
        corpus.path(),
        &[
            ("a.md", "retry backoff deadline timeout budget policy"),
            ("b.md", "retry backoff deadline timeout budget limits"),
            ("c.md", "unrelated cooking pasta recipe tomato basil"),
        ],
    );
    let config = config(corpus.path(), index.path());
    build(&config, false).await;

    let snapshot = IndexSnapshot::open(&config).unwrap();
    assert!(snapshot.graph.edge_count() >= 1);
    for edge in snapshot.graph.edges() {
        let va = snapshot.vectors.get(&edge.a).unwrap();
        let vb = snapshot.vectors.get(&edge.b).unwrap();
        let cosine: f32 = va.iter().zip(vb.iter()).map(|(x, y)| x * y).sum();
        assert!(
            (cosine - edge.weight).abs() < 1e-6,
            "edge {}-{} weight {} vs cosine {cosine}",
            edge.a,
            edge.b,
            edge.weight
        );
    }
}

#[tokio::test]
async fn test_irrelevance_gate_returns_empty() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("soup.md", "simmer the broth with onions and carrots"),
            ("bread.md", "knead the dough and let it rise overnight"),
            ("cake.md", "whisk the batter with sugar and vanilla"),
        ],
    );
    let config = config(corpus.path(), index.path());
    build(&config, false).await;

    let result = run_query(
        &config,
        "kubernetes pod scheduling",
        &QueryOptions::default(),
    )
    .await;
    assert!(result.direct.is_empty());
    assert!(result.related.is_empty());
}

#[tokio::test]
async fn test_literal_identifier_found_via_keywords() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("service.md", "the UserAuthService validates credentials"),
            ("notes.md", "meeting notes about the roadmap"),
            ("infra.md", "terraform state and bucket layout"),
        ],
    );
    let config = config(corpus.path(), index.path());
    build(&config, false).await;

    let result = run_query(&config, "UserAuthService", &QueryOptions::default()).await;
    assert!(!result.direct.is_empty());
    assert_eq!(result.direct[0].path, "service.md");
}

#[tokio::test]
async fn test_min_score_filters_on_raw_cosine() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(
        corpus.path(),
        &[
            ("match.md", "vector embeddings similarity search"),
            ("other.md", "completely unrelated gardening topics"),
        ],
    );
    let config = config(corpus.path(), index.path());
    build(&config, false).await;

    let opts = QueryOptions {
        min_score: Some(0.5),
        ..QueryOptions::default()
    };
    let result = run_query(&config, "vector embeddings similarity search", &opts).await;
    assert!(result
        .direct
        .iter()
        .all(|hit| hit.cosine.unwrap_or(0.0) >= 0.5));
    assert!(result.direct.iter().any(|hit| hit.path == "match.md"));
    assert!(!result.direct.iter().any(|hit| hit.path == "other.md"));
}

#[tokio::test]
async fn test_chunked_ingest_dedupes_per_file() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();

    let body = (0..120)
        .map(|i| format!("token{i} streaming ingestion pipeline"))
        .collect::<Vec<_>>()
        .join("\n");
    write_corpus(corpus.path(), &[("big.md", body.as_str())]);

    let mut config = config(corpus.path(), index.path());
    config.chunking = ChunkingConfig {
        enabled: true,
        max_tokens: 64,
        overlap_tokens: 8,
    };
    build(&config, false).await;

    let snapshot = IndexSnapshot::open(&config).unwrap();
    let entry = &snapshot.manifest.files["big.md"];
    assert!(entry.chunks.len() > 1);
    assert_eq!(snapshot.vectors.len(), entry.chunks.len());

    // Every chunk id resolves to a manifest document.
    for id in snapshot.vectors.all_ids() {
        let (doc, idx) = gundog_index::doc_id::parse_id(&id);
        assert_eq!(doc, entry.doc_id);
        assert!(idx.unwrap() < entry.chunks.len());
    }

    let result = run_query(
        &config,
        "streaming ingestion pipeline",
        &QueryOptions::default(),
    )
    .await;
    assert_eq!(result.direct.len(), 1);
    assert_eq!(result.direct[0].path, "big.md");
    assert!(result.direct[0].chunk.is_some());
    assert!(result.direct[0].lines.is_some());
}

#[tokio::test]
async fn test_query_expansion_walks_graph() {
    // Fabricated index: orthogonal vectors so only `a` matches directly,
    // with a hand-written graph a-b 0.9, b-c 0.8, a-c 0.4.
    let index = tempfile::tempdir().unwrap();
    let corpus = tempfile::tempdir().unwrap();
    let mut config = config(corpus.path(), index.path());
    config.embedding.dimension = 4;

    let mut manifest = IndexManifest::empty(&config);
    let mut store = DenseFileStore::open(index.path(), 4).unwrap();
    let basis = [
        ("a.md", "a", vec![1.0, 0.0, 0.0, 0.0]),
        ("b.md", "b", vec![0.0, 1.0, 0.0, 0.0]),
        ("c.md", "c", vec![0.0, 0.0, 1.0, 0.0]),
    ];
    for (path, id, vector) in &basis {
        store.upsert(id, vector.clone()).unwrap();
        manifest.files.insert(
            path.to_string(),
            FileEntry {
                doc_id: id.to_string(),
                content_hash: format!("h-{id}"),
                mtime: 1,
                size: 1,
                source_type: None,
                chunks: vec![ChunkSpan {
                    start_line: 1,
                    end_line: 1,
                    token_count: 1,
                    content_hash: format!("h-{id}"),
                }],
                git_last_commit_time: None,
            },
        );
    }
    store.save().unwrap();
    manifest.save(&index.path().join(MANIFEST_FILE)).unwrap();

    let mut graph = SimilarityGraph::new();
    graph.replace_all(vec![
        Edge::new("a", "b", 0.9),
        Edge::new("b", "c", 0.8),
        Edge::new("a", "c", 0.4),
    ]);
    graph.save(&index.path().join(GRAPH_FILE)).unwrap();

    let snapshot = IndexSnapshot::open(&config).unwrap();
    let engine = QueryEngine::new(Arc::new(snapshot), Arc::new(config.clone()));
    let opts = QueryOptions {
        top_k: 1,
        expand: true,
        expand_depth: Some(2),
        min_score: None,
    };
    let result = engine.execute(&[1.0, 0.0, 0.0, 0.0], "alpha", &opts, 0);

    assert_eq!(result.direct.len(), 1);
    assert_eq!(result.direct[0].path, "a.md");

    let c = result.related.iter().find(|r| r.doc_id == "c").unwrap();
    assert_eq!(c.via, "b");
    assert_eq!(c.via_path, "b.md");
    assert_eq!(c.depth, 2);
    assert!((c.weight - 0.72).abs() < 1e-6);

    // Expansion monotonicity: depth 1 reaches fewer documents.
    let shallow = engine.execute(
        &[1.0, 0.0, 0.0, 0.0],
        "alpha",
        &QueryOptions {
            top_k: 1,
            expand: true,
            expand_depth: Some(1),
            min_score: None,
        },
        0,
    );
    assert_eq!(shallow.related.len(), 1);
    assert_eq!(shallow.related[0].doc_id, "b");

    // Graph payload covers direct and related nodes with induced edges.
    assert_eq!(result.graph.nodes.len(), 3);
    assert_eq!(result.graph.edges.len(), 3);
    assert!(result
        .graph
        .nodes
        .iter()
        .any(|n| n.doc_id == "a" && n.direct));
}

#[tokio::test]
async fn test_snapshot_isolation_across_reingest() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), &[("a.md", "original wording here")]);
    let config = config(corpus.path(), index.path());
    build(&config, false).await;

    let old_snapshot = IndexSnapshot::open(&config).unwrap();
    let old_hash = old_snapshot.manifest.files["a.md"].content_hash.clone();

    write_corpus(corpus.path(), &[("a.md", "rewritten wording now")]);
    build(&config, false).await;

    // The pre-ingest snapshot still observes the pre-ingest state.
    assert_eq!(old_snapshot.manifest.files["a.md"].content_hash, old_hash);

    let new_snapshot = IndexSnapshot::open(&config).unwrap();
    assert_ne!(new_snapshot.manifest.files["a.md"].content_hash, old_hash);
}

#[tokio::test]
async fn test_embed_failure_aborts_without_partial_manifest() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), &[("a.md", "some content")]);
    let config = config(corpus.path(), index.path());

    let builder = IndexBuilder::new(Arc::new(config.clone()), Arc::new(FailingEmbeddings));
    let err = builder.build(false, &no_stop()).await.unwrap_err();
    assert!(matches!(err, IndexError::Embed(_)));
    assert!(!index.path().join(MANIFEST_FILE).exists());
}

#[tokio::test]
async fn test_stop_signal_cancels_cleanly() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), &[("a.md", "content to never index")]);
    let config = config(corpus.path(), index.path());

    let (tx, rx) = tokio::sync::watch::channel(true);
    drop(tx);
    let builder = IndexBuilder::new(Arc::new(config.clone()), Arc::new(MockEmbeddings::new()));
    let err = builder.build(false, &rx).await.unwrap_err();
    assert!(matches!(err, IndexError::Canceled));
    assert!(!index.path().join(MANIFEST_FILE).exists());
}

#[tokio::test]
async fn test_model_change_requires_full_rebuild() {
    let corpus = tempfile::tempdir().unwrap();
    let index = tempfile::tempdir().unwrap();
    write_corpus(corpus.path(), &[("a.md", "steady content")]);
    let config_v1 = config(corpus.path(), index.path());
    build(&config_v1, false).await;

    let mut config_v2 = config_v1.clone();
    config_v2.embedding.model = "mock-embedder-v2".to_string();

    // Incremental build against the old index must refuse.
    struct MockV2(MockEmbeddings);
    #[async_trait]
    impl EmbeddingProvider for MockV2 {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.0.embed_batch(texts).await
        }
        fn identifier(&self) -> &str {
            "mock-embedder-v2"
        }
        fn dimension(&self) -> usize {
            self.0.dimension()
        }
    }

    let builder = IndexBuilder::new(
        Arc::new(config_v2.clone()),
        Arc::new(MockV2(MockEmbeddings::new())),
    );
    let err = builder.build(false, &no_stop()).await.unwrap_err();
    assert!(matches!(err, IndexError::ManifestMismatch { .. }));

    // Queries against the mismatched index are refused too.
    assert!(IndexSnapshot::open(&config_v2).is_err());

    // A full rebuild re-creates the index under the new identity.
    builder.build(true, &no_stop()).await.unwrap();
    let snapshot = IndexSnapshot::open(&config_v2).unwrap();
    assert_eq!(snapshot.manifest.model, "mock-embedder-v2");
}
