//! Incremental ingest orchestration.
//!
//! `IndexBuilder` owns every mutation of on-disk index state. One build:
//! scan, diff against the manifest, chunk and embed changed files through
//! a bounded queue and embed worker pool, apply deletions, rebuild the
//! document graph, then commit the manifest shadow-then-rename. A stop
//! signal is honored at phase and batch boundaries and leaves the prior
//! manifest intact.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::chunker::chunk_text;
use crate::config::ProjectConfig;
use crate::doc_id::{chunk_id, doc_id};
use crate::embedding::EmbeddingProvider;
use crate::error::{IndexError, Result};
use crate::git::GitResolver;
use crate::graph::{pairs_above, Edge, SimilarityGraph};
use crate::keyword::Bm25Index;
use crate::manifest::{ChunkSpan, FileEntry, IndexManifest};
use crate::scanner::{scan_sources, ScannedFile};
use crate::snapshot::{GRAPH_FILE, KEYWORDS_FILE, MANIFEST_FILE};
use crate::store::open_store;

/// Depth of the chunk queue between the producer and the embed pool.
const QUEUE_DEPTH: usize = 256;

/// Statistics about one build.
#[derive(Debug, Default, Clone)]
pub struct IndexStats {
    pub files_total: usize,
    pub files_added: usize,
    pub files_modified: usize,
    pub files_removed: usize,
    pub files_unchanged: usize,
    pub files_unreadable: usize,
    pub binary_skipped: usize,
    pub chunks_indexed: usize,
    pub embedding_calls: usize,
    pub duration_ms: u64,
}

/// One text waiting for a vector.
struct EmbedItem {
    id: String,
    /// Text sent to the embedder (path-framed).
    embed_text: String,
    /// Text indexed for keyword search.
    keyword_text: String,
}

/// Output of the scan+chunk producer.
#[derive(Default)]
struct ProducerOut {
    /// New or replaced manifest entries.
    entries: Vec<(String, FileEntry)>,
    /// Files whose mtime changed but content did not.
    refreshed: Vec<(String, u64, u64)>,
    added: usize,
    modified: usize,
    unreadable: usize,
}

pub struct IndexBuilder {
    config: Arc<ProjectConfig>,
    embedder: Arc<dyn EmbeddingProvider>,
    git: Option<Arc<dyn GitResolver>>,
}

impl IndexBuilder {
    pub fn new(config: Arc<ProjectConfig>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            config,
            embedder,
            git: None,
        }
    }

    pub fn with_git(mut self, git: Arc<dyn GitResolver>) -> Self {
        self.git = Some(git);
        self
    }

    /// Number of concurrent embed requests.
    fn workers() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cpus / 2).clamp(1, 4)
    }

    /// Run one ingest. `full` wipes the stores and re-embeds everything;
    /// it is also the only way to change model, dimension, or backend.
    pub async fn build(&self, full: bool, stop: &watch::Receiver<bool>) -> Result<IndexStats> {
        let started = Instant::now();
        let config = &self.config;
        let dir = &config.storage.path;
        let mut stats = IndexStats::default();

        if self.embedder.identifier() != config.embedding.model {
            return Err(IndexError::Config(format!(
                "embedder '{}' does not match configured model '{}'",
                self.embedder.identifier(),
                config.embedding.model
            )));
        }

        // Phase 1: manifest and stores.
        let manifest_path = dir.join(MANIFEST_FILE);
        let mut manifest = if full {
            IndexManifest::empty(config)
        } else {
            let manifest = IndexManifest::load_or_empty(&manifest_path, config)?;
            manifest.ensure_compatible(config)?;
            if manifest.chunking != config.chunking && !manifest.files.is_empty() {
                return Err(IndexError::ManifestMismatch {
                    field: "chunking settings",
                    expected: format!("{:?}", config.chunking),
                    found: format!("{:?}", manifest.chunking),
                });
            }
            manifest
        };

        let mut vectors = open_store(
            config.storage.backend,
            dir,
            config.embedding.dimension,
        )?;
        let mut keywords = Bm25Index::load(&dir.join(KEYWORDS_FILE))?;
        if full {
            vectors.clear();
            keywords.clear();
        }

        // Phase 2: scan.
        check_stop(stop)?;
        let (scanned, scan_stats) = scan_sources(&config.sources)?;
        stats.files_total = scanned.len();
        stats.binary_skipped = scan_stats.binary_skipped;
        info!(files = scanned.len(), "scan complete");

        // Phase 3: partition against the manifest.
        check_stop(stop)?;
        let scanned_paths: HashSet<&str> =
            scanned.iter().map(|f| f.relative.as_str()).collect();
        let removed: Vec<String> = manifest
            .files
            .keys()
            .filter(|path| !scanned_paths.contains(path.as_str()))
            .cloned()
            .collect();

        let mut work: Vec<(ScannedFile, Option<FileEntry>)> = Vec::new();
        for file in scanned {
            match manifest.files.get(&file.relative) {
                None => work.push((file, None)),
                Some(entry) => {
                    if entry.mtime == file.mtime && entry.size == file.size {
                        stats.files_unchanged += 1;
                    } else {
                        work.push((file, Some(entry.clone())));
                    }
                }
            }
        }

        // Phases 4-5: chunk and embed through the bounded pipeline.
        check_stop(stop)?;
        let (producer_out, embedding_calls, chunks_indexed) = {
            let (item_tx, item_rx) = mpsc::channel::<EmbedItem>(QUEUE_DEPTH);
            let batch_size = self.embedder.max_batch_size();
            let (result_tx, mut result_rx) =
                mpsc::channel::<(Vec<EmbedItem>, Vec<Vec<f32>>)>(Self::workers() * 2);

            let producer = self.produce(work, item_tx, stop.clone());
            let embed = embed_stage(
                self.embedder.clone(),
                item_rx,
                result_tx,
                batch_size,
                Self::workers(),
                stop.clone(),
            );
            let writer = async {
                let mut written = 0usize;
                while let Some((items, batch_vectors)) = result_rx.recv().await {
                    for (item, vector) in items.into_iter().zip(batch_vectors) {
                        vectors.upsert(&item.id, vector)?;
                        keywords.upsert(&item.id, &item.keyword_text);
                        written += 1;
                    }
                }
                Ok::<usize, IndexError>(written)
            };

            let (producer_res, embed_res, writer_res) =
                tokio::join!(producer, embed, writer);
            let calls = embed_res?;
            let written = writer_res?;
            (producer_res?, calls, written)
        };

        stats.files_added = producer_out.added;
        stats.files_modified = producer_out.modified;
        stats.files_unchanged += producer_out.refreshed.len();
        stats.files_unreadable = producer_out.unreadable;
        stats.chunks_indexed = chunks_indexed;
        stats.embedding_calls = embedding_calls;

        // Phase 6: apply manifest updates and deletions (single writer).
        check_stop(stop)?;
        for (path, entry) in producer_out.entries {
            if let Some(old) = manifest.files.get(&path) {
                let new_ids: HashSet<String> =
                    manifest.ids_for(&entry).into_iter().collect();
                for id in manifest.ids_for(old) {
                    if !new_ids.contains(&id) {
                        vectors.delete(&id)?;
                        keywords.delete(&id);
                    }
                }
            }
            manifest.files.insert(path, entry);
        }
        for (path, mtime, size) in producer_out.refreshed {
            if let Some(entry) = manifest.files.get_mut(&path) {
                entry.mtime = mtime;
                entry.size = size;
            }
        }
        stats.files_removed = removed.len();
        for path in &removed {
            if let Some(entry) = manifest.files.remove(path) {
                for id in manifest.ids_for(&entry) {
                    vectors.delete(&id)?;
                    keywords.delete(&id);
                }
            }
        }

        let changed = full
            || stats.files_added > 0
            || stats.files_modified > 0
            || stats.files_removed > 0;
        if !changed {
            // mtime refreshes alone do not justify touching stores.
            info!("no changes, skipping graph rebuild");
            stats.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(stats);
        }

        // Phase 7: document-level vectors (normalized mean over chunks).
        check_stop(stop)?;
        let edges = if manifest.chunking.enabled {
            let mut doc_vectors: Vec<(String, Vec<f32>)> = Vec::new();
            for entry in manifest.files.values() {
                let mut mean = vec![0.0f32; config.embedding.dimension];
                let mut found = 0usize;
                for id in manifest.ids_for(entry) {
                    if let Some(vector) = vectors.get(&id) {
                        for (acc, value) in mean.iter_mut().zip(vector.iter()) {
                            *acc += value;
                        }
                        found += 1;
                    }
                }
                if found == 0 {
                    warn!(doc = %entry.doc_id, "no chunk vectors for document");
                    continue;
                }
                for value in mean.iter_mut() {
                    *value /= found as f32;
                }
                crate::embedding::normalize(&mut mean);
                doc_vectors.push((entry.doc_id.clone(), mean));
            }
            pairs_above(&doc_vectors, config.graph.similarity_threshold)
        } else {
            vectors
                .all_pairs_above(config.graph.similarity_threshold)
                .into_iter()
                .map(|(a, b, w)| Edge::new(a, b, w))
                .collect()
        };

        // Phase 8: graph rebuild from scratch.
        let mut graph = SimilarityGraph::new();
        let edge_count = edges.len();
        graph.replace_all(edges);
        debug!(edges = edge_count, "similarity graph rebuilt");

        // Phase 9: persist stores, then commit the manifest last.
        check_stop(stop)?;
        vectors.save()?;
        keywords.save(&dir.join(KEYWORDS_FILE))?;
        graph.save(&dir.join(GRAPH_FILE))?;
        manifest.stamp_ingest();
        manifest.save(&manifest_path)?;

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            added = stats.files_added,
            modified = stats.files_modified,
            removed = stats.files_removed,
            unchanged = stats.files_unchanged,
            chunks = stats.chunks_indexed,
            "ingest complete"
        );
        Ok(stats)
    }

    /// Scan+chunk producer: reads candidate files, reclassifies the ones
    /// whose content hash is unchanged, and streams chunks to the embed
    /// pool.
    async fn produce(
        &self,
        work: Vec<(ScannedFile, Option<FileEntry>)>,
        item_tx: mpsc::Sender<EmbedItem>,
        stop: watch::Receiver<bool>,
    ) -> Result<ProducerOut> {
        let config = &self.config;
        let mut out = ProducerOut::default();

        for (file, prior) in work {
            if *stop.borrow() {
                return Err(IndexError::Canceled);
            }

            let content = match std::fs::read_to_string(&file.absolute) {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %file.absolute.display(), "could not read file: {e}");
                    out.unreadable += 1;
                    continue;
                }
            };
            let content_hash = hash_content(&content);

            if let Some(ref old) = prior {
                if old.content_hash == content_hash {
                    out.refreshed.push((file.relative.clone(), file.mtime, file.size));
                    continue;
                }
                out.modified += 1;
            } else {
                out.added += 1;
            }

            let doc = doc_id(&file.relative);
            let chunks = chunk_text(&content, &config.chunking);
            let total = chunks.len();
            let git_last_commit_time = if config.recency.enabled {
                self.git.as_ref().and_then(|git| {
                    git.last_commit_time(&file.source_root, &file.relative)
                })
            } else {
                prior.as_ref().and_then(|e| e.git_last_commit_time)
            };

            let mut spans = Vec::with_capacity(total);
            for chunk in chunks {
                let (id, embed_text) = if config.chunking.enabled {
                    (
                        chunk_id(&doc, chunk.index),
                        format!(
                            "Path: {}\nChunk {}/{}\n\n{}",
                            file.relative,
                            chunk.index + 1,
                            total,
                            chunk.text
                        ),
                    )
                } else {
                    (doc.clone(), format!("Path: {}\n\n{}", file.relative, chunk.text))
                };
                let keyword_text = format!("{}\n{}", file.relative, chunk.text);

                spans.push(ChunkSpan {
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    token_count: chunk.token_count,
                    content_hash: chunk.content_hash,
                });

                let item = EmbedItem {
                    id,
                    embed_text,
                    keyword_text,
                };
                if item_tx.send(item).await.is_err() {
                    // Embed stage bailed out; its error wins.
                    return Ok(out);
                }
            }

            out.entries.push((
                file.relative.clone(),
                FileEntry {
                    doc_id: doc,
                    content_hash,
                    mtime: file.mtime,
                    size: file.size,
                    source_type: file.source_type.clone(),
                    chunks: spans,
                    git_last_commit_time,
                },
            ));
        }

        Ok(out)
    }
}

/// Batch items from the queue and run up to `workers` embed requests
/// concurrently, forwarding each batch's vectors to the writer.
async fn embed_stage(
    embedder: Arc<dyn EmbeddingProvider>,
    mut item_rx: mpsc::Receiver<EmbedItem>,
    result_tx: mpsc::Sender<(Vec<EmbedItem>, Vec<Vec<f32>>)>,
    batch_size: usize,
    workers: usize,
    stop: watch::Receiver<bool>,
) -> Result<usize> {
    let mut join_set: JoinSet<Result<()>> = JoinSet::new();
    let mut batch: Vec<EmbedItem> = Vec::new();
    let mut calls = 0usize;
    let mut failure: Option<IndexError> = None;

    let dispatch = |join_set: &mut JoinSet<Result<()>>, batch: Vec<EmbedItem>| {
        let embedder = embedder.clone();
        let result_tx = result_tx.clone();
        join_set.spawn(async move {
            let texts: Vec<String> =
                batch.iter().map(|item| item.embed_text.clone()).collect();
            let batch_vectors = embedder.embed_batch(&texts).await?;
            if batch_vectors.len() != batch.len() {
                return Err(IndexError::Embed(format!(
                    "embedder returned {} vectors for {} texts",
                    batch_vectors.len(),
                    batch.len()
                )));
            }
            // The writer hanging up just means the build is unwinding.
            let _ = result_tx.send((batch, batch_vectors)).await;
            Ok(())
        });
    };

    loop {
        if *stop.borrow() {
            failure = Some(IndexError::Canceled);
            break;
        }
        match item_rx.recv().await {
            Some(item) => {
                batch.push(item);
                if batch.len() >= batch_size {
                    dispatch(&mut join_set, std::mem::take(&mut batch));
                    calls += 1;
                }
            }
            None => break,
        }
        while join_set.len() >= workers {
            if let Some(joined) = join_set.join_next().await {
                if let Err(e) = flatten_join(joined) {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_some() {
            break;
        }
    }

    if failure.is_none() && !batch.is_empty() {
        dispatch(&mut join_set, std::mem::take(&mut batch));
        calls += 1;
    }

    // Drain the queue so the producer never blocks on a dead pipeline.
    if failure.is_some() {
        item_rx.close();
    }
    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = flatten_join(joined) {
            failure.get_or_insert(e);
        }
    }
    drop(result_tx);

    match failure {
        Some(e) => Err(e),
        None => Ok(calls),
    }
}

fn flatten_join(joined: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(IndexError::Embed(format!("embed worker panicked: {e}"))),
    }
}

fn check_stop(stop: &watch::Receiver<bool>) -> Result<()> {
    if *stop.borrow() {
        Err(IndexError::Canceled)
    } else {
        Ok(())
    }
}

/// Never-fires stop signal for callers without cancellation plumbing.
/// Dropping the sender freezes the value at `false`.
pub fn no_stop() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}
