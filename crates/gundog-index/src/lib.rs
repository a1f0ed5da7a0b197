//! Gundog retrieval engine.
//!
//! Local semantic retrieval over heterogeneous file corpora. The engine
//! ingests configured sources into dense vectors, BM25 postings, and a
//! document similarity graph, then answers queries by fusing vector kNN
//! with keyword scores and expanding along the graph.
//!
//! # Pipeline
//!
//! - **Ingest** ([`indexer`]): scan -> chunk -> embed -> upsert ->
//!   graph rebuild -> atomic manifest commit.
//! - **Query** ([`query`]): embed query -> kNN + BM25 -> RRF fusion
//!   ([`ranker`]) -> graph expansion -> assembled result.
//!
//! Readers operate on an immutable [`snapshot::IndexSnapshot`]; only
//! [`indexer::IndexBuilder`] mutates on-disk state, and every file is
//! committed shadow-then-rename.

pub mod chunker;
pub mod config;
pub mod doc_id;
pub mod embedding;
pub mod error;
pub mod fsutil;
pub mod git;
pub mod graph;
pub mod indexer;
pub mod keyword;
pub mod manifest;
pub mod query;
pub mod ranker;
pub mod scanner;
pub mod snapshot;
pub mod store;

pub use config::ProjectConfig;
pub use embedding::EmbeddingProvider;
pub use error::{IndexError, Result};
pub use indexer::{IndexBuilder, IndexStats};
pub use manifest::IndexManifest;
pub use query::{QueryEngine, QueryOptions, QueryResult};
pub use snapshot::IndexSnapshot;
