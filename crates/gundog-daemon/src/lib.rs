//! Gundog query daemon.
//!
//! Hosts loaded indexes behind a WebSocket RPC so the embedding model
//! stays warm between queries. The daemon owns the index registry, a
//! loaded-index LRU cache, and the wire protocol; retrieval itself lives
//! in `gundog-index`.

pub mod cache;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod server;

pub use config::DaemonConfig;
pub use registry::IndexRegistry;
pub use server::{DaemonState, LoadedIndex};
