//! Stable document and chunk identifiers.
//!
//! A document id is a truncated SHA256 of the path relative to its source
//! root, so ids survive re-ingests and renames of the index directory.
//! Chunk ids append the chunk ordinal: `"{doc_id}#{index}"`.

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA256 digest.
const DOC_ID_LEN: usize = 16;

/// Compute the stable id for a document from its relative path.
pub fn doc_id(relative_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(relative_path.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..DOC_ID_LEN].to_string()
}

/// Build a chunk id from a document id and chunk index.
pub fn chunk_id(doc: &str, index: usize) -> String {
    format!("{doc}#{index}")
}

/// Split an id into `(doc_id, chunk_index)`.
///
/// Whole-document ids (chunking disabled) have no `#` suffix and return
/// `None` for the chunk index.
pub fn parse_id(id: &str) -> (&str, Option<usize>) {
    match id.rsplit_once('#') {
        Some((doc, idx)) => match idx.parse() {
            Ok(n) => (doc, Some(n)),
            Err(_) => (id, None),
        },
        None => (id, None),
    }
}
