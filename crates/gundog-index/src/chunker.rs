//! Token-window chunking.
//!
//! Tokens are approximated by whitespace splits. Windows hold at most
//! `max_tokens` tokens and carry an `overlap_tokens` suffix into the next
//! window. Chunk boundaries are reported as whole lines: a chunk starts at
//! the line of its first token and ends at the line of its last.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;

/// A contiguous line window of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Position within the document, starting at 0.
    pub index: usize,
    /// Text of the covered lines.
    pub text: String,
    /// 1-indexed first line.
    pub start_line: usize,
    /// 1-indexed last line.
    pub end_line: usize,
    pub token_count: usize,
    pub content_hash: String,
}

/// Split document text into chunks according to the chunking settings.
///
/// With chunking disabled this returns a single chunk covering all lines.
pub fn chunk_text(content: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let lines: Vec<&str> = content.lines().collect();
    let line_count = lines.len().max(1);

    if !config.enabled {
        return vec![make_chunk(
            0,
            content.to_string(),
            1,
            line_count,
            content.split_whitespace().count(),
        )];
    }

    // (line number, token) pairs in document order.
    let mut tokens: Vec<(usize, &str)> = Vec::new();
    for (line_idx, line) in lines.iter().enumerate() {
        for token in line.split_whitespace() {
            tokens.push((line_idx + 1, token));
        }
    }

    if tokens.is_empty() {
        return vec![make_chunk(0, content.to_string(), 1, line_count, 0)];
    }

    let stride = config.max_tokens - config.overlap_tokens;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < tokens.len() {
        let end = (start + config.max_tokens).min(tokens.len());
        let window = &tokens[start..end];
        let start_line = window[0].0;
        let end_line = window[window.len() - 1].0;
        let text = lines[start_line - 1..end_line]
            .join("\n");

        chunks.push(make_chunk(index, text, start_line, end_line, window.len()));
        index += 1;

        if end == tokens.len() {
            break;
        }
        start += stride;
    }

    chunks
}

fn make_chunk(
    index: usize,
    text: String,
    start_line: usize,
    end_line: usize,
    token_count: usize,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let content_hash = hex::encode(hasher.finalize())[..16].to_string();

    Chunk {
        index,
        text,
        start_line,
        end_line,
        token_count,
        content_hash,
    }
}
