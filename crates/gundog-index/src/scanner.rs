//! Source scanning: walks ingestion roots and yields candidate files.
//!
//! Ignore precedence: explicit `ignore` patterns, then the named
//! `ignore_preset`, then `.gitignore` (when `use_gitignore` is set).
//! Binary files are skipped silently and only counted in the stats.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::{IndexError, Result};

/// Bytes sniffed from the head of each file for binary detection.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Invalid-byte tolerance (percent) before a file counts as binary.
const INVALID_UTF8_TOLERANCE_PCT: usize = 1;

/// A file produced by the scan, with the metadata the indexer diffs on.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub absolute: PathBuf,
    /// Path relative to the source root, used for stable ids.
    pub relative: String,
    pub mtime: u64,
    pub size: u64,
    pub source_type: Option<String>,
    /// Root of the source this file came from (for git lookups).
    pub source_root: PathBuf,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanStats {
    pub files: usize,
    pub binary_skipped: usize,
}

/// Built-in exclusion lists for common project layouts.
pub fn preset_patterns(name: &str) -> Option<&'static [&'static str]> {
    match name {
        "python" => Some(&[
            "**/__pycache__/**",
            "**/*.pyc",
            "**/.venv/**",
            "**/venv/**",
            "**/*.egg-info/**",
        ]),
        "rust" => Some(&["**/target/**"]),
        "node" => Some(&[
            "**/node_modules/**",
            "**/dist/**",
            "**/build/**",
            "**/.next/**",
        ]),
        "docs" => Some(&["**/_site/**", "**/.obsidian/**"]),
        _ => None,
    }
}

/// Scan all sources, returning an ordered, deduplicated file list.
///
/// Files are ordered by source declaration order, then by relative path.
/// A file reachable from two sources is attributed to the first.
pub fn scan_sources(sources: &[SourceConfig]) -> Result<(Vec<ScannedFile>, ScanStats)> {
    let mut stats = ScanStats::default();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut files = Vec::new();

    for source in sources {
        if !source.path.exists() {
            warn!(path = %source.path.display(), "source path does not exist, skipping");
            continue;
        }
        let mut from_source = scan_source(source, &mut stats)?;
        from_source.sort_by(|a, b| a.relative.cmp(&b.relative));
        for file in from_source {
            let key = file
                .absolute
                .canonicalize()
                .unwrap_or_else(|_| file.absolute.clone());
            if seen.insert(key) {
                files.push(file);
            }
        }
    }

    stats.files = files.len();
    Ok((files, stats))
}

fn scan_source(source: &SourceConfig, stats: &mut ScanStats) -> Result<Vec<ScannedFile>> {
    let root = source
        .path
        .canonicalize()
        .unwrap_or_else(|_| source.path.clone());

    let glob = build_glob_set(std::slice::from_ref(&source.glob))?;
    let mut ignore_patterns: Vec<String> = source.ignore.clone();
    if let Some(ref preset) = source.ignore_preset {
        let patterns = preset_patterns(preset).ok_or_else(|| {
            IndexError::Config(format!("unknown ignore_preset '{preset}'"))
        })?;
        ignore_patterns.extend(patterns.iter().map(|p| p.to_string()));
    }
    let ignores = build_glob_set(&ignore_patterns)?;

    let walker = WalkBuilder::new(&root)
        .hidden(true)
        .follow_links(true)
        .git_ignore(source.use_gitignore)
        .git_global(source.use_gitignore)
        .git_exclude(source.use_gitignore)
        .require_git(false)
        .build();

    let mut files = Vec::new();
    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        // Follows file symlinks; directory loops are caught by the
        // walker's (device, inode) ancestry checks.
        if !path.is_file() {
            continue;
        }
        let relative = match path.strip_prefix(&root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        if !glob.is_match(relative) || ignores.is_match(relative) {
            continue;
        }
        if is_binary(path)? {
            debug!(path = %path.display(), "skipping binary file");
            stats.binary_skipped += 1;
            continue;
        }

        let metadata = std::fs::metadata(path)?;
        let mtime = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        files.push(ScannedFile {
            absolute: path.to_path_buf(),
            relative: relative.to_string_lossy().to_string(),
            mtime,
            size: metadata.len(),
            source_type: source.source_type.clone(),
            source_root: root.clone(),
        });
    }

    Ok(files)
}

fn build_glob_set(patterns: &[impl AsRef<str>]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern.as_ref()).map_err(|e| {
            IndexError::Config(format!("invalid glob '{}': {e}", pattern.as_ref()))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IndexError::Config(format!("invalid glob set: {e}")))
}

/// Sniff the head of a file: NUL bytes or more than 1% invalid UTF-8
/// marks it binary.
fn is_binary(path: &Path) -> Result<bool> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; BINARY_SNIFF_BYTES];
    let mut read = 0;
    while read < buf.len() {
        let n = file.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    buf.truncate(read);

    if buf.is_empty() {
        return Ok(false);
    }
    if buf.contains(&0) {
        return Ok(true);
    }

    let mut invalid = 0usize;
    let mut offset = 0usize;
    while offset < buf.len() {
        match std::str::from_utf8(&buf[offset..]) {
            Ok(_) => break,
            Err(e) => {
                offset += e.valid_up_to();
                let skip = e.error_len().unwrap_or(buf.len() - offset);
                invalid += skip;
                offset += skip;
            }
        }
    }

    Ok(invalid * 100 > buf.len() * INVALID_UTF8_TOLERANCE_PCT)
}
