//! Atomic file persistence.
//!
//! Every index file is written shadow-then-rename: the bytes go to a
//! `shadow.<name>` sibling, are fsynced, and the shadow is renamed onto
//! the live path. Readers never observe a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Shadow path for a target file (`manifest.json` -> `shadow.manifest.json`).
pub fn shadow_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!("shadow.{name}"))
}

/// Write bytes atomically: shadow file, fsync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let shadow = shadow_path(path);

    let mut file = std::fs::File::create(&shadow)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&shadow, path)?;

    // Make the rename durable as well.
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[test]
    fn test_no_shadow_left_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        write_atomic(&path, b"payload").unwrap();
        assert!(!shadow_path(&path).exists());
    }

    #[test]
    fn test_creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/deep/data.bin");
        write_atomic(&path, b"x").unwrap();
        assert!(path.exists());
    }
}
