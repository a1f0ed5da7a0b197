//! Index registry: the daemon-side map from index names to on-disk
//! indexes, persisted inside the daemon config file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

use gundog_index::config::{
    EmbeddingConfig, ProjectConfig, StorageBackend, StorageConfig,
};
use gundog_index::git::{CliGitResolver, GitResolver, RepoInfo};
use gundog_index::manifest::IndexManifest;
use gundog_index::snapshot::MANIFEST_FILE;

use crate::config::DaemonConfig;
use crate::protocol::{WireGitInfo, WireIndexInfo};

/// Directory a project keeps its index and config under.
pub const INDEX_DIR_NAME: &str = ".gundog";

/// Number of sample paths included in index listings.
const SAMPLE_PATHS: usize = 5;

pub struct IndexRegistry {
    path: PathBuf,
    config: DaemonConfig,
}

impl IndexRegistry {
    pub fn new(path: PathBuf, config: DaemonConfig) -> Self {
        Self { path, config }
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let config = DaemonConfig::load_or_default(&path)?;
        Ok(Self { path, config })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Register an index. The first registered index becomes the default.
    pub fn add(&mut self, name: &str, root: &Path) -> Result<()> {
        if !root.exists() {
            bail!("index path does not exist: {}", root.display());
        }
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        self.config.indexes.insert(name.to_string(), root);
        if self.config.default_index.is_none() {
            self.config.default_index = Some(name.to_string());
        }
        self.persist()
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.config.indexes.remove(name).is_none() {
            bail!("unknown index: {name}");
        }
        if self.config.default_index.as_deref() == Some(name) {
            self.config.default_index = self.config.indexes.keys().next().cloned();
        }
        self.persist()
    }

    /// Atomically switch the default index.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.config.indexes.contains_key(name) {
            bail!("unknown index: {name}");
        }
        self.config.default_index = Some(name.to_string());
        self.persist()
    }

    pub fn get(&self, name: &str) -> Option<&PathBuf> {
        self.config.indexes.get(name)
    }

    pub fn default_index(&self) -> Option<&str> {
        self.config.default_index.as_deref()
    }

    pub fn names(&self) -> Vec<String> {
        self.config.indexes.keys().cloned().collect()
    }

    /// Aggregate manifest headers and git metadata for every registered
    /// index.
    pub fn list(&self) -> Vec<WireIndexInfo> {
        self.config
            .indexes
            .iter()
            .map(|(name, root)| inspect_index(name, root))
            .collect()
    }

    fn persist(&self) -> Result<()> {
        self.config.save(&self.path)
    }
}

/// Resolve a registered root to its `.gundog` directory.
pub fn gundog_dir(root: &Path) -> PathBuf {
    if root.file_name().map(|n| n == INDEX_DIR_NAME).unwrap_or(false) {
        root.to_path_buf()
    } else {
        root.join(INDEX_DIR_NAME)
    }
}

/// Project root for git metadata (parent of the `.gundog` directory).
pub fn project_root(root: &Path) -> PathBuf {
    if root.file_name().map(|n| n == INDEX_DIR_NAME).unwrap_or(false) {
        root.parent().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf())
    } else {
        root.to_path_buf()
    }
}

/// Load a registered index's project config.
///
/// Reads `<root>/.gundog/config.yaml` when present, otherwise falls back
/// to a minimal config. Relative storage paths resolve against the
/// `.gundog` directory.
pub fn load_project(root: &Path) -> Result<ProjectConfig> {
    let dir = gundog_dir(root);
    let config_file = dir.join("config.yaml");

    let mut config = if config_file.exists() {
        ProjectConfig::load(&config_file)
            .with_context(|| format!("load project config {}", config_file.display()))?
    } else {
        debug!(dir = %dir.display(), "no config.yaml, using defaults");
        ProjectConfig {
            sources: vec![],
            embedding: EmbeddingConfig::default(),
            storage: StorageConfig {
                backend: StorageBackend::DenseFile,
                path: PathBuf::from("index"),
            },
            graph: Default::default(),
            hybrid: Default::default(),
            recency: Default::default(),
            chunking: Default::default(),
        }
    };

    if config.storage.path.is_relative() {
        config.storage.path = dir.join(&config.storage.path);
    }
    Ok(config)
}

/// Read an index's manifest header without opening its stores.
fn inspect_index(name: &str, root: &Path) -> WireIndexInfo {
    let mut info = WireIndexInfo {
        name: name.to_string(),
        path: root.display().to_string(),
        file_count: 0,
        chunk_count: 0,
        last_updated: None,
        model: None,
        sample_paths: vec![],
        git: None,
    };

    if let Ok(project) = load_project(root) {
        let manifest_path = project.storage.path.join(MANIFEST_FILE);
        if let Ok(manifest) = IndexManifest::load(&manifest_path) {
            info.file_count = manifest.file_count();
            info.chunk_count = manifest.chunk_count();
            info.last_updated = manifest.last_ingest;
            info.model = Some(manifest.model);
            info.sample_paths = manifest
                .files
                .keys()
                .take(SAMPLE_PATHS)
                .cloned()
                .collect();
        }
    }

    info.git = CliGitResolver
        .repo_info(&project_root(root))
        .map(wire_git);
    info
}

fn wire_git(repo: RepoInfo) -> WireGitInfo {
    WireGitInfo {
        web_url: repo.web_url,
        branch: repo.branch,
        commit: repo.commit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(tmp: &Path) -> IndexRegistry {
        IndexRegistry::new(tmp.join("daemon.yaml"), DaemonConfig::default())
    }

    #[test]
    fn test_add_sets_first_default() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        std::fs::create_dir(&root).unwrap();

        let mut reg = registry(tmp.path());
        reg.add("notes", &root).unwrap();
        assert_eq!(reg.default_index(), Some("notes"));
        assert!(reg.get("notes").is_some());

        // Registry file written atomically on mutation.
        let persisted = DaemonConfig::load(&tmp.path().join("daemon.yaml")).unwrap();
        assert!(persisted.indexes.contains_key("notes"));
    }

    #[test]
    fn test_add_missing_path_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut reg = registry(tmp.path());
        assert!(reg.add("ghost", &tmp.path().join("absent")).is_err());
    }

    #[test]
    fn test_remove_reassigns_default() {
        let tmp = tempfile::tempdir().unwrap();
        for name in ["a", "b"] {
            std::fs::create_dir(tmp.path().join(name)).unwrap();
        }
        let mut reg = registry(tmp.path());
        reg.add("a", &tmp.path().join("a")).unwrap();
        reg.add("b", &tmp.path().join("b")).unwrap();
        assert_eq!(reg.default_index(), Some("a"));

        reg.remove("a").unwrap();
        assert_eq!(reg.default_index(), Some("b"));
        assert!(reg.remove("a").is_err());
    }

    #[test]
    fn test_set_default_requires_known_name() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("a")).unwrap();
        let mut reg = registry(tmp.path());
        reg.add("a", &tmp.path().join("a")).unwrap();

        assert!(reg.set_default("missing").is_err());
        reg.set_default("a").unwrap();
        assert_eq!(reg.default_index(), Some("a"));
    }

    #[test]
    fn test_gundog_dir_resolution() {
        assert_eq!(
            gundog_dir(Path::new("/proj")),
            PathBuf::from("/proj/.gundog")
        );
        assert_eq!(
            gundog_dir(Path::new("/proj/.gundog")),
            PathBuf::from("/proj/.gundog")
        );
        assert_eq!(project_root(Path::new("/proj/.gundog")), PathBuf::from("/proj"));
    }

    #[test]
    fn test_load_project_defaults_without_config() {
        let tmp = tempfile::tempdir().unwrap();
        let project = load_project(tmp.path()).unwrap();
        assert_eq!(
            project.storage.path,
            tmp.path().join(INDEX_DIR_NAME).join("index")
        );
        assert!(project.sources.is_empty());
    }

    #[test]
    fn test_load_project_reads_config_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(INDEX_DIR_NAME);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.yaml"),
            "storage:\n  backend: columnar-ann\n  path: store\n",
        )
        .unwrap();

        let project = load_project(tmp.path()).unwrap();
        assert_eq!(project.storage.backend, StorageBackend::ColumnarAnn);
        assert_eq!(project.storage.path, dir.join("store"));
    }

    #[test]
    fn test_list_reports_manifest_header() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("proj");
        let index_dir = root.join(INDEX_DIR_NAME).join("index");
        std::fs::create_dir_all(&index_dir).unwrap();

        // Write a manifest the listing should surface.
        let project = load_project(&root).unwrap();
        let mut manifest = IndexManifest::empty(&project);
        manifest.files.insert(
            "a.md".to_string(),
            gundog_index::manifest::FileEntry {
                doc_id: "d1".to_string(),
                content_hash: "h".to_string(),
                mtime: 1,
                size: 2,
                source_type: None,
                chunks: vec![gundog_index::manifest::ChunkSpan {
                    start_line: 1,
                    end_line: 3,
                    token_count: 5,
                    content_hash: "c".to_string(),
                }],
                git_last_commit_time: None,
            },
        );
        manifest.stamp_ingest();
        manifest.save(&index_dir.join(MANIFEST_FILE)).unwrap();

        let mut reg = registry(tmp.path());
        reg.add("proj", &root).unwrap();
        let listed = reg.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].file_count, 1);
        assert_eq!(listed[0].chunk_count, 1);
        assert!(listed[0].last_updated.is_some());
        assert_eq!(listed[0].sample_paths, vec!["a.md".to_string()]);
    }
}
