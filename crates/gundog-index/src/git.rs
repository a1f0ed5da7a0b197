//! Git metadata resolution.
//!
//! The engine treats git as an opaque collaborator: repository metadata
//! feeds index listings and result URLs, and per-file commit times feed
//! the recency boost. Everything here shells out to the `git` binary and
//! degrades to `None` outside a repository.

use std::path::Path;
use std::process::Command;

use serde::{Deserialize, Serialize};

/// Repository-level metadata for an index listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Browsable base URL (e.g. `https://github.com/org/repo`).
    pub web_url: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
}

pub trait GitResolver: Send + Sync {
    fn repo_info(&self, root: &Path) -> Option<RepoInfo>;

    /// Epoch seconds of the last commit touching `rel_path`.
    fn last_commit_time(&self, root: &Path, rel_path: &str) -> Option<i64>;
}

/// Resolver backed by the `git` command-line tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct CliGitResolver;

impl CliGitResolver {
    fn run(root: &Path, args: &[&str]) -> Option<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(root)
            .args(args)
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

impl GitResolver for CliGitResolver {
    fn repo_info(&self, root: &Path) -> Option<RepoInfo> {
        // Not a repository at all: no block in the listing.
        Self::run(root, &["rev-parse", "--git-dir"])?;

        let web_url = Self::run(root, &["config", "--get", "remote.origin.url"])
            .map(|url| normalize_remote_url(&url));
        let branch = Self::run(root, &["rev-parse", "--abbrev-ref", "HEAD"]);
        let commit = Self::run(root, &["rev-parse", "HEAD"]);

        Some(RepoInfo {
            web_url,
            branch,
            commit,
        })
    }

    fn last_commit_time(&self, root: &Path, rel_path: &str) -> Option<i64> {
        Self::run(root, &["log", "-1", "--format=%ct", "--", rel_path])
            .and_then(|s| s.parse().ok())
    }
}

/// Turn a git remote into a browsable URL: scp-style ssh remotes become
/// https and the `.git` suffix is dropped.
fn normalize_remote_url(remote: &str) -> String {
    let remote = remote.strip_suffix(".git").unwrap_or(remote);
    if let Some(rest) = remote.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            return format!("https://{host}/{path}");
        }
    }
    if let Some(rest) = remote.strip_prefix("ssh://git@") {
        return format!("https://{rest}");
    }
    remote.to_string()
}

/// Build a browsable file URL with a line-range anchor when available.
pub fn build_file_url(
    repo: &RepoInfo,
    rel_path: &str,
    lines: Option<(usize, usize)>,
) -> Option<String> {
    let web_url = repo.web_url.as_ref()?;
    let branch = repo.branch.as_deref().unwrap_or("main");
    let mut url = format!("{web_url}/blob/{branch}/{rel_path}");
    if let Some((start, end)) = lines {
        url.push_str(&format!("#L{start}-L{end}"));
    }
    Some(url)
}
