//! Daemon configuration (`~/.config/gundog/daemon.yaml`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the configured API key.
pub const API_KEY_ENV: &str = "GUNDOG_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    /// Registered indexes: name -> project root (or its index directory).
    #[serde(default)]
    pub indexes: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub default_index: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub serve_ui: bool,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub cors: CorsSettings,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            serve_ui: true,
            auth: AuthSettings::default(),
            cors: CorsSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CorsSettings {
    /// Empty list permits any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7676
}
fn default_true() -> bool {
    true
}

impl DaemonConfig {
    /// Default config location under the user's config directory.
    pub fn default_path() -> PathBuf {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("gundog").join("daemon.yaml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read daemon config {}", path.display()))?;
        let config: DaemonConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("malformed daemon config {}", path.display()))?;
        Ok(config)
    }

    /// Load the config, or start with defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Persist atomically (shadow-then-rename), for registry mutations.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("serialize daemon config")?;
        gundog_index::fsutil::write_atomic(path, content.as_bytes())
            .with_context(|| format!("write daemon config {}", path.display()))?;
        Ok(())
    }

    /// Effective API key: the environment wins over the config file.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.daemon.auth.api_key.clone())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.daemon.host, self.daemon.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.daemon.host, "127.0.0.1");
        assert_eq!(config.daemon.port, 7676);
        assert!(config.daemon.serve_ui);
        assert!(!config.daemon.auth.enabled);
        assert!(config.indexes.is_empty());
        assert!(config.default_index.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
daemon:
  host: 0.0.0.0
  port: 9000
  serve_ui: false
  auth:
    enabled: true
    api_key: sesame
  cors:
    allowed_origins:
      - https://example.test
indexes:
  notes: /data/notes
  code: /data/code
default_index: notes
"#;
        let config: DaemonConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.daemon.port, 9000);
        assert!(config.daemon.auth.enabled);
        assert_eq!(config.indexes.len(), 2);
        assert_eq!(config.default_index.as_deref(), Some("notes"));
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.yaml");

        let mut config = DaemonConfig::default();
        config
            .indexes
            .insert("notes".to_string(), PathBuf::from("/data/notes"));
        config.default_index = Some("notes".to_string());
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.indexes.len(), 1);
        assert_eq!(loaded.default_index.as_deref(), Some("notes"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load_or_default(&tmp.path().join("absent.yaml")).unwrap();
        assert!(config.indexes.is_empty());
    }

    #[test]
    fn test_malformed_config_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.yaml");
        std::fs::write(&path, "daemon: [").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}
