//! Update subsystem configuration.
//!
//! Loaded from `update.toml`. Everything except the manifest URL and the
//! install directory has a sensible default, so a minimal config is two
//! lines. The protected path set lives here as data, never as code: it is
//! what keeps credentials, trade databases, logs and user strategies out
//! of reach of any update package.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Install-relative directories an update package may never overwrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedPathSet(Vec<PathBuf>);

impl ProtectedPathSet {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self(paths)
    }

    /// True when `rel` (an install-relative path) is one of the protected
    /// entries or falls beneath one. Comparison is component-wise, so
    /// `configuration` is not shadowed by `config`.
    pub fn matches(&self, rel: &Path) -> bool {
        self.0.iter().any(|p| rel.starts_with(p))
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// URL of the remote version manifest. Must be https.
    pub manifest_url: String,

    /// Root of the installed application tree.
    pub install_dir: PathBuf,

    /// Where the updater keeps scratch downloads, backups, state and the
    /// attempt lock. Defaults to `<install_dir>/.cfbot-update`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Install-relative paths never touched by an update.
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<PathBuf>,

    /// Timeout for the manifest and changelog fetches, in seconds.
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    /// Timeout for the package download, in seconds.
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Total attempts for the transient network stages.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base backoff between retry attempts, in seconds.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    /// How many backup snapshots `prune` keeps.
    #[serde(default = "default_keep_backups")]
    pub keep_backups: usize,
}

fn default_protected_paths() -> Vec<PathBuf> {
    ["config", "data", "database", "strategies", "logs"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

fn default_check_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    2
}

fn default_keep_backups() -> usize {
    5
}

impl UpdateConfig {
    /// Minimal config for a given install tree; used by tests and by
    /// hosts that configure programmatically.
    pub fn for_install(manifest_url: impl Into<String>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            install_dir: install_dir.into(),
            data_dir: None,
            protected_paths: default_protected_paths(),
            check_timeout_secs: default_check_timeout(),
            download_timeout_secs: default_download_timeout(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff(),
            keep_backups: default_keep_backups(),
        }
    }

    /// Load a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: UpdateConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file location: explicit path, then
    /// `$XDG_CONFIG_HOME/cfbot/update.toml`, then `./update.toml`.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(config_dir) = dirs::config_dir() {
            let candidate = config_dir.join("cfbot").join("update.toml");
            if candidate.exists() {
                return candidate;
            }
        }
        PathBuf::from("update.toml")
    }

    /// Sanity checks that would otherwise surface mid-update.
    pub fn validate(&self) -> Result<()> {
        if !self.manifest_url.starts_with("https://") {
            anyhow::bail!(
                "manifest_url must use https, got {:?}",
                self.manifest_url
            );
        }
        for p in &self.protected_paths {
            if p.is_absolute() {
                anyhow::bail!(
                    "protected paths must be install-relative, got {}",
                    p.display()
                );
            }
        }
        if self.max_attempts == 0 {
            anyhow::bail!("max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn protected_set(&self) -> ProtectedPathSet {
        ProtectedPathSet::new(self.protected_paths.clone())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.install_dir.join(".cfbot-update"))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_dir().join("scratch")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir().join("backups")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir().join("update.lock")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir().join("state.json")
    }

    pub fn restart_marker_path(&self) -> PathBuf {
        self.data_dir().join("restart_requested")
    }
}
