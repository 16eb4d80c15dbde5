//! Persisted updater state.
//!
//! Two small pieces of local state survive across attempts: the `VERSION`
//! file in the install directory (the running client's version
//! identifier, read at startup and rewritten after a successful apply),
//! and `state.json` in the data directory recording what the last check
//! and the last attempt did. State writes are best-effort and never gate
//! an update.

use crate::version::ReleaseVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

/// Name of the version identifier file in the install directory.
pub const VERSION_FILE: &str = "VERSION";

/// Outcome of the last finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastOutcome {
    NoUpdate,
    Updated,
    Failed,
    RolledBack,
}

/// Check and attempt history, persisted as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateState {
    pub last_check: Option<DateTime<Utc>>,
    pub last_outcome: Option<LastOutcome>,
    pub last_error: Option<String>,
    pub version_before: Option<ReleaseVersion>,
    pub version_after: Option<ReleaseVersion>,
}

impl UpdateState {
    /// Load state, falling back to defaults on a missing or unreadable
    /// file.
    pub fn load(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }

    /// Save, logging rather than propagating failures.
    pub fn save_best_effort(&self, path: &Path) {
        if let Err(e) = self.save(path) {
            warn!("failed to persist update state: {}", e);
        }
    }

    pub fn record_check(&mut self, outcome: LastOutcome, error: Option<String>) {
        self.last_check = Some(Utc::now());
        self.last_outcome = Some(outcome);
        self.last_error = error;
    }

    pub fn record_updated(&mut self, before: ReleaseVersion, after: ReleaseVersion) {
        self.last_check = Some(Utc::now());
        self.last_outcome = Some(LastOutcome::Updated);
        self.last_error = None;
        self.version_before = Some(before);
        self.version_after = Some(after);
    }
}

/// Read the running client's version from the install directory's
/// `VERSION` file.
pub fn read_current_version(install_dir: &Path) -> Option<ReleaseVersion> {
    let content = fs::read_to_string(install_dir.join(VERSION_FILE)).ok()?;
    content.trim().parse().ok()
}

/// Rewrite the `VERSION` file after a successful apply.
pub fn write_current_version(install_dir: &Path, version: ReleaseVersion) -> io::Result<()> {
    fs::write(install_dir.join(VERSION_FILE), format!("{}\n", version))
}

/// The version identifier to compare against the manifest: the `VERSION`
/// file when present, this build's own version otherwise.
pub fn current_version(install_dir: &Path) -> ReleaseVersion {
    read_current_version(install_dir).unwrap_or_else(|| {
        env!("CARGO_PKG_VERSION")
            .parse()
            .expect("crate version is a valid release version")
    })
}
