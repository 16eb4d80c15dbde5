//! Error taxonomy for the update subsystem.
//!
//! Every stage failure is translated into one of these kinds at the stage
//! boundary and attached to the orchestrator's `Failed` transition.
//! Nothing is silently swallowed.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdateError {
    /// The manifest could not be fetched (network error, timeout, bad
    /// HTTP status).
    #[error("Manifest unreachable: {0}")]
    ManifestUnreachable(String),

    /// The manifest was fetched but violates the schema: missing fields,
    /// non-semantic version strings, or an unencrypted URL.
    #[error("Manifest malformed: {0}")]
    ManifestMalformed(String),

    /// The package download ended early, was empty, or failed its
    /// checksum.
    #[error("Download incomplete: {0}")]
    DownloadIncomplete(String),

    /// The package archive does not contain exactly one top-level
    /// directory, or contains unsafe entry paths.
    #[error("Package structure invalid: {0}")]
    PackageStructureInvalid(String),

    /// A snapshot copy failed partway; the partial backup has been
    /// removed.
    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// The apply stage stopped mid-way. `written` lists the
    /// install-relative paths already copied before the failure.
    #[error("Apply failed after writing {} file(s): {reason}", written.len())]
    ApplyPartialFailure {
        reason: String,
        written: Vec<PathBuf>,
    },

    /// Restoring the backup snapshot failed. The install directory is in
    /// an unknown state: inspect it and the most recent snapshot manually
    /// before restarting the application.
    #[error(
        "Restore failed: {0}. The install directory may be inconsistent; \
         inspect it and the most recent backup snapshot manually."
    )]
    RestoreFailed(String),

    /// Another update attempt holds the lock for this install directory.
    /// Not a stage error; never retried automatically.
    #[error("Update already running: {0}")]
    AlreadyRunning(String),

    /// The attempt was cancelled by the caller before any install-dir
    /// mutation. Scratch state has been discarded.
    #[error("Update cancelled")]
    Cancelled,
}

impl UpdateError {
    /// True for the kinds that indicate transient network conditions and
    /// may be retried automatically with a bounded backoff. Everything
    /// else indicates a malformed release artifact or a local filesystem
    /// problem that retrying will not fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpdateError::ManifestUnreachable(_) | UpdateError::DownloadIncomplete(_)
        )
    }
}
