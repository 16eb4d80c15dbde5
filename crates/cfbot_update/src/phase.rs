//! Update state machine phases and progress events.
//!
//! The orchestrator's phase value is the single source of truth for what
//! stage an attempt is in. Hosts read it for display; everything else
//! flows through `UpdateEvent`s.

use crate::version::ReleaseVersion;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stage of the current (or last) update attempt.
///
/// `Idle -> Checking -> {NoUpdate | UpdateAvailable} -> Downloading ->
/// BackingUp -> Applying -> {Succeeded -> Restarting} | Failed ->
/// RollingBack -> RolledBack`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    /// Nothing in progress. Also the state a freshly restarted process
    /// begins in after a successful update.
    Idle,
    /// Fetching and evaluating the remote manifest.
    Checking,
    /// Check finished; the running version is current.
    NoUpdate,
    /// Check finished; a newer release is offered.
    UpdateAvailable { version: ReleaseVersion },
    /// Streaming the package archive to scratch.
    Downloading { percent: u8 },
    /// Snapshotting protected paths and files about to be overwritten.
    BackingUp,
    /// Merging the package into the install directory.
    Applying,
    /// All files written; restart pending.
    Succeeded { version: ReleaseVersion },
    /// The host has been signalled to terminate and relaunch.
    Restarting,
    /// A stage failed; the error kind is attached.
    Failed { reason: String },
    /// Restoring the pre-apply snapshot after an apply failure.
    RollingBack,
    /// The snapshot was restored; the install tree matches its pre-apply
    /// state for every path that existed before the attempt.
    RolledBack,
}

impl Default for UpdatePhase {
    fn default() -> Self {
        UpdatePhase::Idle
    }
}

impl UpdatePhase {
    /// True while an attempt is actively running. Cancellation and new
    /// attempts are rejected in these phases.
    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            UpdatePhase::Checking
                | UpdatePhase::Downloading { .. }
                | UpdatePhase::BackingUp
                | UpdatePhase::Applying
                | UpdatePhase::RollingBack
        )
    }

    pub fn format_display(&self) -> String {
        match self {
            UpdatePhase::Idle => "idle".to_string(),
            UpdatePhase::Checking => "checking for updates...".to_string(),
            UpdatePhase::NoUpdate => "up to date".to_string(),
            UpdatePhase::UpdateAvailable { version } => {
                format!("update available (v{})", version)
            }
            UpdatePhase::Downloading { percent } => format!("downloading... {}%", percent),
            UpdatePhase::BackingUp => "backing up...".to_string(),
            UpdatePhase::Applying => "applying...".to_string(),
            UpdatePhase::Succeeded { version } => format!("updated to v{}", version),
            UpdatePhase::Restarting => "restarting...".to_string(),
            UpdatePhase::Failed { reason } => format!("failed: {}", reason),
            UpdatePhase::RollingBack => "rolling back...".to_string(),
            UpdatePhase::RolledBack => "rolled back".to_string(),
        }
    }
}

/// Progress reported to the host while an attempt runs.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// The state machine moved to a new phase.
    Phase(UpdatePhase),
    /// Bytes received so far; total is the server-declared content
    /// length when known.
    DownloadProgress { received: u64, total: Option<u64> },
    /// A file was copied into the install directory.
    FileWritten { path: PathBuf },
    /// A file was withheld because it falls under a protected path.
    FileSkipped { path: PathBuf },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_progress_phases() {
        assert!(UpdatePhase::Checking.is_in_progress());
        assert!(UpdatePhase::Downloading { percent: 40 }.is_in_progress());
        assert!(UpdatePhase::BackingUp.is_in_progress());
        assert!(UpdatePhase::Applying.is_in_progress());
        assert!(UpdatePhase::RollingBack.is_in_progress());

        assert!(!UpdatePhase::Idle.is_in_progress());
        assert!(!UpdatePhase::NoUpdate.is_in_progress());
        assert!(!UpdatePhase::Restarting.is_in_progress());
        assert!(!UpdatePhase::RolledBack.is_in_progress());
        assert!(!UpdatePhase::Failed {
            reason: "x".into()
        }
        .is_in_progress());
    }

    #[test]
    fn test_format_display() {
        assert_eq!(UpdatePhase::Idle.format_display(), "idle");
        assert_eq!(
            UpdatePhase::Downloading { percent: 50 }.format_display(),
            "downloading... 50%"
        );
        assert_eq!(
            UpdatePhase::Succeeded {
                version: ReleaseVersion::new(1, 2, 0)
            }
            .format_display(),
            "updated to v1.2.0"
        );
    }

    #[test]
    fn test_phase_serialization() {
        let phase = UpdatePhase::UpdateAvailable {
            version: ReleaseVersion::new(1, 2, 0),
        };
        let json = serde_json::to_string(&phase).unwrap();
        assert!(json.contains("update_available"));
        let back: UpdatePhase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, phase);
    }
}
