//! Single-flight locking for update attempts.
//!
//! Only one attempt may run against an install directory at a time:
//! concurrent backups or applies over the same tree would race. The lock
//! is a JSON file carrying the holder's PID and acquisition time, with
//! stale and dead-holder recovery so a crashed attempt never wedges the
//! updater.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Maximum age of a lock before it is considered stale. Generously above
/// the longest download timeout.
const MAX_LOCK_AGE_SECS: u64 = 1800;

/// Lock file contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID holding the lock.
    pub pid: u32,
    /// Unix epoch seconds when the lock was acquired.
    pub acquired_at: u64,
    /// Stage the holder was in when it last updated the lock.
    pub stage: String,
}

impl LockInfo {
    fn new(stage: &str) -> Self {
        Self {
            pid: process::id(),
            acquired_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            stage: stage.to_string(),
        }
    }

    fn age_secs(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now.saturating_sub(self.acquired_at)
    }

    fn is_stale(&self) -> bool {
        self.age_secs() > MAX_LOCK_AGE_SECS
    }

    fn process_exists(&self) -> bool {
        Path::new(&format!("/proc/{}", self.pid)).exists()
    }

    pub fn describe(&self) -> String {
        format!(
            "pid {} holds the lock since {}s ago (stage: {})",
            self.pid,
            self.age_secs(),
            self.stage
        )
    }
}

/// Errors from lock operations.
#[derive(Debug)]
pub enum UpdateLockError {
    /// Lock is held by a live process.
    AlreadyLocked { holder: LockInfo },
    /// IO error touching the lock file.
    IoError(io::Error),
}

impl std::fmt::Display for UpdateLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyLocked { holder } => write!(f, "{}", holder.describe()),
            Self::IoError(e) => write!(f, "lock IO error: {}", e),
        }
    }
}

impl std::error::Error for UpdateLockError {}

impl From<io::Error> for UpdateLockError {
    fn from(e: io::Error) -> Self {
        Self::IoError(e)
    }
}

/// Update lock handle. Released on drop.
pub struct UpdateLock {
    lock_path: PathBuf,
}

impl UpdateLock {
    /// Attempt to acquire the lock at `lock_path`.
    pub fn acquire(lock_path: &Path, stage: &str) -> Result<Self, UpdateLockError> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if lock_path.exists() {
            let content = fs::read_to_string(lock_path)?;
            match serde_json::from_str::<LockInfo>(&content) {
                Ok(holder) => {
                    if holder.is_stale() {
                        warn!(
                            pid = holder.pid,
                            age_secs = holder.age_secs(),
                            "recovering stale update lock"
                        );
                        fs::remove_file(lock_path)?;
                    } else if !holder.process_exists() {
                        warn!(pid = holder.pid, "recovering lock from dead process");
                        fs::remove_file(lock_path)?;
                    } else {
                        return Err(UpdateLockError::AlreadyLocked { holder });
                    }
                }
                Err(e) => {
                    warn!("recovering corrupted update lock: {}", e);
                    fs::remove_file(lock_path)?;
                }
            }
        }

        let info = LockInfo::new(stage);
        let content = serde_json::to_string_pretty(&info)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = fs::File::create(lock_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;

        info!(pid = info.pid, stage, "update lock acquired");

        Ok(Self {
            lock_path: lock_path.to_path_buf(),
        })
    }

    /// Record the current stage in the lock file, for operators
    /// inspecting a running attempt.
    pub fn update_stage(&mut self, stage: &str) -> io::Result<()> {
        if self.lock_path.exists() {
            let content = fs::read_to_string(&self.lock_path)?;
            if let Ok(mut info) = serde_json::from_str::<LockInfo>(&content) {
                info.stage = stage.to_string();
                let new_content = serde_json::to_string_pretty(&info)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                fs::write(&self.lock_path, new_content)?;
            }
        }
        Ok(())
    }

    fn is_held_by_us(&self) -> bool {
        if let Ok(content) = fs::read_to_string(&self.lock_path) {
            if let Ok(info) = serde_json::from_str::<LockInfo>(&content) {
                return info.pid == process::id();
            }
        }
        false
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        if self.is_held_by_us() {
            if let Err(e) = fs::remove_file(&self.lock_path) {
                warn!("failed to release update lock: {}", e);
            } else {
                info!("update lock released");
            }
        }
    }
}
