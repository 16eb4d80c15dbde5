//! Backup snapshots of protected state.
//!
//! Before the apply stage mutates anything, every protected directory and
//! every file the package would overwrite is copied into a timestamped
//! snapshot. Snapshots are all-or-nothing: a copy failure removes the
//! partial snapshot rather than leaving something a later restore might
//! trust. Snapshots are never deleted on a successful apply; only the
//! explicit prune policy removes old ones.

use crate::error::UpdateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Metadata file written inside every snapshot directory.
const SNAPSHOT_MANIFEST: &str = "snapshot.json";

/// One backed-up source path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// Directory name under `<snapshot>/files/`.
    pub name: String,
    /// Absolute path the entry was copied from, and restores to.
    pub original: PathBuf,
}

/// A completed snapshot, persisted as `snapshot.json` alongside the
/// copied tree so it can be found after a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    /// Timestamp-derived identifier, also the directory name.
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub source_paths: Vec<PathBuf>,
    /// Snapshot directory.
    pub location: PathBuf,
    entries: Vec<SnapshotEntry>,
}

impl BackupSnapshot {
    /// Load a snapshot from its directory.
    pub fn load(location: &Path) -> Result<Self, UpdateError> {
        let content = fs::read_to_string(location.join(SNAPSHOT_MANIFEST))
            .map_err(|e| UpdateError::RestoreFailed(format!("read snapshot manifest: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| UpdateError::RestoreFailed(format!("parse snapshot manifest: {}", e)))
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }
}

/// Creates, restores and prunes snapshots under one backup root.
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Copy each existing source path into a new timestamped snapshot.
    ///
    /// All-or-nothing: any copy failure removes the partially written
    /// snapshot directory and fails with `BackupFailed`.
    pub fn snapshot(&self, paths: &[PathBuf]) -> Result<BackupSnapshot, UpdateError> {
        let id = self.next_id();
        let location = self.root.join(&id);
        let files_dir = location.join("files");

        let result = self.snapshot_into(&files_dir, paths);
        let entries = match result {
            Ok(entries) => entries,
            Err(e) => {
                let _ = fs::remove_dir_all(&location);
                return Err(UpdateError::BackupFailed(e.to_string()));
            }
        };

        let snapshot = BackupSnapshot {
            id: id.clone(),
            created_at: Utc::now(),
            source_paths: paths.to_vec(),
            location: location.clone(),
            entries,
        };

        let manifest = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        let written = manifest.and_then(|m| fs::write(location.join(SNAPSHOT_MANIFEST), m));
        if let Err(e) = written {
            let _ = fs::remove_dir_all(&location);
            return Err(UpdateError::BackupFailed(format!(
                "write snapshot manifest: {}",
                e
            )));
        }

        info!(
            id = %snapshot.id,
            sources = snapshot.entries.len(),
            "backup snapshot created"
        );
        Ok(snapshot)
    }

    fn snapshot_into(
        &self,
        files_dir: &Path,
        paths: &[PathBuf],
    ) -> io::Result<Vec<SnapshotEntry>> {
        fs::create_dir_all(files_dir)?;

        let mut entries = Vec::new();
        for (i, source) in paths.iter().enumerate() {
            if !source.exists() {
                continue;
            }
            let base = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "root".to_string());
            let name = format!("{:03}_{}", i, base);
            let dest = files_dir.join(&name);

            if source.is_dir() {
                copy_tree(source, &dest)?;
            } else {
                fs::copy(source, &dest)?;
            }
            entries.push(SnapshotEntry {
                name,
                original: source.clone(),
            });
        }
        Ok(entries)
    }

    /// Copy a snapshot back over the live tree. Used only after a failed
    /// apply. Failures are fatal for the attempt and must reach the
    /// operator directly; they are never retried automatically.
    pub fn restore(&self, snapshot: &BackupSnapshot) -> Result<(), UpdateError> {
        info!(id = %snapshot.id, "restoring backup snapshot");

        for entry in &snapshot.entries {
            let src = snapshot.location.join("files").join(&entry.name);
            if !src.exists() {
                return Err(UpdateError::RestoreFailed(format!(
                    "snapshot entry {} is missing from {}",
                    entry.name,
                    snapshot.location.display()
                )));
            }

            let result = if src.is_dir() {
                copy_tree(&src, &entry.original)
            } else {
                copy_file(&src, &entry.original)
            };

            result.map_err(|e| {
                UpdateError::RestoreFailed(format!(
                    "restoring {}: {}",
                    entry.original.display(),
                    e
                ))
            })?;
        }

        info!(id = %snapshot.id, "backup snapshot restored");
        Ok(())
    }

    /// All snapshots under the backup root, newest first.
    pub fn list(&self) -> Vec<BackupSnapshot> {
        let Ok(read) = fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut snapshots: Vec<BackupSnapshot> = read
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| match BackupSnapshot::load(&e.path()) {
                Ok(s) => Some(s),
                Err(err) => {
                    warn!(path = %e.path().display(), "skipping unreadable snapshot: {}", err);
                    None
                }
            })
            .collect();

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    pub fn latest(&self) -> Option<BackupSnapshot> {
        self.list().into_iter().next()
    }

    /// Remove all but the newest `keep` snapshots. Returns how many were
    /// removed.
    pub fn prune(&self, keep: usize) -> io::Result<usize> {
        let mut removed = 0;
        for snapshot in self.list().into_iter().skip(keep) {
            fs::remove_dir_all(&snapshot.location)?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, keep, "pruned old backup snapshots");
        }
        Ok(removed)
    }

    fn next_id(&self) -> String {
        let base = format!("backup_{}", Utc::now().format("%Y%m%d_%H%M%S"));
        let mut id = base.clone();
        let mut n = 1;
        while self.root.join(&id).exists() {
            id = format!("{}_{}", base, n);
            n += 1;
        }
        id
    }
}

/// Copy a single file, creating missing parent directories.
fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

/// Recursive copy preserving the relative layout.
fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("walk {}: {}", src.display(), e))
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_snapshot_and_restore_roundtrip() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("install");
        write(&live.join("config/keys.json"), "secret");
        write(&live.join("data/trades.db"), "rows");
        write(&live.join("app.bin"), "v1");

        let manager = BackupManager::new(temp.path().join("backups"));
        let snapshot = manager
            .snapshot(&[
                live.join("config"),
                live.join("data"),
                live.join("app.bin"),
            ])
            .unwrap();
        assert_eq!(snapshot.entries().len(), 3);

        // Mutate the live tree the way a bad apply would
        fs::write(live.join("config/keys.json"), "clobbered").unwrap();
        fs::write(live.join("app.bin"), "v2").unwrap();
        fs::remove_file(live.join("data/trades.db")).unwrap();

        manager.restore(&snapshot).unwrap();

        assert_eq!(
            fs::read_to_string(live.join("config/keys.json")).unwrap(),
            "secret"
        );
        assert_eq!(fs::read_to_string(live.join("app.bin")).unwrap(), "v1");
        assert_eq!(
            fs::read_to_string(live.join("data/trades.db")).unwrap(),
            "rows"
        );
    }

    #[test]
    fn test_nonexistent_sources_are_skipped() {
        let temp = TempDir::new().unwrap();
        let manager = BackupManager::new(temp.path().join("backups"));
        let snapshot = manager
            .snapshot(&[temp.path().join("does-not-exist")])
            .unwrap();
        assert!(snapshot.entries().is_empty());
    }

    #[test]
    fn test_failed_snapshot_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        // Backup root path blocked by a plain file
        let blocked = temp.path().join("blocked");
        fs::write(&blocked, "i am a file").unwrap();

        let manager = BackupManager::new(blocked.join("backups"));
        let err = manager.snapshot(&[temp.path().to_path_buf()]).unwrap_err();
        assert!(matches!(err, UpdateError::BackupFailed(_)));
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_restore_fails_on_missing_entry() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("install");
        write(&live.join("config/keys.json"), "secret");

        let manager = BackupManager::new(temp.path().join("backups"));
        let snapshot = manager.snapshot(&[live.join("config")]).unwrap();

        fs::remove_dir_all(snapshot.location.join("files")).unwrap();

        let err = manager.restore(&snapshot).unwrap_err();
        assert!(matches!(err, UpdateError::RestoreFailed(_)));
    }

    #[test]
    fn test_list_and_prune_keep_newest() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("install");
        write(&live.join("config/keys.json"), "secret");

        let manager = BackupManager::new(temp.path().join("backups"));
        let s1 = manager.snapshot(&[live.join("config")]).unwrap();
        let s2 = manager.snapshot(&[live.join("config")]).unwrap();
        let s3 = manager.snapshot(&[live.join("config")]).unwrap();
        assert_eq!(manager.list().len(), 3);

        let removed = manager.prune(2).unwrap();
        assert_eq!(removed, 1);

        let remaining: Vec<String> = manager.list().into_iter().map(|s| s.id).collect();
        assert!(remaining.contains(&s3.id));
        assert!(remaining.contains(&s2.id));
        assert!(!remaining.contains(&s1.id));
    }

    #[test]
    fn test_snapshot_ids_are_unique() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("install");
        write(&live.join("config/keys.json"), "secret");

        let manager = BackupManager::new(temp.path().join("backups"));
        let a = manager.snapshot(&[live.join("config")]).unwrap();
        let b = manager.snapshot(&[live.join("config")]).unwrap();
        assert_ne!(a.id, b.id);
    }
}
