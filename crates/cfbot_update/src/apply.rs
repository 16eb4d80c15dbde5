//! Apply engine: merge a validated package into the install directory.
//!
//! The package root's contents are first extracted into a staging area
//! under scratch, then copied file by file into the install directory.
//! Protected paths are skipped and logged, never copied. Updates are
//! additive and overwrite-only: a file present in the install directory
//! but absent from the package is never deleted. A package author must
//! ship replacement files to remove behavior, never rely on omission.

use crate::config::ProtectedPathSet;
use crate::error::UpdateError;
use crate::fetcher::PackageArtifact;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Per-file notification during the copy phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Written,
    Skipped,
}

/// Audit record of what an apply run did.
#[derive(Debug, Clone, Default)]
pub struct AppliedChangeSet {
    /// Install-relative paths copied into the install directory.
    pub written: Vec<PathBuf>,
    /// Install-relative paths withheld because they are protected.
    pub skipped: Vec<PathBuf>,
}

/// Extract and merge `artifact` into `install_dir`.
///
/// On a copy error the engine stops immediately and reports
/// `ApplyPartialFailure` carrying the list of files already written, so
/// the orchestrator can roll back from the pre-apply snapshot.
pub fn apply(
    artifact: &PackageArtifact,
    install_dir: &Path,
    protected: &ProtectedPathSet,
    staging_dir: &Path,
    mut on_file: impl FnMut(&Path, FileOutcome),
) -> Result<AppliedChangeSet, UpdateError> {
    extract_to_staging(artifact, staging_dir)?;

    let mut change_set = AppliedChangeSet::default();

    let mut staged_files = Vec::new();
    for entry in WalkDir::new(staging_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| UpdateError::ApplyPartialFailure {
            reason: format!("walking staging area: {}", e),
            written: Vec::new(),
        })?;
        if entry.file_type().is_file() {
            staged_files.push(entry.into_path());
        }
    }

    for staged in staged_files {
        let rel = match staged.strip_prefix(staging_dir) {
            Ok(rel) => rel.to_path_buf(),
            Err(e) => {
                let _ = fs::remove_dir_all(staging_dir);
                return Err(UpdateError::ApplyPartialFailure {
                    reason: format!("staged path outside staging area: {}", e),
                    written: change_set.written,
                });
            }
        };

        if protected.matches(&rel) {
            info!(path = %rel.display(), "skipping protected path");
            on_file(&rel, FileOutcome::Skipped);
            change_set.skipped.push(rel);
            continue;
        }

        let dest = install_dir.join(&rel);
        let copied = (|| {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&staged, &dest)?;
            Ok::<(), std::io::Error>(())
        })();

        if let Err(e) = copied {
            let _ = fs::remove_dir_all(staging_dir);
            return Err(UpdateError::ApplyPartialFailure {
                reason: format!("copying {}: {}", rel.display(), e),
                written: change_set.written,
            });
        }

        debug!(path = %rel.display(), "updated");
        on_file(&rel, FileOutcome::Written);
        change_set.written.push(rel);
    }

    let _ = fs::remove_dir_all(staging_dir);

    info!(
        written = change_set.written.len(),
        skipped = change_set.skipped.len(),
        "apply complete"
    );
    Ok(change_set)
}

/// Unpack the package root's contents into the staging area. Nothing is
/// written into the install directory at this stage.
fn extract_to_staging(artifact: &PackageArtifact, staging_dir: &Path) -> Result<(), UpdateError> {
    if staging_dir.exists() {
        fs::remove_dir_all(staging_dir).map_err(|e| UpdateError::ApplyPartialFailure {
            reason: format!("clearing staging area: {}", e),
            written: Vec::new(),
        })?;
    }
    fs::create_dir_all(staging_dir).map_err(|e| UpdateError::ApplyPartialFailure {
        reason: format!("creating staging area: {}", e),
        written: Vec::new(),
    })?;

    let file = File::open(&artifact.local_path).map_err(|e| UpdateError::ApplyPartialFailure {
        reason: format!("reopening artifact: {}", e),
        written: Vec::new(),
    })?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let entries = archive
        .entries()
        .map_err(|e| UpdateError::PackageStructureInvalid(format!("unreadable archive: {}", e)))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| {
            UpdateError::PackageStructureInvalid(format!("unreadable archive entry: {}", e))
        })?;

        let entry_path = entry.path().map_err(|e| {
            UpdateError::PackageStructureInvalid(format!("undecodable entry path: {}", e))
        })?;

        let mut components = Vec::new();
        for component in entry_path.components() {
            match component {
                Component::Normal(part) => components.push(PathBuf::from(part)),
                Component::CurDir => {}
                _ => {
                    return Err(UpdateError::PackageStructureInvalid(format!(
                        "unsafe entry path {:?}",
                        entry_path
                    )))
                }
            }
        }
        if components.is_empty() {
            continue;
        }

        // The artifact was validated at fetch time; a different root now
        // means the file changed on disk since.
        if components[0].to_string_lossy() != artifact.package_root {
            return Err(UpdateError::PackageStructureInvalid(format!(
                "entry outside package root {:?}",
                artifact.package_root
            )));
        }
        if components.len() == 1 {
            continue;
        }

        let rel: PathBuf = components[1..].iter().collect();
        let dest = staging_dir.join(&rel);

        if entry.header().entry_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| UpdateError::ApplyPartialFailure {
                reason: format!("staging {}: {}", rel.display(), e),
                written: Vec::new(),
            })?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| UpdateError::ApplyPartialFailure {
                    reason: format!("staging {}: {}", rel.display(), e),
                    written: Vec::new(),
                })?;
            }
            entry
                .unpack(&dest)
                .map_err(|e| UpdateError::ApplyPartialFailure {
                    reason: format!("staging {}: {}", rel.display(), e),
                    written: Vec::new(),
                })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn build_package(dest: &Path, root: &str, files: &[(&str, &str)]) -> PackageArtifact {
        let encoder = GzEncoder::new(File::create(dest).unwrap(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{}/{}", root, name), body.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        PackageArtifact::open(dest).unwrap()
    }

    fn protected() -> ProtectedPathSet {
        ProtectedPathSet::new(vec![
            PathBuf::from("config"),
            PathBuf::from("data"),
            PathBuf::from("logs"),
        ])
    }

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_apply_writes_and_overwrites() {
        let temp = TempDir::new().unwrap();
        let install = temp.path().join("install");
        write(&install.join("app.py"), "old main");

        let artifact = build_package(
            &temp.path().join("pkg.tar.gz"),
            "cfbot-1.2.0",
            &[("app.py", "new main"), ("lib/engine.py", "engine")],
        );

        let changes = apply(
            &artifact,
            &install,
            &protected(),
            &temp.path().join("staging"),
            |_, _| {},
        )
        .unwrap();

        assert_eq!(changes.written.len(), 2);
        assert!(changes.skipped.is_empty());
        assert_eq!(fs::read_to_string(install.join("app.py")).unwrap(), "new main");
        assert_eq!(
            fs::read_to_string(install.join("lib/engine.py")).unwrap(),
            "engine"
        );
    }

    #[test]
    fn test_protected_files_never_overwritten() {
        let temp = TempDir::new().unwrap();
        let install = temp.path().join("install");
        write(&install.join("config/keys.json"), "real credentials");

        let artifact = build_package(
            &temp.path().join("pkg.tar.gz"),
            "cfbot-1.2.0",
            &[
                ("config/keys.json", "placeholder credentials"),
                ("app.py", "main"),
            ],
        );

        let mut skipped_seen = Vec::new();
        let changes = apply(
            &artifact,
            &install,
            &protected(),
            &temp.path().join("staging"),
            |path, outcome| {
                if outcome == FileOutcome::Skipped {
                    skipped_seen.push(path.to_path_buf());
                }
            },
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(install.join("config/keys.json")).unwrap(),
            "real credentials"
        );
        assert_eq!(changes.skipped, vec![PathBuf::from("config/keys.json")]);
        assert_eq!(skipped_seen, changes.skipped);
        assert_eq!(changes.written, vec![PathBuf::from("app.py")]);
    }

    #[test]
    fn test_apply_never_deletes_unlisted_files() {
        let temp = TempDir::new().unwrap();
        let install = temp.path().join("install");
        write(&install.join("keep_me.py"), "still here");

        let artifact = build_package(
            &temp.path().join("pkg.tar.gz"),
            "cfbot-1.2.0",
            &[("app.py", "main")],
        );

        apply(
            &artifact,
            &install,
            &protected(),
            &temp.path().join("staging"),
            |_, _| {},
        )
        .unwrap();

        assert_eq!(
            fs::read_to_string(install.join("keep_me.py")).unwrap(),
            "still here"
        );
    }

    #[test]
    fn test_partial_failure_reports_written_files() {
        let temp = TempDir::new().unwrap();
        let install = temp.path().join("install");
        // A plain file where the package needs a directory forces a copy
        // error partway through the run.
        write(&install.join("lib"), "i block the lib directory");

        let artifact = build_package(
            &temp.path().join("pkg.tar.gz"),
            "cfbot-1.2.0",
            &[("aaa.py", "first"), ("lib/engine.py", "engine")],
        );

        let err = apply(
            &artifact,
            &install,
            &protected(),
            &temp.path().join("staging"),
            |_, _| {},
        )
        .unwrap_err();

        match err {
            UpdateError::ApplyPartialFailure { written, .. } => {
                assert_eq!(written, vec![PathBuf::from("aaa.py")]);
            }
            other => panic!("expected ApplyPartialFailure, got {:?}", other),
        }
        // The file written before the failure is on disk; rollback is the
        // orchestrator's job.
        assert_eq!(fs::read_to_string(install.join("aaa.py")).unwrap(), "first");
    }

    #[test]
    fn test_apply_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let install = temp.path().join("install");

        let artifact = build_package(
            &temp.path().join("pkg.tar.gz"),
            "cfbot-1.2.0",
            &[("app.py", "main"), ("lib/engine.py", "engine")],
        );

        let first = apply(
            &artifact,
            &install,
            &protected(),
            &temp.path().join("staging"),
            |_, _| {},
        )
        .unwrap();
        let second = apply(
            &artifact,
            &install,
            &protected(),
            &temp.path().join("staging"),
            |_, _| {},
        )
        .unwrap();

        assert_eq!(first.written, second.written);
        assert_eq!(fs::read_to_string(install.join("app.py")).unwrap(), "main");
        assert_eq!(
            fs::read_to_string(install.join("lib/engine.py")).unwrap(),
            "engine"
        );
    }

    #[test]
    fn test_staging_cleaned_after_apply() {
        let temp = TempDir::new().unwrap();
        let install = temp.path().join("install");
        let staging = temp.path().join("staging");

        let artifact = build_package(
            &temp.path().join("pkg.tar.gz"),
            "cfbot-1.2.0",
            &[("app.py", "main")],
        );

        apply(&artifact, &install, &protected(), &staging, |_, _| {}).unwrap();
        assert!(!staging.exists());
    }
}
