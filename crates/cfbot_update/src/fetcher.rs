//! Package download and pre-extraction validation.
//!
//! Downloads stream to a `.partial` path first and only take the final
//! artifact name after a clean end-of-stream, so a dropped connection can
//! never be mistaken for a complete package. Structural validation reads
//! the archive listing without extracting anything: an update package
//! must contain exactly one top-level directory, and nothing is unpacked
//! from an archive whose layout has not been checked.

use crate::error::UpdateError;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// A downloaded, structurally validated update package.
#[derive(Debug, Clone)]
pub struct PackageArtifact {
    /// Final artifact path in the scratch directory.
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// Name of the single top-level directory.
    pub package_root: String,
    /// Install-relative paths of every file beneath the package root.
    entries: Vec<PathBuf>,
}

impl PackageArtifact {
    /// Validate an archive on disk and build the artifact record.
    ///
    /// Fails with `PackageStructureInvalid` before any extraction if the
    /// archive lacks a single top-level directory, contains unsafe entry
    /// paths (absolute or parent-traversing), or carries entry types
    /// other than plain files and directories.
    pub fn open(path: &Path) -> Result<Self, UpdateError> {
        let file = File::open(path).map_err(|e| {
            UpdateError::PackageStructureInvalid(format!(
                "cannot open archive {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));

        let mut root: Option<String> = None;
        let mut entries = Vec::new();

        let iter = archive
            .entries()
            .map_err(|e| UpdateError::PackageStructureInvalid(format!("unreadable archive: {}", e)))?;

        for entry in iter {
            let entry = entry.map_err(|e| {
                UpdateError::PackageStructureInvalid(format!("unreadable archive entry: {}", e))
            })?;

            let entry_type = entry.header().entry_type();
            if !entry_type.is_dir() && !entry_type.is_file() {
                return Err(UpdateError::PackageStructureInvalid(format!(
                    "unsupported entry type {:?} in archive",
                    entry_type
                )));
            }

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

            let first = components[0].to_string_lossy().to_string();
            match &root {
                None => root = Some(first.clone()),
                Some(existing) if *existing == first => {}
                Some(existing) => {
                    return Err(UpdateError::PackageStructureInvalid(format!(
                        "multiple top-level entries: {:?} and {:?}",
                        existing, first
                    )))
                }
            }

            if components.len() == 1 {
                if entry_type.is_file() {
                    return Err(UpdateError::PackageStructureInvalid(format!(
                        "top-level file {:?} outside a package root directory",
                        first
                    )));
                }
            } else if entry_type.is_file() {
                entries.push(components[1..].iter().collect());
            }
        }

        let package_root = root.ok_or_else(|| {
            UpdateError::PackageStructureInvalid("archive is empty".to_string())
        })?;
        if entries.is_empty() {
            return Err(UpdateError::PackageStructureInvalid(format!(
                "package root {:?} contains no files",
                package_root
            )));
        }

        let size_bytes = fs::metadata(path)
            .map_err(|e| UpdateError::PackageStructureInvalid(e.to_string()))?
            .len();

        debug!(
            root = %package_root,
            files = entries.len(),
            size_bytes,
            "package structure validated"
        );

        Ok(Self {
            local_path: path.to_path_buf(),
            size_bytes,
            package_root,
            entries,
        })
    }

    /// Install-relative paths this package would write.
    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    /// Delete the artifact file. Artifacts live only for the duration of
    /// one attempt.
    pub fn remove(&self) -> std::io::Result<()> {
        fs::remove_file(&self.local_path)
    }
}

/// Result of a fetch that was not an error.
#[derive(Debug)]
pub enum FetchOutcome {
    Complete(PackageArtifact),
    /// The caller cancelled mid-stream; scratch state was discarded.
    Cancelled,
}

/// Download the update package to `dest_path` and validate it.
pub async fn fetch(
    client: &reqwest::Client,
    download_url: &str,
    dest_path: &Path,
    expected_sha256: Option<&str>,
    timeout: Duration,
    cancel: &AtomicBool,
    mut progress: impl FnMut(u64, Option<u64>),
) -> Result<FetchOutcome, UpdateError> {
    if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| UpdateError::DownloadIncomplete(format!("scratch dir: {}", e)))?;
    }

    let file_name = dest_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "package".to_string());
    let partial_path = dest_path.with_file_name(format!("{}.partial", file_name));

    info!(url = download_url, "downloading update package");
    let mut response = client
        .get(download_url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| UpdateError::DownloadIncomplete(e.to_string()))?;

    if !response.status().is_success() {
        return Err(UpdateError::DownloadIncomplete(format!(
            "server returned HTTP {}",
            response.status()
        )));
    }

    let total = response.content_length();
    let mut file = tokio::fs::File::create(&partial_path)
        .await
        .map_err(|e| UpdateError::DownloadIncomplete(format!("create partial file: {}", e)))?;

    let mut received: u64 = 0;
    loop {
        if cancel.load(Ordering::Relaxed) {
            drop(file);
            let _ = fs::remove_file(&partial_path);
            info!("download cancelled, scratch discarded");
            return Ok(FetchOutcome::Cancelled);
        }

        match response.chunk().await {
            Ok(Some(bytes)) => {
                if let Err(e) = file.write_all(&bytes).await {
                    drop(file);
                    let _ = fs::remove_file(&partial_path);
                    return Err(UpdateError::DownloadIncomplete(format!(
                        "write failed: {}",
                        e
                    )));
                }
                received += bytes.len() as u64;
                progress(received, total);
            }
            Ok(None) => break,
            Err(e) => {
                drop(file);
                let _ = fs::remove_file(&partial_path);
                return Err(UpdateError::DownloadIncomplete(e.to_string()));
            }
        }
    }

    file.flush()
        .await
        .map_err(|e| UpdateError::DownloadIncomplete(e.to_string()))?;
    drop(file);

    if received == 0 {
        let _ = fs::remove_file(&partial_path);
        return Err(UpdateError::DownloadIncomplete(
            "downloaded file is empty".to_string(),
        ));
    }
    if let Some(expected) = total {
        if received != expected {
            let _ = fs::remove_file(&partial_path);
            return Err(UpdateError::DownloadIncomplete(format!(
                "stream ended at {} of {} declared bytes",
                received, expected
            )));
        }
    }

    if let Some(expected) = expected_sha256 {
        let actual = compute_sha256(&partial_path)
            .map_err(|e| UpdateError::DownloadIncomplete(format!("checksum read: {}", e)))?;
        if !actual.eq_ignore_ascii_case(expected) {
            let _ = fs::remove_file(&partial_path);
            return Err(UpdateError::DownloadIncomplete(format!(
                "sha256 mismatch: expected {}, got {}",
                expected, actual
            )));
        }
        debug!("package checksum verified");
    }

    fs::rename(&partial_path, dest_path)
        .map_err(|e| UpdateError::DownloadIncomplete(format!("finalize artifact: {}", e)))?;

    match PackageArtifact::open(dest_path) {
        Ok(artifact) => {
            info!(
                size_bytes = artifact.size_bytes,
                root = %artifact.package_root,
                "package downloaded and validated"
            );
            Ok(FetchOutcome::Complete(artifact))
        }
        Err(e) => {
            let _ = fs::remove_file(dest_path);
            Err(e)
        }
    }
}

/// SHA-256 of a file as a lowercase hex string.
pub fn compute_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}
