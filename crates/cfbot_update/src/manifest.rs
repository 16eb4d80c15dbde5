//! Remote update manifest.
//!
//! The release server publishes a single JSON document describing the
//! latest release. Parsing is strict: missing fields, malformed version
//! strings and unencrypted URLs are all rejected before any comparison
//! happens.

use crate::error::UpdateError;
use crate::version::ReleaseVersion;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Version metadata served by the release host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Version of the release being offered.
    pub version: ReleaseVersion,
    /// ISO date the release was published.
    pub release_date: NaiveDate,
    /// Where to download the update package archive.
    pub download_url: String,
    /// Changelog text for this release, served verbatim.
    pub changelog_url: String,
    /// When true, the release must be installed before normal operation
    /// continues.
    pub required: bool,
    /// Oldest client version eligible to jump straight to this release.
    pub min_version: ReleaseVersion,
    /// Free-form release notes.
    #[serde(default)]
    pub notes: String,
    /// Optional SHA-256 of the package archive. When present the fetcher
    /// verifies the downloaded bytes against it.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl Manifest {
    /// Parse and validate a manifest document.
    pub fn parse(body: &str) -> Result<Self, UpdateError> {
        let manifest: Manifest = serde_json::from_str(body)
            .map_err(|e| UpdateError::ManifestMalformed(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Schema checks beyond what serde enforces.
    fn validate(&self) -> Result<(), UpdateError> {
        require_https("download_url", &self.download_url)?;
        require_https("changelog_url", &self.changelog_url)?;
        if let Some(sum) = &self.sha256 {
            let ok = sum.len() == 64 && sum.bytes().all(|b| b.is_ascii_hexdigit());
            if !ok {
                return Err(UpdateError::ManifestMalformed(format!(
                    "sha256 is not a 64-character hex digest: {:?}",
                    sum
                )));
            }
        }
        Ok(())
    }
}

/// Reject any URL that is not encrypted transport.
pub(crate) fn require_https(field: &str, url: &str) -> Result<(), UpdateError> {
    if url.starts_with("https://") {
        Ok(())
    } else {
        Err(UpdateError::ManifestMalformed(format!(
            "{} must use https, got {:?}",
            field, url
        )))
    }
}
