//! Version resolution: manifest fetch and update eligibility.
//!
//! The network fetch and the eligibility decision are kept separate so the
//! decision stays a pure function of (manifest, current version). The
//! resolver never retries; retry policy belongs to the orchestrator.

use crate::error::UpdateError;
use crate::manifest::{require_https, Manifest};
use crate::version::ReleaseVersion;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// What a check decided. Immutable once computed; recomputed on every
/// check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePlan {
    /// A strictly newer release is offered.
    pub available: bool,
    /// The caller must not present a defer option.
    pub mandatory: bool,
    pub target_version: ReleaseVersion,
    pub download_url: String,
    pub changelog_url: String,
    /// Carried from the manifest for the fetcher's integrity check.
    pub sha256: Option<String>,
}

impl UpdatePlan {
    /// Pure eligibility decision.
    ///
    /// An update is available only when the manifest version is strictly
    /// greater than the running version. It is mandatory when the release
    /// is flagged required or when the running version is older than the
    /// release's `min_version`.
    pub fn compute(manifest: &Manifest, current: ReleaseVersion) -> Self {
        let available = manifest.version > current;
        let mandatory = available && (manifest.required || current < manifest.min_version);
        Self {
            available,
            mandatory,
            target_version: manifest.version,
            download_url: manifest.download_url.clone(),
            changelog_url: manifest.changelog_url.clone(),
            sha256: manifest.sha256.clone(),
        }
    }
}

/// Fetch and validate the remote manifest. One attempt, no retries.
pub async fn fetch_manifest(
    client: &reqwest::Client,
    manifest_url: &str,
    timeout: Duration,
) -> Result<Manifest, UpdateError> {
    require_https("manifest_url", manifest_url)?;

    debug!(url = manifest_url, "fetching manifest");
    let response = client
        .get(manifest_url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| UpdateError::ManifestUnreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(UpdateError::ManifestUnreachable(format!(
            "server returned HTTP {}",
            response.status()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| UpdateError::ManifestUnreachable(e.to_string()))?;

    Manifest::parse(&body)
}

/// Check the remote manifest against the running version.
pub async fn check_for_update(
    client: &reqwest::Client,
    manifest_url: &str,
    current: ReleaseVersion,
    timeout: Duration,
) -> Result<UpdatePlan, UpdateError> {
    let manifest = fetch_manifest(client, manifest_url, timeout).await?;
    let plan = UpdatePlan::compute(&manifest, current);
    if plan.available {
        info!(
            current = %current,
            target = %plan.target_version,
            mandatory = plan.mandatory,
            "update available"
        );
    } else {
        info!(current = %current, "already on latest version");
    }
    Ok(plan)
}

/// Fetch the changelog text for display, verbatim.
pub async fn fetch_changelog(
    client: &reqwest::Client,
    changelog_url: &str,
    timeout: Duration,
) -> Result<String, UpdateError> {
    require_https("changelog_url", changelog_url)?;

    let response = client
        .get(changelog_url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| UpdateError::ManifestUnreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(UpdateError::ManifestUnreachable(format!(
            "server returned HTTP {}",
            response.status()
        )));
    }

    response
        .text()
        .await
        .map_err(|e| UpdateError::ManifestUnreachable(e.to_string()))
}
