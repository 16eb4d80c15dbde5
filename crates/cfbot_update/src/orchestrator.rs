//! Update orchestrator.
//!
//! Drives one update attempt through the state machine:
//!
//! `Idle -> Checking -> {NoUpdate | UpdateAvailable} -> Downloading ->
//! BackingUp -> Applying -> {Succeeded -> Restarting} | Failed ->
//! RollingBack -> RolledBack`
//!
//! Stage errors are translated into the `Failed` transition with the
//! specific error kind attached. Only the two transient network kinds are
//! retried, with a bounded backoff. Rollback runs only on the Applying
//! path; everything earlier leaves the install directory untouched.

use crate::apply::{self, AppliedChangeSet, FileOutcome};
use crate::backup::BackupManager;
use crate::config::UpdateConfig;
use crate::error::UpdateError;
use crate::fetcher::{self, FetchOutcome, PackageArtifact};
use crate::lock::{UpdateLock, UpdateLockError};
use crate::manifest::Manifest;
use crate::phase::{UpdateEvent, UpdatePhase};
use crate::resolver::{self, UpdatePlan};
use crate::state::{self, LastOutcome, UpdateState};
use crate::version::ReleaseVersion;
use anyhow::Context;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Cancels an in-flight attempt. Honored during Checking and Downloading
/// only; once Applying has begun the only paths out are completion or
/// rollback.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// How an attempt ended.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The plan offered nothing newer; nothing was touched.
    NoUpdate,
    /// The caller did not confirm; nothing was downloaded.
    Declined,
    /// Cancelled before any install-dir mutation; scratch discarded.
    Cancelled,
    /// All files applied; the host should terminate and relaunch.
    Updated {
        version: ReleaseVersion,
        changes: AppliedChangeSet,
    },
    /// Apply failed and the pre-apply snapshot was restored.
    RolledBack { error: UpdateError },
    /// A stage failed before touching the install dir, or restore itself
    /// failed.
    Failed { error: UpdateError },
}

/// Owns the state machine for one install directory.
pub struct UpdateOrchestrator {
    config: UpdateConfig,
    current_version: ReleaseVersion,
    http: reqwest::Client,
    phase: Arc<RwLock<UpdatePhase>>,
    events: Option<mpsc::UnboundedSender<UpdateEvent>>,
    cancel: Arc<AtomicBool>,
    /// Test seams, set only by the test constructor.
    mock_manifest: Option<Manifest>,
    mock_package: Option<PathBuf>,
}

impl UpdateOrchestrator {
    /// The current version is passed in explicitly so the check stays a
    /// pure comparison against a value, never module-global state.
    pub fn new(config: UpdateConfig, current_version: ReleaseVersion) -> anyhow::Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .user_agent(format!("cfbot-update/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            current_version,
            http,
            phase: Arc::new(RwLock::new(UpdatePhase::Idle)),
            events: None,
            cancel: Arc::new(AtomicBool::new(false)),
            mock_manifest: None,
            mock_package: None,
        })
    }

    /// Orchestrator that resolves against a fixed manifest and package
    /// file instead of the network.
    #[cfg(test)]
    pub fn with_mocks(
        config: UpdateConfig,
        current_version: ReleaseVersion,
        manifest: Manifest,
        package: Option<PathBuf>,
    ) -> Self {
        let mut orchestrator = Self::new(config, current_version).unwrap();
        orchestrator.mock_manifest = Some(manifest);
        orchestrator.mock_package = package;
        orchestrator
    }

    /// Progress event stream. Replaces any previous receiver.
    pub fn take_events(&mut self) -> mpsc::UnboundedReceiver<UpdateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(Arc::clone(&self.cancel))
    }

    /// Current stage, readable concurrently for display.
    pub fn phase(&self) -> UpdatePhase {
        match self.phase.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn current_version(&self) -> ReleaseVersion {
        self.current_version
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Check the remote manifest and decide eligibility.
    ///
    /// No files are touched. Only `ManifestUnreachable` is retried here.
    pub async fn check(&self) -> Result<UpdatePlan, UpdateError> {
        let _lock = self.acquire_lock("checking")?;
        self.set_phase(UpdatePhase::Checking);

        if self.cancel.load(Ordering::Relaxed) {
            self.set_phase(UpdatePhase::Idle);
            return Err(UpdateError::Cancelled);
        }

        let manifest = if let Some(manifest) = &self.mock_manifest {
            manifest.clone()
        } else {
            match self.fetch_manifest_with_retry().await {
                Ok(manifest) => manifest,
                Err(e) => {
                    self.record_state(|s| {
                        s.record_check(LastOutcome::Failed, Some(e.to_string()))
                    });
                    self.set_phase(UpdatePhase::Failed {
                        reason: e.to_string(),
                    });
                    return Err(e);
                }
            }
        };

        let plan = UpdatePlan::compute(&manifest, self.current_version);
        if plan.available {
            self.record_state(|s| s.last_check = Some(chrono::Utc::now()));
        } else {
            self.record_state(|s| s.record_check(LastOutcome::NoUpdate, None));
        }

        if plan.available {
            self.set_phase(UpdatePhase::UpdateAvailable {
                version: plan.target_version,
            });
        } else {
            self.set_phase(UpdatePhase::NoUpdate);
        }
        Ok(plan)
    }

    /// Fetch the changelog for the offered release, verbatim.
    pub async fn fetch_changelog(&self, plan: &UpdatePlan) -> Result<String, UpdateError> {
        resolver::fetch_changelog(
            &self.http,
            &plan.changelog_url,
            Duration::from_secs(self.config.check_timeout_secs),
        )
        .await
    }

    /// Run the download/backup/apply sequence for an available plan.
    ///
    /// `confirmed` must be true: the orchestrator never installs
    /// silently. Mandatory plans only remove the caller's defer option,
    /// not the confirmation itself.
    pub async fn run(&self, plan: &UpdatePlan, confirmed: bool) -> UpdateOutcome {
        if !plan.available {
            self.set_phase(UpdatePhase::NoUpdate);
            return UpdateOutcome::NoUpdate;
        }
        if !confirmed {
            info!("update not confirmed; nothing downloaded");
            return UpdateOutcome::Declined;
        }

        let mut lock = match self.acquire_lock("downloading") {
            Ok(lock) => lock,
            Err(e) => return self.fail(e),
        };

        // Downloading
        self.set_phase(UpdatePhase::Downloading { percent: 0 });
        let artifact = match self.download_with_retry(plan).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                self.cleanup_scratch();
                self.set_phase(UpdatePhase::Idle);
                info!("update cancelled during download");
                return UpdateOutcome::Cancelled;
            }
            Err(e) => {
                self.cleanup_scratch();
                return self.fail(e);
            }
        };

        // Last safe cancellation point: nothing mutated yet.
        if self.cancel.load(Ordering::Relaxed) {
            self.cleanup_scratch();
            self.set_phase(UpdatePhase::Idle);
            info!("update cancelled before backup");
            return UpdateOutcome::Cancelled;
        }

        // Backing up
        let _ = lock.update_stage("backing_up");
        self.set_phase(UpdatePhase::BackingUp);
        let backup_manager = BackupManager::new(self.config.backup_dir());
        let snapshot = match backup_manager.snapshot(&self.snapshot_sources(&artifact)) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.cleanup_scratch();
                return self.fail(e);
            }
        };

        // Applying. From here cancellation is ignored: the only paths out
        // are completion or rollback.
        let _ = lock.update_stage("applying");
        self.set_phase(UpdatePhase::Applying);
        let staging = self.config.scratch_dir().join("staging");
        let applied = apply::apply(
            &artifact,
            &self.config.install_dir,
            &self.config.protected_set(),
            &staging,
            |path, outcome| match outcome {
                FileOutcome::Written => self.emit(UpdateEvent::FileWritten {
                    path: path.to_path_buf(),
                }),
                FileOutcome::Skipped => self.emit(UpdateEvent::FileSkipped {
                    path: path.to_path_buf(),
                }),
            },
        );

        match applied {
            Ok(changes) => {
                self.cleanup_scratch();

                if let Err(e) =
                    state::write_current_version(&self.config.install_dir, plan.target_version)
                {
                    warn!("failed to rewrite VERSION file: {}", e);
                }
                self.record_state(|s| {
                    s.record_updated(self.current_version, plan.target_version)
                });

                self.set_phase(UpdatePhase::Succeeded {
                    version: plan.target_version,
                });
                info!(version = %plan.target_version, "update applied");

                self.request_restart();
                UpdateOutcome::Updated {
                    version: plan.target_version,
                    changes,
                }
            }
            Err(apply_error) => {
                warn!("apply failed, rolling back: {}", apply_error);
                self.set_phase(UpdatePhase::RollingBack);

                match backup_manager.restore(&snapshot) {
                    Ok(()) => {
                        self.cleanup_scratch();
                        self.record_state(|s| {
                            s.record_check(
                                LastOutcome::RolledBack,
                                Some(apply_error.to_string()),
                            )
                        });
                        self.set_phase(UpdatePhase::RolledBack);
                        info!(snapshot = %snapshot.id, "rolled back to pre-apply state");
                        UpdateOutcome::RolledBack { error: apply_error }
                    }
                    Err(restore_error) => {
                        self.cleanup_scratch();
                        error!(
                            snapshot = %snapshot.id,
                            "RESTORE FAILED after apply failure ({}): {}",
                            apply_error, restore_error
                        );
                        self.fail(restore_error)
                    }
                }
            }
        }
    }

    /// Fetch with retries for the transient manifest kind.
    async fn fetch_manifest_with_retry(&self) -> Result<Manifest, UpdateError> {
        let timeout = Duration::from_secs(self.config.check_timeout_secs);
        let mut attempt: u32 = 1;
        loop {
            match resolver::fetch_manifest(&self.http, &self.config.manifest_url, timeout).await {
                Ok(manifest) => return Ok(manifest),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(attempt, "manifest fetch failed, will retry: {}", e);
                    tokio::time::sleep(Duration::from_secs(
                        self.config.retry_backoff_secs * u64::from(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Download with retries; `Ok(None)` means cancelled.
    async fn download_with_retry(
        &self,
        plan: &UpdatePlan,
    ) -> Result<Option<PackageArtifact>, UpdateError> {
        let dest = self
            .config
            .scratch_dir()
            .join(format!("cfbot-{}.tar.gz", plan.target_version));

        if let Some(source) = &self.mock_package {
            fs::create_dir_all(self.config.scratch_dir())
                .and_then(|_| fs::copy(source, &dest))
                .map_err(|e| UpdateError::DownloadIncomplete(e.to_string()))?;
            return PackageArtifact::open(&dest).map(Some);
        }

        let timeout = Duration::from_secs(self.config.download_timeout_secs);
        let mut attempt: u32 = 1;
        loop {
            let mut last_percent: u8 = 0;
            let outcome = fetcher::fetch(
                &self.http,
                &plan.download_url,
                &dest,
                plan.sha256.as_deref(),
                timeout,
                &self.cancel,
                |received, total| {
                    self.emit(UpdateEvent::DownloadProgress { received, total });
                    if let Some(total) = total {
                        let percent = ((received.min(total) * 100) / total.max(1)) as u8;
                        if percent != last_percent {
                            last_percent = percent;
                            self.set_phase(UpdatePhase::Downloading { percent });
                        }
                    }
                },
            )
            .await;

            match outcome {
                Ok(FetchOutcome::Complete(artifact)) => return Ok(Some(artifact)),
                Ok(FetchOutcome::Cancelled) => return Ok(None),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(attempt, "download failed, will retry: {}", e);
                    tokio::time::sleep(Duration::from_secs(
                        self.config.retry_backoff_secs * u64::from(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Everything the apply stage could touch: protected paths plus the
    /// existing install-dir files the package would overwrite.
    fn snapshot_sources(&self, artifact: &PackageArtifact) -> Vec<PathBuf> {
        let protected = self.config.protected_set();
        let mut sources = Vec::new();

        for path in protected.paths() {
            let abs = self.config.install_dir.join(path);
            if abs.exists() {
                sources.push(abs);
            }
        }
        for rel in artifact.entries() {
            if protected.matches(rel) {
                continue;
            }
            let abs = self.config.install_dir.join(rel);
            if abs.exists() && !sources.contains(&abs) {
                sources.push(abs);
            }
        }
        sources
    }

    fn acquire_lock(&self, stage: &str) -> Result<UpdateLock, UpdateError> {
        UpdateLock::acquire(&self.config.lock_path(), stage).map_err(|e| match e {
            UpdateLockError::AlreadyLocked { holder } => {
                UpdateError::AlreadyRunning(holder.describe())
            }
            other => UpdateError::AlreadyRunning(other.to_string()),
        })
    }

    fn fail(&self, error: UpdateError) -> UpdateOutcome {
        error!("update attempt failed: {}", error);
        self.record_state(|s| s.record_check(LastOutcome::Failed, Some(error.to_string())));
        self.set_phase(UpdatePhase::Failed {
            reason: error.to_string(),
        });
        UpdateOutcome::Failed { error }
    }

    fn cleanup_scratch(&self) {
        let scratch = self.config.scratch_dir();
        if scratch.exists() {
            let _ = fs::remove_dir_all(&scratch);
        }
    }

    /// Signal the host process to terminate and relaunch from the updated
    /// install directory. Process supervision stays with the host.
    fn request_restart(&self) {
        let marker = self.config.restart_marker_path();
        if let Err(e) = fs::write(&marker, chrono::Utc::now().to_rfc3339()) {
            warn!("failed to write restart marker: {}", e);
        }
        self.set_phase(UpdatePhase::Restarting);
        info!("restart requested; host should relaunch from the updated install dir");
    }

    fn record_state(&self, update: impl FnOnce(&mut UpdateState)) {
        let path = self.config.state_path();
        let mut state = UpdateState::load(&path);
        update(&mut state);
        state.save_best_effort(&path);
    }

    fn set_phase(&self, phase: UpdatePhase) {
        {
            let mut guard = match self.phase.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *guard = phase.clone();
        }
        self.emit(UpdateEvent::Phase(phase));
    }

    fn emit(&self, event: UpdateEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}
