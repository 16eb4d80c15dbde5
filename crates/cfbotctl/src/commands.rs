//! Command implementations for cfbotctl.

use anyhow::{Context, Result};
use cfbot_update::orchestrator::{UpdateOrchestrator, UpdateOutcome};
use cfbot_update::phase::{UpdateEvent, UpdatePhase};
use cfbot_update::state::{self, UpdateState};
use cfbot_update::{BackupManager, UpdateConfig};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::Path;

fn load_config(explicit: Option<&Path>) -> Result<UpdateConfig> {
    let path = UpdateConfig::locate(explicit);
    UpdateConfig::load(&path)
        .with_context(|| format!("Cannot load updater config from {}", path.display()))
}

/// `cfbotctl check`
pub async fn check(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let current = state::current_version(&config.install_dir);

    println!("📌 Current Version: v{}", current);
    println!("🌐 Checking for updates...");

    let orchestrator = UpdateOrchestrator::new(config, current)?;
    let plan = orchestrator.check().await?;

    if !plan.available {
        println!("✅ You are already running the latest version.");
        return Ok(());
    }

    println!("🆕 Update available: v{} → v{}", current, plan.target_version);
    if plan.mandatory {
        println!("⚠️  This update is mandatory.");
    }
    println!();
    println!("Run 'cfbotctl upgrade' to install it.");
    Ok(())
}

/// `cfbotctl upgrade`
pub async fn upgrade(config_path: Option<&Path>, auto_yes: bool) -> Result<()> {
    println!("🔄 cfbot Update System");
    println!();

    let config = load_config(config_path)?;
    let current = state::current_version(&config.install_dir);
    println!("📌 Current Version: v{}", current);

    let mut orchestrator = UpdateOrchestrator::new(config, current)?;

    println!("🌐 Checking for updates...");
    let plan = orchestrator.check().await?;

    if !plan.available {
        println!("✅ You are already running the latest version.");
        return Ok(());
    }

    println!("🆕 Update available: v{} → v{}", current, plan.target_version);
    println!();

    match orchestrator.fetch_changelog(&plan).await {
        Ok(changelog) => {
            println!("--- Changelog ---");
            println!("{}", changelog.trim_end());
            println!("-----------------");
            println!();
        }
        Err(e) => println!("(changelog unavailable: {})", e),
    }

    if plan.mandatory {
        println!("⚠️  This update is mandatory and cannot be deferred.");
    }

    if !auto_yes && !confirm("Install this update?")? {
        if plan.mandatory {
            eprintln!("❌ A mandatory update was declined. cfbot will not trade until it is installed.");
            std::process::exit(1);
        }
        println!("Upgrade cancelled.");
        return Ok(());
    }

    let events = orchestrator.take_events();
    let reporter = tokio::spawn(report_progress(events));

    let outcome = orchestrator.run(&plan, true).await;
    drop(orchestrator);
    let _ = reporter.await;

    match outcome {
        UpdateOutcome::Updated { version, changes } => {
            println!();
            println!(
                "🎉 Successfully updated to v{} ({} files written, {} protected files skipped)",
                version,
                changes.written.len(),
                changes.skipped.len()
            );
            println!("🔁 Restart cfbot to start the new version.");
            Ok(())
        }
        UpdateOutcome::RolledBack { error } => {
            eprintln!();
            eprintln!("⏪ Update failed and was rolled back: {}", error);
            eprintln!("   The install directory matches its pre-update state.");
            std::process::exit(1);
        }
        UpdateOutcome::Failed { error } => {
            eprintln!();
            eprintln!("❌ Update failed: {}", error);
            std::process::exit(1);
        }
        UpdateOutcome::Cancelled => {
            println!("Upgrade cancelled.");
            Ok(())
        }
        UpdateOutcome::Declined | UpdateOutcome::NoUpdate => Ok(()),
    }
}

/// Render orchestrator events as a download bar and stage lines.
async fn report_progress(mut events: tokio::sync::mpsc::UnboundedReceiver<UpdateEvent>) {
    let mut bar: Option<ProgressBar> = None;

    while let Some(event) = events.recv().await {
        match event {
            UpdateEvent::DownloadProgress { received, total } => {
                let bar = bar.get_or_insert_with(|| {
                    let pb = match total {
                        Some(total) => ProgressBar::new(total),
                        None => ProgressBar::new_spinner(),
                    };
                    if let Ok(style) = ProgressStyle::default_bar()
                        .template("📥 {bar:40} {bytes}/{total_bytes}")
                    {
                        pb.set_style(style);
                    }
                    pb
                });
                bar.set_position(received);
            }
            UpdateEvent::Phase(phase) => match phase {
                UpdatePhase::BackingUp => {
                    if let Some(bar) = bar.take() {
                        bar.finish_and_clear();
                    }
                    println!("📥 Download complete");
                    println!("💾 Backing up protected files...");
                }
                UpdatePhase::Applying => println!("📦 Applying update..."),
                UpdatePhase::RollingBack => println!("⏪ Rolling back..."),
                _ => {}
            },
            UpdateEvent::FileSkipped { path } => {
                println!("   🔒 protected, skipped: {}", path.display());
            }
            UpdateEvent::FileWritten { .. } => {}
        }
    }

    if let Some(bar) = bar.take() {
        bar.finish_and_clear();
    }
}

/// `cfbotctl rollback`
pub fn rollback(config_path: Option<&Path>, auto_yes: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let manager = BackupManager::new(config.backup_dir());

    let Some(snapshot) = manager.latest() else {
        anyhow::bail!("No backup snapshots found in {}", config.backup_dir().display());
    };

    println!(
        "🔄 Restoring snapshot {} ({} entries, created {})",
        snapshot.id,
        snapshot.entries().len(),
        snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    if !auto_yes && !confirm("Overwrite the current tree with this snapshot?")? {
        println!("Rollback cancelled.");
        return Ok(());
    }

    manager.restore(&snapshot)?;
    println!("✅ Snapshot restored.");
    Ok(())
}

/// `cfbotctl snapshots`
pub fn snapshots(config_path: Option<&Path>, prune: Option<usize>) -> Result<()> {
    let config = load_config(config_path)?;
    let manager = BackupManager::new(config.backup_dir());

    if let Some(keep) = prune {
        let removed = manager.prune(keep)?;
        println!("🧹 Pruned {} snapshot(s), kept the newest {}.", removed, keep);
    }

    let snapshots = manager.list();
    if snapshots.is_empty() {
        println!("No backup snapshots.");
        return Ok(());
    }

    println!("{} snapshot(s), newest first:", snapshots.len());
    for snapshot in snapshots {
        println!(
            "  {}  {}  {} entries",
            snapshot.id,
            snapshot.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            snapshot.entries().len()
        );
    }
    Ok(())
}

/// `cfbotctl status`
pub fn status(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let current = state::current_version(&config.install_dir);
    let state = UpdateState::load(&config.state_path());

    println!("📌 Installed Version: v{}", current);
    match state.last_check {
        Some(when) => println!("🕑 Last Check: {}", when.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("🕑 Last Check: never"),
    }
    if let Some(outcome) = state.last_outcome {
        println!("📋 Last Outcome: {:?}", outcome);
    }
    if let Some(error) = state.last_error {
        println!("❌ Last Error: {}", error);
    }
    if let (Some(before), Some(after)) = (state.version_before, state.version_after) {
        println!("⬆️  Last Update: v{} → v{}", before, after);
    }
    if config.restart_marker_path().exists() {
        println!("🔁 Restart pending: relaunch cfbot to finish the last update.");
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}
