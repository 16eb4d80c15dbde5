//! End-to-end update flow tests.
//!
//! Download behavior is exercised against a local single-connection HTTP
//! server so the truncation and error paths are real stream conditions,
//! not mocks. Archive fixtures are built in-test.

use cfbot_update::fetcher::{self, FetchOutcome};
use cfbot_update::orchestrator::{UpdateOrchestrator, UpdateOutcome};
use cfbot_update::resolver::UpdatePlan;
use cfbot_update::{UpdateConfig, UpdateError};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve one canned response per accepted connection, then stop.
async fn spawn_server(responses: Vec<Vec<u8>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(&response).await;
            let _ = socket.shutdown().await;
        }
    });
    addr
}

/// Raw HTTP response bytes. `declared_len` overrides the Content-Length
/// header to simulate a stream that ends before the declared size.
fn http_response(status: &str, body: &[u8], declared_len: Option<usize>) -> Vec<u8> {
    let len = declared_len.unwrap_or(body.len());
    let mut out = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        status, len
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

fn build_package_bytes(root: &str, files: &[(&str, &str)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
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
    builder.into_inner().unwrap().finish().unwrap()
}

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn no_cancel() -> AtomicBool {
    AtomicBool::new(false)
}

#[tokio::test]
async fn test_fetch_streams_and_validates_package() {
    let body = build_package_bytes("cfbot-1.2.0", &[("app.py", "main"), ("lib/engine.py", "x")]);
    let addr = spawn_server(vec![http_response("200 OK", &body, None)]).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("scratch/pkg.tar.gz");
    let cancel = no_cancel();
    let mut seen_progress = Vec::new();

    let outcome = fetcher::fetch(
        &reqwest::Client::new(),
        &format!("http://{}/pkg.tar.gz", addr),
        &dest,
        None,
        Duration::from_secs(5),
        &cancel,
        |received, total| seen_progress.push((received, total)),
    )
    .await
    .unwrap();

    let artifact = match outcome {
        FetchOutcome::Complete(artifact) => artifact,
        FetchOutcome::Cancelled => panic!("unexpected cancellation"),
    };
    assert_eq!(artifact.package_root, "cfbot-1.2.0");
    assert_eq!(artifact.size_bytes, body.len() as u64);
    assert_eq!(artifact.entries().len(), 2);
    assert!(dest.exists());

    // Progress reported against the declared content length
    let (last_received, last_total) = *seen_progress.last().unwrap();
    assert_eq!(last_received, body.len() as u64);
    assert_eq!(last_total, Some(body.len() as u64));
}

#[tokio::test]
async fn test_truncated_download_leaves_no_artifact() {
    let body = build_package_bytes("cfbot-1.2.0", &[("app.py", "main")]);
    let half = &body[..body.len() / 2];
    // Declare the full length but send only half, then close
    let addr = spawn_server(vec![http_response("200 OK", half, Some(body.len()))]).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("scratch/pkg.tar.gz");
    let cancel = no_cancel();

    let err = fetcher::fetch(
        &reqwest::Client::new(),
        &format!("http://{}/pkg.tar.gz", addr),
        &dest,
        None,
        Duration::from_secs(5),
        &cancel,
        |_, _| {},
    )
    .await
    .unwrap_err();

    assert!(matches!(err, UpdateError::DownloadIncomplete(_)));
    // Neither the final artifact nor the partial file survives
    assert!(!dest.exists());
    let leftovers: Vec<_> = fs::read_dir(temp.path().join("scratch"))
        .map(|entries| entries.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "scratch not clean: {:?}", leftovers);
}

#[tokio::test]
async fn test_http_error_status_is_download_incomplete() {
    let addr = spawn_server(vec![http_response("404 Not Found", b"missing", None)]).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("pkg.tar.gz");
    let cancel = no_cancel();

    let err = fetcher::fetch(
        &reqwest::Client::new(),
        &format!("http://{}/pkg.tar.gz", addr),
        &dest,
        None,
        Duration::from_secs(5),
        &cancel,
        |_, _| {},
    )
    .await
    .unwrap_err();

    assert!(matches!(err, UpdateError::DownloadIncomplete(_)));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_checksum_mismatch_rejected() {
    let body = build_package_bytes("cfbot-1.2.0", &[("app.py", "main")]);
    let addr = spawn_server(vec![http_response("200 OK", &body, None)]).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("pkg.tar.gz");
    let cancel = no_cancel();
    let wrong_sum = "0".repeat(64);

    let err = fetcher::fetch(
        &reqwest::Client::new(),
        &format!("http://{}/pkg.tar.gz", addr),
        &dest,
        Some(wrong_sum.as_str()),
        Duration::from_secs(5),
        &cancel,
        |_, _| {},
    )
    .await
    .unwrap_err();

    assert!(matches!(err, UpdateError::DownloadIncomplete(_)));
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_checksum_match_accepted() {
    let body = build_package_bytes("cfbot-1.2.0", &[("app.py", "main")]);
    let expected = {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&body);
        format!("{:x}", hasher.finalize())
    };
    let addr = spawn_server(vec![http_response("200 OK", &body, None)]).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("pkg.tar.gz");
    let cancel = no_cancel();

    let outcome = fetcher::fetch(
        &reqwest::Client::new(),
        &format!("http://{}/pkg.tar.gz", addr),
        &dest,
        Some(expected.as_str()),
        Duration::from_secs(5),
        &cancel,
        |_, _| {},
    )
    .await
    .unwrap();

    assert!(matches!(outcome, FetchOutcome::Complete(_)));
}

fn test_config(temp: &TempDir) -> UpdateConfig {
    let mut config = UpdateConfig::for_install(
        "https://releases.example.com/manifest.json",
        temp.path().join("install"),
    );
    // Keep updater state out of the application tree for these tests
    config.data_dir = Some(temp.path().join("updater"));
    config
}

fn plan_for(addr: SocketAddr, version: &str) -> UpdatePlan {
    UpdatePlan {
        available: true,
        mandatory: false,
        target_version: version.parse().unwrap(),
        download_url: format!("http://{}/pkg.tar.gz", addr),
        changelog_url: format!("http://{}/CHANGELOG.txt", addr),
        sha256: None,
    }
}

#[tokio::test]
async fn test_orchestrator_full_run_over_http() {
    let body = build_package_bytes(
        "cfbot-1.2.0",
        &[
            ("app.py", "new main"),
            ("strategies/builtin/momentum.yaml", "momentum"),
            ("config/defaults.toml", "defaults"),
        ],
    );
    let addr = spawn_server(vec![http_response("200 OK", &body, None)]).await;

    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let install = config.install_dir.clone();
    write(&install.join("app.py"), "old main");
    write(&install.join("config/keys.json"), "real credentials");
    write(&install.join("config/defaults.toml"), "user-tuned defaults");
    write(&install.join("strategies/mine.yaml"), "my strategy");

    let orchestrator =
        UpdateOrchestrator::new(config.clone(), "1.1.0".parse().unwrap()).unwrap();
    let outcome = orchestrator.run(&plan_for(addr, "1.2.0"), true).await;

    let changes = match outcome {
        UpdateOutcome::Updated { changes, .. } => changes,
        other => panic!("expected Updated, got {:?}", other),
    };

    // Unprotected file overwritten
    assert_eq!(
        fs::read_to_string(install.join("app.py")).unwrap(),
        "new main"
    );
    // Everything under protected roots is untouched, including files the
    // package tried to ship
    assert_eq!(
        fs::read_to_string(install.join("config/keys.json")).unwrap(),
        "real credentials"
    );
    assert_eq!(
        fs::read_to_string(install.join("config/defaults.toml")).unwrap(),
        "user-tuned defaults"
    );
    assert_eq!(
        fs::read_to_string(install.join("strategies/mine.yaml")).unwrap(),
        "my strategy"
    );
    assert!(!install.join("strategies/builtin/momentum.yaml").exists());

    assert_eq!(changes.written, vec![std::path::PathBuf::from("app.py")]);
    assert_eq!(changes.skipped.len(), 2);

    // Scratch cleaned; nothing stray under the install tree
    assert!(!config.scratch_dir().exists());
    assert!(!install.join(".cfbot-update").exists());
}

#[tokio::test]
async fn test_orchestrator_download_failure_leaves_install_untouched() {
    let body = build_package_bytes("cfbot-1.2.0", &[("app.py", "new main")]);
    let half = &body[..body.len() / 2];
    let addr = spawn_server(vec![http_response("200 OK", half, Some(body.len()))]).await;

    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.max_attempts = 1;
    let install = config.install_dir.clone();
    write(&install.join("app.py"), "old main");

    let orchestrator =
        UpdateOrchestrator::new(config.clone(), "1.1.0".parse().unwrap()).unwrap();
    let outcome = orchestrator.run(&plan_for(addr, "1.2.0"), true).await;

    match outcome {
        UpdateOutcome::Failed { error } => {
            assert!(matches!(error, UpdateError::DownloadIncomplete(_)));
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    assert_eq!(
        fs::read_to_string(install.join("app.py")).unwrap(),
        "old main"
    );
    assert!(!config.scratch_dir().exists());
    // No snapshot was taken for an attempt that never reached backup
    assert!(cfbot_update::BackupManager::new(config.backup_dir())
        .list()
        .is_empty());
}

#[tokio::test]
async fn test_orchestrator_retries_transient_download_failure() {
    let body = build_package_bytes("cfbot-1.2.0", &[("app.py", "new main")]);
    let half = &body[..body.len() / 2];
    // First connection truncates, second serves the full package
    let addr = spawn_server(vec![
        http_response("200 OK", half, Some(body.len())),
        http_response("200 OK", &body, None),
    ])
    .await;

    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.retry_backoff_secs = 0;
    let install = config.install_dir.clone();
    write(&install.join("app.py"), "old main");

    let orchestrator =
        UpdateOrchestrator::new(config.clone(), "1.1.0".parse().unwrap()).unwrap();
    let outcome = orchestrator.run(&plan_for(addr, "1.2.0"), true).await;

    assert!(matches!(outcome, UpdateOutcome::Updated { .. }));
    assert_eq!(
        fs::read_to_string(install.join("app.py")).unwrap(),
        "new main"
    );
}

#[tokio::test]
async fn test_invalid_structure_fails_before_any_extraction() {
    // Two top-level directories
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for name in ["rootA/app.py", "rootB/other.py"] {
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, &b"body"[..]).unwrap();
    }
    let body = builder.into_inner().unwrap().finish().unwrap();
    let addr = spawn_server(vec![http_response("200 OK", &body, None)]).await;

    let temp = TempDir::new().unwrap();
    let mut config = test_config(&temp);
    config.max_attempts = 1;
    let install = config.install_dir.clone();
    write(&install.join("app.py"), "old main");

    let orchestrator =
        UpdateOrchestrator::new(config.clone(), "1.1.0".parse().unwrap()).unwrap();
    let outcome = orchestrator.run(&plan_for(addr, "1.2.0"), true).await;

    match outcome {
        UpdateOutcome::Failed { error } => {
            assert!(matches!(error, UpdateError::PackageStructureInvalid(_)));
        }
        other => panic!("expected Failed, got {:?}", other),
    }

    // Nothing extracted anywhere near the install tree
    assert_eq!(
        fs::read_to_string(install.join("app.py")).unwrap(),
        "old main"
    );
    assert!(!install.join("rootA").exists());
    assert!(!install.join("rootB").exists());
    assert!(!config.scratch_dir().exists());
}

#[tokio::test]
async fn test_double_apply_is_idempotent() {
    let body = build_package_bytes(
        "cfbot-1.2.0",
        &[("app.py", "new main"), ("lib/engine.py", "engine")],
    );
    let addr = spawn_server(vec![
        http_response("200 OK", &body, None),
        http_response("200 OK", &body, None),
    ])
    .await;

    let temp = TempDir::new().unwrap();
    let config = test_config(&temp);
    let install = config.install_dir.clone();
    write(&install.join("app.py"), "old main");

    let orchestrator =
        UpdateOrchestrator::new(config.clone(), "1.1.0".parse().unwrap()).unwrap();
    let first = orchestrator.run(&plan_for(addr, "1.2.0"), true).await;
    let first_written = match first {
        UpdateOutcome::Updated { changes, .. } => changes.written,
        other => panic!("expected Updated, got {:?}", other),
    };

    // Second run against the already-updated tree
    let second = orchestrator.run(&plan_for(addr, "1.2.0"), true).await;
    let second_written = match second {
        UpdateOutcome::Updated { changes, .. } => changes.written,
        other => panic!("expected Updated, got {:?}", other),
    };

    assert_eq!(first_written, second_written);
    assert_eq!(
        fs::read_to_string(install.join("app.py")).unwrap(),
        "new main"
    );
    assert_eq!(
        fs::read_to_string(install.join("lib/engine.py")).unwrap(),
        "engine"
    );
}

#[tokio::test]
async fn test_empty_body_is_download_incomplete() {
    let addr = spawn_server(vec![http_response("200 OK", b"", None)]).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("pkg.tar.gz");
    let cancel = no_cancel();

    let err = fetcher::fetch(
        &reqwest::Client::new(),
        &format!("http://{}/pkg.tar.gz", addr),
        &dest,
        None,
        Duration::from_secs(5),
        &cancel,
        |_, _| {},
    )
    .await
    .unwrap_err();

    assert!(matches!(err, UpdateError::DownloadIncomplete(_)));
    assert!(!dest.exists());
}

#[test]
fn test_artifact_open_requires_real_archive() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("junk.tar.gz");
    File::create(&path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, b"junk"))
        .unwrap();
    assert!(matches!(
        cfbot_update::PackageArtifact::open(&path),
        Err(UpdateError::PackageStructureInvalid(_))
    ));
}
