#![cfg(unix)]

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use depot_launcher_lib::{
    ChannelSink, CleanupOutcome, DepotInfo, DownloadEvent, DownloadManager, DownloadState,
    GameData, LauncherError, Settings,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    _tmp: TempDir,
    library: PathBuf,
    manager: DownloadManager,
    events: UnboundedReceiver<DownloadEvent>,
}

fn harness(script: &str, trust_library: bool) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let library = tmp.path().join("library");
    std::fs::create_dir_all(&library).unwrap();

    let downloader = tmp.path().join("DepotDownloaderMod");
    std::fs::write(&downloader, format!("#!/bin/sh\n{script}\n")).unwrap();
    std::fs::set_permissions(&downloader, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut settings = Settings::with_data_dir(tmp.path().join("data"));
    settings.downloader_path = downloader;
    settings.validate = false;
    settings.poll_interval_ms = 20;
    settings.monitor_interval_ms = 200;
    settings.termination_confirm_ms = 200;
    settings.graceful_timeout_secs = 2;
    settings.kill_timeout_secs = 1;
    if trust_library {
        settings.library_roots = vec![library.clone()];
    }

    let (sink, events) = ChannelSink::new();
    let manager = DownloadManager::new(settings, Arc::new(sink)).unwrap();
    Harness {
        _tmp: tmp,
        library,
        manager,
        events,
    }
}

fn portal(depots: &[&str]) -> GameData {
    GameData {
        app_id: "620".to_string(),
        name: "Portal 2".to_string(),
        install_dir: Some("Portal 2".to_string()),
        depots: depots
            .iter()
            .map(|d| {
                (
                    d.to_string(),
                    DepotInfo {
                        key: "00ff".repeat(8),
                        description: format!("depot {d}"),
                    },
                )
            })
            .collect(),
        manifests: depots
            .iter()
            .map(|d| (d.to_string(), format!("{d}123456789")))
            .collect(),
        depot_sizes: BTreeMap::new(),
        ..Default::default()
    }
}

fn depots(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|d| d.to_string()).collect()
}

fn install_dir(library: &Path) -> PathBuf {
    library.join("steamapps").join("common").join("Portal 2")
}

async fn events_until(
    rx: &mut UnboundedReceiver<DownloadEvent>,
    mut done: impl FnMut(&DownloadEvent) -> bool,
) -> Vec<DownloadEvent> {
    let mut seen = vec![];
    tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(event) = rx.recv().await {
            let hit = done(&event);
            seen.push(event);
            if hit {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for download events");
    seen
}

async fn wait_for_pid(manager: &DownloadManager) -> u32 {
    for _ in 0..200 {
        if let Some(pid) = manager.process_id() {
            return pid;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("downloader never started");
}

fn states(events: &[DownloadEvent]) -> Vec<DownloadState> {
    events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::StateChanged { state } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completes_all_selected_depots() {
    let mut h = harness(
        r#"echo " 25.00% data/a.pak"
echo " 75.00% data/b.pak"
echo "Depot $4 - Downloaded 1,024 bytes (2,048 bytes uncompressed)"
echo "100.00% data/c.pak""#,
        false,
    );
    let id = h
        .manager
        .start_download(portal(&["1", "2"]), depots(&["1", "2"]), &h.library)
        .unwrap();

    let events = events_until(&mut h.events, |e| {
        matches!(e, DownloadEvent::Finished { .. } | DownloadEvent::Error { .. })
    })
    .await;

    assert!(
        matches!(events.last(), Some(DownloadEvent::Finished { session_id, .. }) if *session_id == id),
        "{events:?}"
    );
    assert_eq!(h.manager.state(), DownloadState::Completed);
    let session = h.manager.current_session().unwrap();
    assert_eq!(session.completed_depots, depots(&["1", "2"]));
    assert_eq!(session.downloaded_size, 2048);
    assert!(session.is_completed());

    let stored = h.manager.store().load(&id).unwrap().unwrap();
    assert_eq!(stored.download_state, DownloadState::Completed);
    assert_eq!(h.manager.process_id(), None);

    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            DownloadEvent::PercentChanged { percent, depot_id } if depot_id == "1" => {
                Some(*percent)
            }
            _ => None,
        })
        .collect();
    assert_eq!(percents, vec![25, 75, 100]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_and_resume_keep_the_same_process() {
    let mut h = harness("echo started\nexec sleep 30", false);
    h.manager
        .start_download(portal(&["1"]), depots(&["1"]), &h.library)
        .unwrap();
    let pid = wait_for_pid(&h.manager).await;

    assert!(h.manager.pause().unwrap());
    assert_eq!(h.manager.state(), DownloadState::Paused);
    assert_eq!(h.manager.process_id(), Some(pid));
    assert!(!h.manager.pause().unwrap());

    assert!(h.manager.resume().unwrap());
    assert_eq!(h.manager.state(), DownloadState::Downloading);
    assert_eq!(h.manager.process_id(), Some(pid));

    h.manager.cancel().await.unwrap();
    let events = events_until(&mut h.events, |e| matches!(e, DownloadEvent::Cancelled)).await;
    assert_eq!(
        states(&events),
        vec![
            DownloadState::Downloading,
            DownloadState::Paused,
            DownloadState::Downloading,
            DownloadState::Cancelling,
            DownloadState::Cancelled,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_outside_known_library_falls_back_to_sweep() {
    let h = harness("echo started\nexec sleep 30", false);
    let id = h
        .manager
        .start_download(portal(&["1"]), depots(&["1"]), &h.library)
        .unwrap();
    wait_for_pid(&h.manager).await;

    let install = install_dir(&h.library);
    std::fs::write(install.join("game.exe"), b"binary").unwrap();
    std::fs::write(install.join("data.pak.partial"), b"partial").unwrap();

    let outcome = h.manager.cancel().await.unwrap();
    assert_eq!(outcome.session_id, id);
    match &outcome.cleanup {
        CleanupOutcome::Fallback { reason, sweep } => {
            assert!(reason.contains("location"), "{reason}");
            assert_eq!(sweep.files_removed, 1);
        }
        other => panic!("expected fallback, got {other:?}"),
    }

    assert_eq!(h.manager.state(), DownloadState::Cancelled);
    assert!(install.join("game.exe").exists());
    assert!(!install.join("data.pak.partial").exists());

    let stored = h.manager.store().load(&id).unwrap().unwrap();
    assert_eq!(stored.download_state, DownloadState::Cancelled);
    assert!(h.manager.cancel().await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_inside_trusted_library_empties_install_dir() {
    let h = harness("echo started\nexec sleep 30", true);
    let id = h
        .manager
        .start_download(portal(&["1"]), depots(&["1"]), &h.library)
        .unwrap();
    wait_for_pid(&h.manager).await;

    let install = install_dir(&h.library);
    std::fs::create_dir_all(install.join("bin")).unwrap();
    std::fs::write(install.join("bin").join("portal2"), b"0123456789").unwrap();
    std::fs::write(install.join("portal2.pak"), b"abc").unwrap();

    let outcome = h.manager.cancel().await.unwrap();
    let report = match outcome.cleanup {
        CleanupOutcome::Aggressive(report) => report,
        other => panic!("expected aggressive cleanup, got {other:?}"),
    };
    assert_eq!(report.files_removed, 1);
    assert_eq!(report.dirs_removed, 1);
    assert_eq!(report.bytes_freed, 13);

    let left: Vec<String> = std::fs::read_dir(&install)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(left, vec![format!(".depot_cleanup_log_{id}.json")]);

    assert_eq!(h.manager.state(), DownloadState::Cancelled);
    assert!(h.manager.store().load(&id).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_depot_surfaces_error_with_depot_id() {
    let mut h = harness("echo 'Error: manifest not available' >&2\nexit 5", false);
    h.manager
        .start_download(portal(&["1", "2"]), depots(&["1", "2"]), &h.library)
        .unwrap();

    let events = events_until(&mut h.events, |e| {
        matches!(e, DownloadEvent::Error { .. } | DownloadEvent::Finished { .. })
    })
    .await;

    match events.last() {
        Some(DownloadEvent::Error { message }) => assert!(message.contains("Depot 1"), "{message}"),
        other => panic!("expected an error, got {other:?}"),
    }
    assert_eq!(h.manager.state(), DownloadState::Error);
    let session = h.manager.current_session().unwrap();
    assert!(session.completed_depots.is_empty());
    assert!(session.error_message.contains("Depot 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_downloader_is_reported() {
    let mut h = harness("exec sleep 30", false);
    h.manager
        .start_download(portal(&["1"]), depots(&["1"]), &h.library)
        .unwrap();
    let pid = wait_for_pid(&h.manager).await;
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    let events = events_until(&mut h.events, |e| matches!(e, DownloadEvent::Cancelled)).await;
    let error = events.iter().find_map(|e| match e {
        DownloadEvent::Error { message } => Some(message.clone()),
        _ => None,
    });
    assert!(
        error.as_deref().is_some_and(|m| m.contains("terminated unexpectedly")),
        "{error:?}"
    );
    assert_eq!(h.manager.state(), DownloadState::Cancelled);
    assert_eq!(h.manager.process_id(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn depot_without_manifest_never_completes() {
    let mut h = harness("exit 0", false);
    let mut game = portal(&["1", "2"]);
    game.manifests.remove("2");
    h.manager
        .start_download(game, depots(&["1", "2"]), &h.library)
        .unwrap();

    let events = events_until(&mut h.events, |e| {
        matches!(e, DownloadEvent::Error { .. } | DownloadEvent::Finished { .. })
    })
    .await;
    match events.last() {
        Some(DownloadEvent::Error { message }) => assert!(message.contains('2'), "{message}"),
        other => panic!("expected an error, got {other:?}"),
    }
    assert_eq!(h.manager.state(), DownloadState::Error);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_requests_create_no_session() {
    let h = harness("exit 0", false);

    let err = h
        .manager
        .start_download(portal(&["1"]), vec![], &h.library)
        .unwrap_err();
    assert!(matches!(err, LauncherError::Validation(_)));

    let err = h
        .manager
        .start_download(portal(&["1"]), depots(&["1"]), &h.library.join("missing"))
        .unwrap_err();
    assert!(matches!(err, LauncherError::Validation(_)));

    let err = h
        .manager
        .start_download(GameData::default(), depots(&["1"]), &h.library)
        .unwrap_err();
    assert!(matches!(err, LauncherError::Validation(_)));

    assert!(h.manager.store().load_all().unwrap().is_empty());
    assert_eq!(h.manager.state(), DownloadState::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_while_running_is_rejected() {
    let h = harness("exec sleep 30", false);
    h.manager
        .start_download(portal(&["1"]), depots(&["1"]), &h.library)
        .unwrap();
    let err = h
        .manager
        .start_download(portal(&["1"]), depots(&["1"]), &h.library)
        .unwrap_err();
    assert!(matches!(err, LauncherError::Validation(_)));

    h.manager.cancel().await.unwrap();
    assert_eq!(h.manager.state(), DownloadState::Cancelled);
}
