use std::fs;
use std::path::PathBuf;

use depot_launcher_lib::cleanup::{log_file_name, RemovalKind};
use depot_launcher_lib::{CleanupEngine, GameData, LauncherError, SafetyGate, SafetyPolicy};
use tempfile::TempDir;

const SESSION: &str = "0f6c1d2e-session";

struct Fixture {
    _tmp: TempDir,
    game_dir: PathBuf,
    engine: CleanupEngine,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let library = tmp.path().join("SteamLibrary");
    let game_dir = library.join("steamapps").join("common").join("Portal 2");
    fs::create_dir_all(game_dir.join("bin").join("linux64")).unwrap();
    fs::write(game_dir.join("bin").join("linux64").join("engine.so"), vec![0u8; 64]).unwrap();
    fs::write(game_dir.join("portal2.pak"), vec![1u8; 100]).unwrap();
    fs::write(game_dir.join("readme.txt"), b"hello").unwrap();

    let engine = CleanupEngine::new(SafetyPolicy::with_roots([library]));
    Fixture {
        game_dir: fs::canonicalize(&game_dir).unwrap(),
        engine,
        _tmp: tmp,
    }
}

fn portal() -> GameData {
    GameData {
        app_id: "620".to_string(),
        name: "Portal 2".to_string(),
        ..Default::default()
    }
}

fn listing(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn dry_run_reports_without_touching_anything() {
    let f = fixture();
    let before = listing(&f.game_dir);

    let report = f.engine.cleanup(&f.game_dir, &portal(), SESSION, true).unwrap();
    assert!(report.dry_run);
    assert_eq!(report.files_removed, 2);
    assert_eq!(report.dirs_removed, 1);
    assert_eq!(report.bytes_freed, 169);
    assert!(report.log_file.is_none());
    assert_eq!(listing(&f.game_dir), before);
}

#[test]
fn real_pass_matches_rehearsal_and_writes_log() {
    let f = fixture();
    let rehearsal = f.engine.cleanup(&f.game_dir, &portal(), SESSION, true).unwrap();
    let report = f.engine.cleanup(&f.game_dir, &portal(), SESSION, false).unwrap();

    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.files_removed, rehearsal.files_removed);
    assert_eq!(report.dirs_removed, rehearsal.dirs_removed);
    assert_eq!(report.bytes_freed, rehearsal.bytes_freed);
    assert_eq!(report.install_dir, f.game_dir);

    let log_path = report.log_file.clone().unwrap();
    assert_eq!(log_path, f.game_dir.join(log_file_name(SESSION)));
    assert_eq!(listing(&f.game_dir), vec![log_file_name(SESSION)]);

    let logs = f.engine.removal_logs(&f.game_dir);
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.session_id, SESSION);
    assert_eq!(log.game_data, portal());
    assert_eq!(log.removals.len(), 3);
    let bin = log
        .removals
        .iter()
        .find(|r| r.path.ends_with("bin"))
        .unwrap();
    assert_eq!(bin.kind, RemovalKind::Directory);
    assert_eq!(bin.size_bytes, 64);
    assert_eq!(bin.reason, "complete_cleanup");
}

#[test]
fn earlier_logs_survive_a_second_cleanup() {
    let f = fixture();
    f.engine.cleanup(&f.game_dir, &portal(), SESSION, false).unwrap();
    fs::write(f.game_dir.join("redownloaded.pak"), b"again").unwrap();

    let report = f
        .engine
        .cleanup(&f.game_dir, &portal(), "second-session", false)
        .unwrap();
    assert_eq!(report.files_removed, 1);
    assert!(report.residue.is_empty());
    assert_eq!(
        listing(&f.game_dir),
        vec![log_file_name(SESSION), log_file_name("second-session")]
    );
    assert_eq!(f.engine.removal_logs(&f.game_dir).len(), 2);
}

#[cfg(unix)]
#[test]
fn symlinks_are_removed_not_followed() {
    let f = fixture();
    let outside = f._tmp.path().join("precious");
    fs::create_dir_all(&outside).unwrap();
    fs::write(outside.join("save.dat"), b"keep me").unwrap();
    std::os::unix::fs::symlink(&outside, f.game_dir.join("saves")).unwrap();

    let report = f.engine.cleanup(&f.game_dir, &portal(), SESSION, false).unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(!f.game_dir.join("saves").exists());
    assert!(outside.join("save.dat").exists());
}

#[test]
fn failed_gate_leaves_directory_untouched() {
    let f = fixture();
    let before = listing(&f.game_dir);

    let other_game = GameData {
        app_id: "220".to_string(),
        name: "Half-Life 2".to_string(),
        install_dir: Some("Half-Life 2".to_string()),
        ..Default::default()
    };
    let err = f
        .engine
        .cleanup(&f.game_dir, &other_game, SESSION, false)
        .unwrap_err();
    assert!(matches!(err, LauncherError::Safety { gate: SafetyGate::GameName, .. }), "{err}");

    let err = f.engine.cleanup(&f.game_dir, &portal(), "abc", false).unwrap_err();
    assert!(matches!(err, LauncherError::Safety { gate: SafetyGate::SessionId, .. }), "{err}");

    let untrusted = CleanupEngine::new(SafetyPolicy::with_roots(Vec::new()));
    let err = untrusted
        .safe_cancel_cleanup(&f.game_dir, &portal(), SESSION)
        .unwrap_err();
    assert!(matches!(err, LauncherError::Safety { gate: SafetyGate::Location, .. }), "{err}");

    assert_eq!(listing(&f.game_dir), before);
    assert!(f.engine.removal_logs(&f.game_dir).is_empty());
}

#[test]
fn folder_outside_steamapps_common_is_left_alone() {
    let f = fixture();
    let stray = f._tmp.path().join("SteamLibrary").join("games").join("Portal 2");
    fs::create_dir_all(stray.join("bin")).unwrap();
    fs::write(stray.join("bin").join("engine.so"), vec![0u8; 64]).unwrap();
    fs::write(stray.join("portal2.pak"), vec![1u8; 100]).unwrap();
    let before = listing(&stray);

    for dry_run in [true, false] {
        let err = f.engine.cleanup(&stray, &portal(), SESSION, dry_run).unwrap_err();
        assert!(matches!(err, LauncherError::Safety { gate: SafetyGate::Layout, .. }), "{err}");
    }
    let err = f
        .engine
        .safe_cancel_cleanup(&stray, &portal(), SESSION)
        .unwrap_err();
    assert!(matches!(err, LauncherError::Safety { gate: SafetyGate::Layout, .. }), "{err}");

    assert_eq!(listing(&stray), before);
    assert!(stray.join("bin").join("engine.so").exists());
    assert!(f.engine.removal_logs(&stray).is_empty());
}

#[test]
fn safe_cancel_cleanup_empties_the_game_folder() {
    let f = fixture();
    let report = f
        .engine
        .safe_cancel_cleanup(&f.game_dir, &portal(), SESSION)
        .unwrap();
    assert!(!report.dry_run);
    assert!(report.is_clean());
    assert_eq!(listing(&f.game_dir), vec![log_file_name(SESSION)]);
}
