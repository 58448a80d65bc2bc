//! Safety-gated removal of a cancelled game's install directory.
//!
//! [`CleanupEngine::cleanup`] refuses to touch the filesystem unless every [`SafetyGate`]
//! passes. Once they do, each direct child of the target is removed individually and recorded
//! in a [`RemovalLog`] written inside the target. [`TempFileSweeper`] is the narrow fallback
//! used when the aggressive pass is refused or incomplete.

mod removal_log;
mod safety;
mod sweep;

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::config::Settings;
use crate::errors::Result;
use crate::game_data::GameData;

pub use removal_log::{
    is_log_file, log_file_name, removal_logs, RemovalEntry, RemovalKind, RemovalLog, LOG_PREFIX,
};
pub use safety::{SafetyGate, SafetyPolicy};
pub use sweep::{SweepReport, TempFileSweeper};

const REASON: &str = "complete_cleanup";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub install_dir: PathBuf,
    pub session_id: String,
    pub dry_run: bool,
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub bytes_freed: u64,
    pub removals: Vec<RemovalEntry>,
    pub errors: Vec<String>,
    /// Entries still present after a real pass.
    pub residue: Vec<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.residue.is_empty()
    }
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match std::fs::symlink_metadata(entry.path()) {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}

fn remove_link(path: &Path) -> std::io::Result<()> {
    // Directory symlinks on Windows need remove_dir.
    std::fs::remove_file(path).or_else(|_| std::fs::remove_dir(path))
}

pub struct CleanupEngine {
    policy: SafetyPolicy,
}

impl CleanupEngine {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self { policy }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(SafetyPolicy::new(&settings.library_roots))
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Remove everything inside `install_dir`.
    ///
    /// A failed gate returns `Err` before any mutation. Individual removal failures don't stop
    /// the pass; they land in [`CleanupReport::errors`].
    pub fn cleanup(
        &self,
        install_dir: &Path,
        game: &GameData,
        session_id: &str,
        dry_run: bool,
    ) -> Result<CleanupReport> {
        let target = match self.policy.verify(install_dir, game, session_id) {
            Ok(target) => target,
            Err(e) => {
                log::error!("cleanup of {} refused: {e}", install_dir.display());
                return Err(e);
            }
        };
        let tag = if dry_run { "[DRY RUN] " } else { "" };
        log::warn!(
            "{tag}removing all contents of {} for {} (appid {}, session {session_id})",
            target.display(),
            game.display_name(),
            game.app_id
        );

        let mut report = CleanupReport {
            install_dir: target.clone(),
            session_id: session_id.to_string(),
            dry_run,
            ..Default::default()
        };

        let mut items: Vec<PathBuf> = std::fs::read_dir(&target)?
            .flatten()
            .filter(|e| !is_log_file(&e.file_name().to_string_lossy()))
            .map(|e| e.path())
            .collect();
        items.sort();
        log::info!("{tag}found {} items to delete", items.len());

        for item in items {
            if let Err(e) = self.remove_item(&item, dry_run, &mut report) {
                log::error!("failed to delete {}: {e}", item.display());
                report.errors.push(format!("{}: {e}", item.display()));
            }
        }

        if !dry_run {
            report.residue = std::fs::read_dir(&target)?
                .flatten()
                .filter(|e| !is_log_file(&e.file_name().to_string_lossy()))
                .map(|e| e.path())
                .collect();
            if report.residue.is_empty() {
                log::info!("{} is now empty", target.display());
            } else {
                log::warn!(
                    "{} not empty after cleanup: {} items remain",
                    target.display(),
                    report.residue.len()
                );
            }

            let log_record = RemovalLog {
                timestamp: Utc::now(),
                install_dir: target.clone(),
                game_data: game.clone(),
                session_id: session_id.to_string(),
                removals: report.removals.clone(),
            };
            match removal_log::write_removal_log(&target, &log_record) {
                Ok(path) => report.log_file = Some(path),
                Err(e) => log::error!("failed to save removal log: {e}"),
            }
        }

        log::warn!(
            "{tag}cleanup finished: {} files, {} dirs, {} bytes",
            report.files_removed,
            report.dirs_removed,
            report.bytes_freed
        );
        Ok(report)
    }

    fn remove_item(&self, item: &Path, dry_run: bool, report: &mut CleanupReport) -> Result<()> {
        let meta = std::fs::symlink_metadata(item)?;
        let (kind, size) = if meta.is_dir() {
            (RemovalKind::Directory, dir_size(item))
        } else {
            (RemovalKind::File, meta.len())
        };

        if dry_run {
            log::debug!("[DRY RUN] would delete {:?} {} ({size} bytes)", kind, item.display());
        } else if meta.file_type().is_symlink() {
            remove_link(item)?;
        } else if meta.is_dir() {
            std::fs::remove_dir_all(item)?;
        } else {
            std::fs::remove_file(item)?;
        }

        match kind {
            RemovalKind::Directory => report.dirs_removed += 1,
            RemovalKind::File => report.files_removed += 1,
        }
        report.bytes_freed += size;
        report.removals.push(RemovalEntry {
            kind,
            path: item.to_path_buf(),
            size_bytes: size,
            reason: REASON.to_string(),
        });
        Ok(())
    }

    /// Cancellation entry point: rehearse with a dry run, then do the real pass.
    pub fn safe_cancel_cleanup(
        &self,
        install_dir: &Path,
        game: &GameData,
        session_id: &str,
    ) -> Result<CleanupReport> {
        let rehearsal = self.cleanup(install_dir, game, session_id, true)?;
        log::info!(
            "dry run would remove {} files and {} dirs",
            rehearsal.files_removed,
            rehearsal.dirs_removed
        );
        self.cleanup(install_dir, game, session_id, false)
    }

    pub fn removal_logs(&self, install_dir: &Path) -> Vec<RemovalLog> {
        removal_logs(install_dir)
    }
}
