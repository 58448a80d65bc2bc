use std::path::{Component, Path, PathBuf};

use serde::Serialize;

const TEMP_SUFFIXES: &[&str] = &[
    ".tmp",
    ".temp",
    ".partial",
    ".part",
    ".downloading",
    ".incomplete",
    ".chunk",
    ".lock",
];

const TEMP_NAMES: &[&str] = &["keys.vdf"];

/// Roots shallower than this are never swept.
const MIN_ROOT_DEPTH: usize = 3;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub files_removed: usize,
    pub dirs_removed: usize,
    pub bytes_freed: u64,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Conservative fallback: removes only files that look like download leftovers.
pub struct TempFileSweeper {
    session_id: String,
}

impl TempFileSweeper {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
        }
    }

    pub fn is_temp_file(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        if TEMP_NAMES.contains(&lower.as_str()) {
            return true;
        }
        if TEMP_SUFFIXES.iter().any(|s| lower.ends_with(s)) {
            return true;
        }
        self.session_id.len() >= 5 && name.contains(&self.session_id)
    }

    /// Sweep every root recursively. Symlinks are neither followed nor removed, and the roots
    /// themselves are kept even when they end up empty.
    pub fn sweep(&self, roots: &[PathBuf]) -> SweepReport {
        let mut report = SweepReport::default();
        for root in roots {
            let depth = root
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .count();
            if depth < MIN_ROOT_DEPTH {
                report
                    .errors
                    .push(format!("refusing to sweep shallow path {}", root.display()));
                continue;
            }
            match std::fs::symlink_metadata(root) {
                Ok(meta) if meta.is_dir() => self.sweep_dir(root, &mut report),
                Ok(_) => log::warn!("sweep root {} is not a directory", root.display()),
                Err(_) => log::debug!("sweep root {} does not exist", root.display()),
            }
        }
        log::info!(
            "fallback sweep for session {}: {} files, {} dirs, {} bytes",
            self.session_id,
            report.files_removed,
            report.dirs_removed,
            report.bytes_freed
        );
        report
    }

    fn sweep_dir(&self, dir: &Path, report: &mut SweepReport) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                report.errors.push(format!("{}: {e}", dir.display()));
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = std::fs::symlink_metadata(&path) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                self.sweep_dir(&path, report);
                if is_empty_dir(&path) {
                    match std::fs::remove_dir(&path) {
                        Ok(()) => report.dirs_removed += 1,
                        Err(e) => report.errors.push(format!("{}: {e}", path.display())),
                    }
                }
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !self.is_temp_file(&name) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    log::debug!("removed temp file {}", path.display());
                    report.files_removed += 1;
                    report.bytes_freed += meta.len();
                }
                Err(e) => report.errors.push(format!("{}: {e}", path.display())),
            }
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
