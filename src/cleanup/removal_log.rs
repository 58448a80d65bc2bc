use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::game_data::GameData;

pub const LOG_PREFIX: &str = ".depot_cleanup_log_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalEntry {
    #[serde(rename = "type")]
    pub kind: RemovalKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub reason: String,
}

/// Audit record written next to what was removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalLog {
    pub timestamp: DateTime<Utc>,
    pub install_dir: PathBuf,
    pub game_data: GameData,
    pub session_id: String,
    pub removals: Vec<RemovalEntry>,
}

pub fn log_file_name(session_id: &str) -> String {
    format!("{LOG_PREFIX}{session_id}.json")
}

pub fn is_log_file(name: &str) -> bool {
    name.starts_with(LOG_PREFIX) && name.ends_with(".json")
}

pub fn write_removal_log(dir: &Path, log: &RemovalLog) -> Result<PathBuf> {
    let path = dir.join(log_file_name(&log.session_id));
    let json = serde_json::to_string_pretty(log)?;
    std::fs::write(&path, json)?;
    log::info!("cleanup log saved: {}", path.display());
    Ok(path)
}

/// Previous logs in `dir`, newest first. Unreadable files are skipped.
pub fn removal_logs(dir: &Path) -> Vec<RemovalLog> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return vec![];
    };
    let mut logs: Vec<RemovalLog> = entries
        .flatten()
        .filter(|e| is_log_file(&e.file_name().to_string_lossy()))
        .filter_map(|e| {
            let text = std::fs::read_to_string(e.path()).ok()?;
            serde_json::from_str(&text).ok()
        })
        .collect();
    logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    logs
}
