use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::errors::Result;
use crate::game_data::GameData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Idle,
    Downloading,
    Paused,
    Cancelling,
    Cancelled,
    Completed,
    Error,
}

impl DownloadState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// A run is in flight: a worker exists or cancellation is still tearing it down.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Downloading | Self::Paused | Self::Cancelling)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Error)
    }

    /// Transition table of the download state machine.
    ///
    /// Terminal and idle states only move to `Downloading`, which is how a new session starts.
    pub fn can_transition_to(self, next: DownloadState) -> bool {
        use DownloadState::*;
        match (self, next) {
            (Idle | Cancelled | Completed | Error, Downloading) => true,
            (Downloading, Paused | Cancelling | Cancelled | Completed | Error) => true,
            (Paused, Downloading | Cancelling | Cancelled | Completed | Error) => true,
            (Cancelling, Cancelled) => true,
            (Error, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent record of one download attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadSession {
    pub session_id: String,
    pub game_data: GameData,
    pub selected_depots: Vec<String>,
    pub current_depot_index: usize,
    pub completed_depots: Vec<String>,
    pub download_state: DownloadState,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub dest_path: String,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub downloaded_size: u64,
    #[serde(default)]
    pub error_message: String,
}

/// Frontend-facing snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub game_name: String,
    pub progress: f64,
    pub current_depot: Option<String>,
    pub completed_depots: usize,
    pub total_depots: usize,
    pub state: DownloadState,
    pub timestamp: String,
    pub can_resume: bool,
    pub total_size: u64,
    pub total_size_formatted: String,
    pub downloaded_size: u64,
    pub downloaded_size_formatted: String,
}

pub fn format_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let size = size_bytes as f64;
    if size_bytes < 1024 {
        format!("{size_bytes} B")
    } else if size < KB * KB {
        format!("{:.1} KB", size / KB)
    } else if size < KB * KB * KB {
        format!("{:.1} MB", size / (KB * KB))
    } else {
        format!("{:.1} GB", size / (KB * KB * KB))
    }
}

impl DownloadSession {
    pub fn new(
        session_id: String,
        game_data: GameData,
        selected_depots: Vec<String>,
        dest_path: &Path,
    ) -> Self {
        let total_size = game_data.selected_size(&selected_depots);
        Self {
            session_id,
            game_data,
            selected_depots,
            current_depot_index: 0,
            completed_depots: vec![],
            download_state: DownloadState::Downloading,
            timestamp: Utc::now(),
            dest_path: dest_path.to_string_lossy().to_string(),
            total_size,
            downloaded_size: 0,
            error_message: String::new(),
        }
    }

    pub fn dest_path(&self) -> PathBuf {
        PathBuf::from(&self.dest_path)
    }

    /// Record a finished depot. Unknown or repeated ids are ignored so the
    /// `completed ⊆ selected` invariant holds.
    pub fn mark_depot_completed(&mut self, depot_id: &str) -> bool {
        let selected = self.selected_depots.iter().any(|d| d == depot_id);
        let already = self.completed_depots.iter().any(|d| d == depot_id);
        if !selected || already {
            return false;
        }
        self.completed_depots.push(depot_id.to_string());
        self.current_depot_index = self.completed_depots.len().min(self.selected_depots.len());
        true
    }

    pub fn all_depots_completed(&self) -> bool {
        !self.selected_depots.is_empty() && self.completed_depots.len() == self.selected_depots.len()
    }

    pub fn pending_depots(&self) -> Vec<String> {
        self.selected_depots
            .iter()
            .filter(|d| !self.completed_depots.contains(d))
            .cloned()
            .collect()
    }

    /// Byte counters only move forward while a run is live.
    pub fn record_bytes(&mut self, downloaded: u64, total: u64) -> bool {
        let mut changed = false;
        if downloaded > self.downloaded_size {
            self.downloaded_size = downloaded;
            changed = true;
        }
        if total > self.total_size {
            self.total_size = total;
            changed = true;
        }
        changed
    }

    pub fn progress_percentage(&self) -> f64 {
        if self.selected_depots.is_empty() {
            return 0.0;
        }
        (self.completed_depots.len() as f64 / self.selected_depots.len() as f64) * 100.0
    }

    pub fn current_depot(&self) -> Option<&str> {
        self.selected_depots
            .get(self.current_depot_index)
            .map(String::as_str)
    }

    pub fn is_completed(&self) -> bool {
        self.download_state == DownloadState::Completed && self.all_depots_completed()
    }

    pub fn can_resume(&self) -> bool {
        matches!(
            self.download_state,
            DownloadState::Paused | DownloadState::Cancelled
        ) && self.completed_depots.len() < self.selected_depots.len()
    }

    pub fn calculate_total_size(&mut self, depot_sizes: &BTreeMap<String, u64>) -> u64 {
        self.total_size = self
            .selected_depots
            .iter()
            .filter_map(|d| depot_sizes.get(d))
            .sum();
        self.total_size
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            game_name: self.game_data.display_name().to_string(),
            progress: self.progress_percentage(),
            current_depot: self.current_depot().map(str::to_string),
            completed_depots: self.completed_depots.len(),
            total_depots: self.selected_depots.len(),
            state: self.download_state,
            timestamp: self.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            can_resume: self.can_resume(),
            total_size: self.total_size,
            total_size_formatted: format_size(self.total_size),
            downloaded_size: self.downloaded_size,
            downloaded_size_formatted: format_size(self.downloaded_size),
        }
    }
}

const CACHE_CAPACITY: usize = 32;
const CACHE_TTL: Duration = Duration::from_secs(30);

/// Whole-document JSON store keyed by session id.
///
/// Single-process only: every write re-reads the document, mutates it and replaces the file.
pub struct SessionStore {
    path: PathBuf,
    cache: Mutex<TtlCache<String, DownloadSession>>,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(TtlCache::new(CACHE_CAPACITY, CACHE_TTL)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cache(&self) -> MutexGuard<'_, TtlCache<String, DownloadSession>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load_all(&self) -> Result<BTreeMap<String, DownloadSession>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&text)?)
    }

    fn write_all(&self, sessions: &BTreeMap<String, DownloadSession>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(sessions)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn save(&self, session: &DownloadSession) -> Result<()> {
        let mut sessions = self.load_all()?;
        sessions.insert(session.session_id.clone(), session.clone());
        self.write_all(&sessions)?;
        self.cache().insert(session.session_id.clone(), session.clone());
        log::debug!("session {} saved ({})", session.session_id, session.download_state);
        Ok(())
    }

    pub fn load(&self, session_id: &str) -> Result<Option<DownloadSession>> {
        if let Some(hit) = self.cache().get(&session_id.to_string()) {
            return Ok(Some(hit));
        }
        let session = self.load_all()?.remove(session_id);
        if let Some(s) = &session {
            self.cache().insert(session_id.to_string(), s.clone());
        }
        Ok(session)
    }

    pub fn delete(&self, session_id: &str) -> Result<bool> {
        self.cache().invalidate(&session_id.to_string());
        let mut sessions = self.load_all()?;
        if sessions.remove(session_id).is_none() {
            return Ok(false);
        }
        self.write_all(&sessions)?;
        log::debug!("session {session_id} deleted");
        Ok(true)
    }

    /// Drop sessions created more than `days` days ago. Returns the removed ids.
    pub fn cleanup_old_sessions(&self, days: u32) -> Result<Vec<String>> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let mut sessions = self.load_all()?;
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.timestamp < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }
        for id in &stale {
            sessions.remove(id);
            self.cache().invalidate(id);
        }
        self.write_all(&sessions)?;
        log::info!("cleaned up {} old sessions", stale.len());
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> DownloadSession {
        let game = GameData {
            app_id: "620".to_string(),
            name: "Portal 2".to_string(),
            depot_sizes: BTreeMap::from([("621".to_string(), 100), ("622".to_string(), 50)]),
            ..Default::default()
        };
        DownloadSession::new(
            id.to_string(),
            game,
            vec!["621".to_string(), "622".to_string()],
            Path::new("/library"),
        )
    }

    #[test]
    fn cancelling_only_leads_to_cancelled() {
        use DownloadState::*;
        let all = [Idle, Downloading, Paused, Cancelling, Cancelled, Completed, Error];
        for next in all {
            assert_eq!(Cancelling.can_transition_to(next), next == Cancelled, "{next}");
        }
        assert!(Downloading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Downloading));
        // The last depot can exit between a pause request and its acknowledgement.
        assert!(Paused.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Paused));
        assert!(!Idle.can_transition_to(Completed));
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&DownloadState::Cancelling).unwrap(), "\"cancelling\"");
    }

    #[test]
    fn completion_tracking_respects_selection() {
        let mut s = session("abcdef");
        assert_eq!(s.total_size, 150);
        assert!(!s.mark_depot_completed("999"));
        assert!(s.mark_depot_completed("621"));
        assert!(!s.mark_depot_completed("621"));
        assert_eq!(s.current_depot(), Some("622"));
        assert_eq!(s.progress_percentage(), 50.0);
        assert!(!s.all_depots_completed());
        assert!(s.mark_depot_completed("622"));
        assert!(s.all_depots_completed());
        assert_eq!(s.current_depot(), None);
    }

    #[test]
    fn byte_counters_never_decrease() {
        let mut s = session("abcdef");
        assert!(s.record_bytes(40, 0));
        assert!(!s.record_bytes(10, 0));
        assert_eq!(s.downloaded_size, 40);
        assert_eq!(s.total_size, 150);
    }

    #[test]
    fn resumable_only_when_work_left() {
        let mut s = session("abcdef");
        s.download_state = DownloadState::Paused;
        assert!(s.can_resume());
        s.mark_depot_completed("621");
        s.mark_depot_completed("622");
        assert!(!s.can_resume());
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn summary_reports_progress() {
        let mut s = session("abcdef");
        s.mark_depot_completed("621");
        let summary = s.summary();
        assert_eq!(summary.game_name, "Portal 2");
        assert_eq!(summary.completed_depots, 1);
        assert_eq!(summary.total_depots, 2);
        assert_eq!(summary.total_size_formatted, "150 B");
    }
}
