use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{LauncherError, Result};

const APP_DIR_NAME: &str = "depot-launcher";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[cfg(target_os = "windows")]
const DOWNLOADER_BINARY: &str = "DepotDownloaderMod.exe";

#[cfg(not(target_os = "windows"))]
const DOWNLOADER_BINARY: &str = "DepotDownloaderMod";

/// External post-download step (DRM stripping through a Wine-hosted tool, usually).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PostProcessSettings {
    pub enabled: bool,
    /// Shell-style command line; the game install directory is appended as the last argument.
    pub command: String,
}

impl Default for PostProcessSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            command: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub downloader_path: PathBuf,
    /// Root for sessions and logs.
    pub data_dir: PathBuf,
    /// Per-session scratch space (generated credentials files).
    pub work_dir: PathBuf,
    /// Where `<depot>_<manifest>.manifest` files are dropped before a download starts.
    pub manifest_dir: PathBuf,
    pub max_downloads: u32,
    pub validate: bool,
    /// Ask the downloader to skip compressed transfer.
    pub no_compression: bool,
    pub extra_args: String,
    pub monitor_interval_ms: u64,
    pub termination_confirm_ms: u64,
    pub poll_interval_ms: u64,
    pub graceful_timeout_secs: u64,
    pub kill_timeout_secs: u64,
    pub stall_timeout_secs: Option<u64>,
    pub session_retention_days: u32,
    /// Extra library roots the cleanup engine may operate under, on top of the built-in ones.
    pub library_roots: Vec<PathBuf>,
    pub post_process: PostProcessSettings,
    pub log_level: String,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

impl Default for Settings {
    fn default() -> Self {
        Self::with_data_dir(default_data_dir())
    }
}

impl Settings {
    /// Defaults with every derived path rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            downloader_path: data_dir.join("external").join(DOWNLOADER_BINARY),
            work_dir: data_dir.join("work"),
            manifest_dir: data_dir.join("manifest"),
            data_dir,
            max_downloads: 25,
            validate: true,
            no_compression: false,
            extra_args: String::new(),
            monitor_interval_ms: 2000,
            termination_confirm_ms: 1000,
            poll_interval_ms: 100,
            graceful_timeout_secs: 5,
            kill_timeout_secs: 2,
            stall_timeout_secs: None,
            session_retention_days: 7,
            library_roots: vec![],
            post_process: PostProcessSettings::default(),
            log_level: "info".to_string(),
        }
    }

    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir()
            .ok_or_else(|| LauncherError::Config("failed to resolve config dir".to_string()))?;
        Ok(base.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
    }

    /// Read settings from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("no settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&text)
            .map_err(|e| LauncherError::Config(format!("{}: {e}", path.display())))?;
        settings.check()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.max_downloads == 0 {
            return Err(LauncherError::Config("max_downloads must be at least 1".to_string()));
        }
        if self.poll_interval_ms == 0 || self.monitor_interval_ms == 0 {
            return Err(LauncherError::Config("intervals must be non-zero".to_string()));
        }
        self.extra_args_vec()?;
        if self.post_process.enabled {
            self.post_process_command()?;
        }
        Ok(())
    }

    pub fn extra_args_vec(&self) -> Result<Vec<String>> {
        if self.extra_args.trim().is_empty() {
            return Ok(vec![]);
        }
        shlex::split(&self.extra_args)
            .ok_or_else(|| LauncherError::Config(format!("unparsable extra_args: {}", self.extra_args)))
    }

    /// Program + leading arguments of the post-processing command.
    pub fn post_process_command(&self) -> Result<Vec<String>> {
        let parts = shlex::split(&self.post_process.command).ok_or_else(|| {
            LauncherError::Config(format!(
                "unparsable post_process.command: {}",
                self.post_process.command
            ))
        })?;
        if parts.is_empty() {
            return Err(LauncherError::Config("post_process.command is empty".to_string()));
        }
        Ok(parts)
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.data_dir.join("sessions").join("download_sessions.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn session_work_dir(&self, session_id: &str) -> PathBuf {
        self.work_dir.join(session_id)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn termination_confirm_delay(&self) -> Duration {
        Duration::from_millis(self.termination_confirm_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_secs)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.kill_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.max_downloads, 25);
        assert_eq!(settings.monitor_interval(), Duration::from_secs(2));
        assert_eq!(settings.graceful_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"max_downloads": 8, "extra_args": "-os windows -osarch 64"}"#)
            .unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.max_downloads, 8);
        assert!(settings.validate);
        assert!(!settings.no_compression);
        assert_eq!(
            settings.extra_args_vec().unwrap(),
            vec!["-os", "windows", "-osarch", "64"]
        );
    }

    #[test]
    fn rejects_zero_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"max_downloads": 0}"#).unwrap();
        assert!(matches!(Settings::load(&path), Err(LauncherError::Config(_))));
    }

    #[test]
    fn save_then_load_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = Settings::with_data_dir(dir.path());
        settings.post_process = PostProcessSettings {
            enabled: true,
            command: "wine 'Steamless CLI.exe' --quiet".to_string(),
        };
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(
            loaded.post_process_command().unwrap(),
            vec!["wine", "Steamless CLI.exe", "--quiet"]
        );
    }
}
