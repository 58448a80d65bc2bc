use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::errors::{LauncherError, Result};
use crate::game_data::GameData;

/// Minimum number of named components the resolved target must have.
const MIN_DEPTH: usize = 4;
const MIN_SESSION_ID_LEN: usize = 5;

/// Entries that mark a Steam installation rather than a game folder.
const STEAM_MARKERS: &[&str] = &["steam.sh", "steam.exe", "steamapps", "userdata"];

/// One of the checks that must all pass before anything is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyGate {
    Exists,
    Location,
    Layout,
    GameName,
    Denylist,
    SessionId,
    GameData,
}

impl SafetyGate {
    pub const ALL: [SafetyGate; 7] = [
        SafetyGate::Exists,
        SafetyGate::Location,
        SafetyGate::Layout,
        SafetyGate::GameName,
        SafetyGate::Denylist,
        SafetyGate::SessionId,
        SafetyGate::GameData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exists => "exists",
            Self::Location => "location",
            Self::Layout => "layout",
            Self::GameName => "game_name",
            Self::Denylist => "denylist",
            Self::SessionId => "session_id",
            Self::GameData => "game_data",
        }
    }
}

impl fmt::Display for SafetyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_library_roots() -> Vec<PathBuf> {
    let mut roots = vec![];
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".steam").join("steam"));
        roots.push(home.join(".local").join("share").join("Steam"));
        roots.push(
            home.join(".var")
                .join("app")
                .join("com.valvesoftware.Steam")
                .join(".local")
                .join("share")
                .join("Steam"),
        );
    }
    roots.push(PathBuf::from("/usr/local/games/steam"));
    roots.push(PathBuf::from("/opt/steam"));
    if cfg!(windows) {
        roots.push(PathBuf::from(r"C:\Program Files (x86)\Steam"));
        roots.push(PathBuf::from(r"C:\Program Files\Steam"));
    }
    roots
}

fn system_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = if cfg!(windows) {
        [
            r"C:\",
            r"C:\Windows",
            r"C:\Windows\System32",
            r"C:\Program Files",
            r"C:\Program Files (x86)",
            r"C:\Users",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    } else {
        [
            "/", "/bin", "/boot", "/etc", "/home", "/lib", "/opt", "/root", "/sbin", "/usr",
            "/usr/bin", "/usr/lib", "/usr/local", "/var", "/tmp",
        ]
        .iter()
        .map(PathBuf::from)
        .collect()
    };
    if let Some(home) = dirs::home_dir() {
        paths.push(home);
    }
    paths
}

fn depth(path: &Path) -> usize {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .count()
}

fn name_eq(path: Option<&Path>, expected: &str) -> bool {
    path.and_then(Path::file_name)
        .map(|n| n.to_string_lossy().eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

/// Allow-list of library roots plus the protected paths derived from them.
///
/// Holds no state about previous verifications; every call re-checks from scratch.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    roots: Vec<PathBuf>,
    protected: Vec<PathBuf>,
}

impl SafetyPolicy {
    /// Built-in Steam locations plus `extra_roots`.
    pub fn new(extra_roots: &[PathBuf]) -> Self {
        let mut roots = default_library_roots();
        roots.extend(extra_roots.iter().cloned());
        Self::with_roots(roots)
    }

    /// Only the given roots. Roots that don't exist are dropped.
    pub fn with_roots(roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut resolved: Vec<PathBuf> = roots
            .into_iter()
            .filter_map(|r| resolve_path(&r))
            .collect();
        resolved.sort();
        resolved.dedup();

        let mut protected: Vec<PathBuf> = system_paths()
            .into_iter()
            .map(|p| resolve_path(&p).unwrap_or(p))
            .collect();
        for root in &resolved {
            let steamapps = root.join("steamapps");
            protected.push(root.clone());
            protected.push(steamapps.join("common"));
            protected.push(steamapps.join("workshop"));
            protected.push(steamapps.join("downloading"));
            protected.push(steamapps.clone());
            protected.push(root.join("userdata"));
            protected.push(root.join("config"));
        }

        Self {
            roots: resolved,
            protected,
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Run every gate. Returns the resolved target on success.
    pub fn verify(&self, install_dir: &Path, game: &GameData, session_id: &str) -> Result<PathBuf> {
        self.check_game_data(game)?;
        self.check_session(session_id)?;
        let resolved = self.check_exists(install_dir)?;
        self.check_location(&resolved)?;
        self.check_layout(&resolved)?;
        self.check_name(&resolved, game)?;
        self.check_denylist(&resolved)?;
        log::debug!("all safety gates passed for {}", resolved.display());
        Ok(resolved)
    }

    fn check_game_data(&self, game: &GameData) -> Result<()> {
        if game.name.trim().is_empty() || game.app_id.trim().is_empty() {
            return Err(LauncherError::safety(
                SafetyGate::GameData,
                "game data needs both a name and an appid",
            ));
        }
        Ok(())
    }

    fn check_session(&self, session_id: &str) -> Result<()> {
        if session_id.trim().len() < MIN_SESSION_ID_LEN {
            return Err(LauncherError::safety(
                SafetyGate::SessionId,
                format!("session id {session_id:?} is missing or malformed"),
            ));
        }
        Ok(())
    }

    fn check_exists(&self, install_dir: &Path) -> Result<PathBuf> {
        let resolved = resolve_path(install_dir).ok_or_else(|| {
            LauncherError::safety(
                SafetyGate::Exists,
                format!("{} does not resolve", install_dir.display()),
            )
        })?;
        if !resolved.is_dir() {
            return Err(LauncherError::safety(
                SafetyGate::Exists,
                format!("{} is not a directory", resolved.display()),
            ));
        }
        Ok(resolved)
    }

    fn check_location(&self, resolved: &Path) -> Result<()> {
        if depth(resolved) < MIN_DEPTH {
            return Err(LauncherError::safety(
                SafetyGate::Location,
                format!("{} is too close to the filesystem root", resolved.display()),
            ));
        }
        let allowed = self
            .roots
            .iter()
            .any(|root| resolved.starts_with(root) && resolved != root);
        if !allowed {
            return Err(LauncherError::safety(
                SafetyGate::Location,
                format!("{} is not under a known game library", resolved.display()),
            ));
        }
        Ok(())
    }

    fn check_layout(&self, resolved: &Path) -> Result<()> {
        let parent = resolved.parent();
        let grandparent = parent.and_then(Path::parent);
        if !name_eq(parent, "common") || !name_eq(grandparent, "steamapps") {
            return Err(LauncherError::safety(
                SafetyGate::Layout,
                format!("{} is not inside steamapps/common", resolved.display()),
            ));
        }
        Ok(())
    }

    fn check_name(&self, resolved: &Path, game: &GameData) -> Result<()> {
        let dir_name = resolved
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let game_name = game.name.trim().to_lowercase();
        let declared = game
            .install_dir
            .as_deref()
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty());

        let matches = (!game_name.is_empty() && dir_name.contains(&game_name))
            || declared.as_deref() == Some(dir_name.as_str())
            || game.install_folder_name().to_lowercase() == dir_name;
        if !matches {
            return Err(LauncherError::safety(
                SafetyGate::GameName,
                format!("directory {dir_name:?} does not belong to {:?}", game.name),
            ));
        }
        Ok(())
    }

    fn check_denylist(&self, resolved: &Path) -> Result<()> {
        if let Some(hit) = self.protected.iter().find(|p| p.starts_with(resolved)) {
            return Err(LauncherError::safety(
                SafetyGate::Denylist,
                format!(
                    "{} is or contains protected path {}",
                    resolved.display(),
                    hit.display()
                ),
            ));
        }
        for marker in STEAM_MARKERS {
            if resolved.join(marker).exists() {
                return Err(LauncherError::safety(
                    SafetyGate::Denylist,
                    format!("{} contains {marker}", resolved.display()),
                ));
            }
        }
        Ok(())
    }
}

/// `canonicalize` without the `\\?\` prefix on Windows so prefix comparisons stay sane.
fn resolve_path(path: &Path) -> Option<PathBuf> {
    let resolved = std::fs::canonicalize(path).ok()?;
    #[cfg(windows)]
    {
        let text = resolved.to_string_lossy();
        if let Some(stripped) = text.strip_prefix(r"\\?\") {
            if !stripped.starts_with("UNC") {
                return Some(PathBuf::from(stripped));
            }
        }
    }
    Some(resolved)
}
