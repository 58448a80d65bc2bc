use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{LauncherError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DepotInfo {
    pub key: String,
    #[serde(default, alias = "desc")]
    pub description: String,
}

/// Everything the archive parser hands over about one game.
///
/// Field names match the JSON produced upstream so the record round-trips through the session
/// store unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameData {
    #[serde(rename = "appid", deserialize_with = "string_or_number")]
    pub app_id: String,
    #[serde(rename = "game_name", alias = "name", default)]
    pub name: String,
    #[serde(rename = "installdir", default, skip_serializing_if = "Option::is_none")]
    pub install_dir: Option<String>,
    #[serde(default)]
    pub depots: BTreeMap<String, DepotInfo>,
    #[serde(default)]
    pub manifests: BTreeMap<String, String>,
    #[serde(default)]
    pub depot_sizes: BTreeMap<String, u64>,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub selected_dlcs: Vec<String>,
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn sanitize_folder_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

impl GameData {
    pub fn is_empty(&self) -> bool {
        self.app_id.trim().is_empty() && self.name.trim().is_empty() && self.depots.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(LauncherError::validation("game data is empty"));
        }
        if self.app_id.trim().is_empty() {
            return Err(LauncherError::validation("game data has no appid"));
        }
        if !self.app_id.trim().chars().all(|c| c.is_ascii_digit()) {
            return Err(LauncherError::validation(format!(
                "appid must be numeric, got {:?}",
                self.app_id
            )));
        }
        Ok(())
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            "Unknown"
        } else {
            self.name.trim()
        }
    }

    /// Folder under `steamapps/common` the game is installed into.
    pub fn install_folder_name(&self) -> String {
        let declared = self
            .install_dir
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let folder = declared.unwrap_or_else(|| {
            self.name
                .chars()
                .filter(|c| is_word_char(*c) || c.is_whitespace() || *c == '-')
                .collect::<String>()
                .trim()
                .replace(' ', "_")
        });

        let folder = sanitize_folder_name(folder.trim());
        if folder.is_empty() || folder.chars().all(|c| c == '.') {
            return format!("App_{}", self.app_id.trim());
        }
        folder
    }

    /// `dest/steamapps/common/<folder>`, refusing anything that escapes `dest`.
    pub fn install_dir(&self, dest_path: &Path) -> Result<PathBuf> {
        if self.app_id.trim().is_empty() {
            return Err(LauncherError::validation("missing appid in game data"));
        }
        let folder = self.install_folder_name();
        let rel = Path::new("steamapps").join("common").join(&folder);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(LauncherError::validation(format!(
                "install folder escapes the library: {folder}"
            )));
        }
        let install_dir = dest_path.join(rel);
        if !install_dir.starts_with(dest_path) {
            return Err(LauncherError::validation(format!(
                "path traversal detected: {}",
                install_dir.display()
            )));
        }
        Ok(install_dir)
    }

    pub fn manifest_for(&self, depot_id: &str) -> Option<&str> {
        self.manifests
            .get(depot_id)
            .map(String::as_str)
            .filter(|m| !m.trim().is_empty())
    }

    /// Sum of the known sizes of `depots`; unknown depots count as zero.
    pub fn selected_size(&self, depots: &[String]) -> u64 {
        depots
            .iter()
            .filter_map(|d| self.depot_sizes.get(d))
            .sum()
    }
}
