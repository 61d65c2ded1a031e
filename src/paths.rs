// ABOUTME: XDG Base Directory paths for the insights config file.
// ABOUTME: Falls back to the working directory when no home directory is known.

use directories::ProjectDirs;
use std::path::PathBuf;

/// Application identifier for XDG directories
const QUALIFIER: &str = "";
const ORGANIZATION: &str = "";
const APPLICATION: &str = "insights";

/// File name looked up in the working directory before the XDG location
pub const LOCAL_CONFIG_FILE: &str = "insights.toml";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Config directory (e.g., ~/.config/insights/)
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default config file (e.g., ~/.config/insights/config.toml)
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Config files in search order, after any explicit --config path
pub fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(LOCAL_CONFIG_FILE));
    }
    candidates.push(config_file());
    candidates
}
