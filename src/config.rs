//! Store location configuration

use std::path::{Path, PathBuf};

/// File name of the group database inside the config directory
pub const DATABASE_FILE: &str = "groups.db";

/// Where the group store keeps its SQLite file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Path of the SQLite database file
    pub path: PathBuf,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(default_database_path())
    }
}

/// Per-user database location, e.g. `~/.config/hue-groups/groups.db` on Linux
pub fn default_database_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hue-groups")
        .join(DATABASE_FILE)
}
