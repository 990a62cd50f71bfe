//! Storage layer for the data directory (settings file and catalog location)

use crate::error::OffmapError;
use offmap_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

const SETTINGS_FILE: &str = "settings.json";
const CATALOG_FILE: &str = "regions.db";

/// Storage manager for offmap data
#[derive(Clone, Debug)]
pub struct Storage {
    /// Data directory
    data_dir: PathBuf,
}

impl Storage {
    /// Create a new storage instance, creating the data directory if needed
    pub async fn new(data_dir: PathBuf) -> Result<Self, OffmapError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the SQLite region catalog
    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join(CATALOG_FILE)
    }

    fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    // ========================================================================
    // Settings
    // ========================================================================

    /// Load settings, falling back to defaults when the file is missing or unreadable
    pub async fn load_settings(&self) -> Result<Settings, OffmapError> {
        let path = self.settings_path();
        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                warn!("Ignoring malformed settings file {}: {}", path.display(), e);
                Ok(Settings::default())
            }
        }
    }

    /// Save settings to the data directory
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), OffmapError> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), content).await?;
        Ok(())
    }
}
