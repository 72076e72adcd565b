//! Configuration Storage
//!
//! The settings collaborator the factory reads from and writes back to.

use super::{Settings, SettingsError};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};

/// Source and sink for the settings snapshot
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings, SettingsError>;

    fn save(&self, settings: &Settings) -> Result<(), SettingsError>;
}

/// Get the configuration directory path
pub fn config_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "voxrelay", "VoxRelay")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| {
            // Fallback to current directory
            std::env::current_dir().unwrap_or_default().join("config")
        })
}

/// Get the configuration file path
pub fn config_file() -> PathBuf {
    config_dir().join("providers.toml")
}

/// TOML file on disk
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileSettingsStore {
    fn default() -> Self {
        Self::new(config_file())
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        if !self.path.exists() {
            tracing::info!("No settings file found, using defaults");
            return Ok(Settings::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let settings: Settings = toml::from_str(&content)?;

        tracing::info!("Settings loaded from {:?}", self.path);
        Ok(settings)
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        // Ensure config directory exists
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(settings)?;
        std::fs::write(&self.path, content)?;

        tracing::info!("Settings saved to {:?}", self.path);
        Ok(())
    }
}

/// In-process store for embedding and tests
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    settings: RwLock<Settings>,
    saves: RwLock<u32>,
}

impl MemorySettingsStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            saves: RwLock::new(0),
        }
    }

    /// Number of times `save` has been called
    pub fn save_count(&self) -> u32 {
        *self.saves.read()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Result<Settings, SettingsError> {
        Ok(self.settings.read().clone())
    }

    fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        *self.settings.write() = settings.clone();
        *self.saves.write() += 1;
        Ok(())
    }
}
