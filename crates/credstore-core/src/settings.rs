//! Application settings management
//!
//! Stores the storage configuration in a plain JSON file. Nothing secret
//! lives here.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::crypto::{EncryptionSpec, EncryptionType};
use crate::error::Result;

const SETTINGS_FILE_NAME: &str = "settings.json";

/// Where credentials are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderType {
    /// OS keychain, falling back to memory if it cannot load
    #[default]
    Keychain,
    /// Encrypted database file
    Database,
    /// Nothing leaves the process
    MemoryOnly,
}

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Settings file version
    pub version: u32,
    pub provider_type: ProviderType,
    /// Custom database file (default: `credentials.db` in the data directory)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Key id used when the master key is protected with PGP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgp_key_id: Option<String>,
    /// How the master key file is protected
    pub master_key_encryption: EncryptionType,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self {
            version: 1,
            provider_type: ProviderType::default(),
            database_path: None,
            pgp_key_id: None,
            master_key_encryption: EncryptionType::BuiltIn,
        }
    }

    /// Master key protection described by these settings
    pub fn encryption_spec(&self) -> EncryptionSpec {
        match (self.master_key_encryption, self.pgp_key_id.as_deref()) {
            (EncryptionType::PgpKey, Some(key_id)) => EncryptionSpec::pgp(key_id),
            (EncryptionType::PgpKey, None) => {
                warn!("PGP protection selected without a key id, using built-in encryption");
                EncryptionSpec::built_in()
            }
            (EncryptionType::OsWrapped, _) => EncryptionSpec::os_wrapped(),
            (EncryptionType::BuiltIn, _) => EncryptionSpec::built_in(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-user data directory, e.g. `~/.local/share/credstore` on Linux
pub fn default_data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "symbia-labs", "credstore").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Settings manager
pub struct SettingsManager {
    settings_file: PathBuf,
    settings: Settings,
}

impl SettingsManager {
    /// Create a new settings manager
    pub fn new(storage_dir: &Path) -> Self {
        let settings_file = storage_dir.join(SETTINGS_FILE_NAME);
        let settings = Self::load_from_file(&settings_file).unwrap_or_else(|e| {
            warn!("Cannot read settings from {:?}, using defaults: {}", settings_file, e);
            Settings::new()
        });

        Self {
            settings_file,
            settings,
        }
    }

    /// Load settings from file
    fn load_from_file(path: &Path) -> Result<Settings> {
        if !path.exists() {
            debug!("No settings file found, using defaults");
            return Ok(Settings::new());
        }

        let contents = std::fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&contents)?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn path(&self) -> &Path {
        &self.settings_file
    }

    /// Save settings to file
    pub async fn save(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.settings)?;

        if let Some(parent) = self.settings_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Write atomically using temp file
        let temp_path = self.settings_file.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, &self.settings_file).await?;

        debug!("Saved settings to {:?}", self.settings_file);
        Ok(())
    }

    /// Get current settings
    pub fn get(&self) -> &Settings {
        &self.settings
    }

    /// Get mutable settings
    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Update settings and save
    pub async fn update(&mut self, settings: Settings) -> Result<()> {
        self.settings = settings;
        self.save().await
    }

    /// Reset settings to defaults and delete settings file
    pub async fn reset(&mut self) -> Result<()> {
        self.settings = Settings::new();

        if self.settings_file.exists() {
            tokio::fs::remove_file(&self.settings_file).await?;
        }

        Ok(())
    }
}
