//! Master key file persistence
//!
//! The master key is stored next to the database, protected by the built-in
//! envelope, the OS wrap or a PGP key. It is never encrypted with itself.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use super::fs::{remove_if_exists, rename_corrupted, write_atomic};
use crate::crypto::{create_encryption_support, CryptoProviders, EncryptionSpec, MasterKey};
use crate::error::{Result, StoreError};

const KEY_FILE_VERSION: u32 = 1;

/// On-disk format of the master key file
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MasterKeyFile {
    version: u32,
    encryption: EncryptionSpec,
    /// base64 of the encrypted key
    value: String,
}

/// Persists the single master key of a credential database
pub struct MasterKeyStorage {
    path: PathBuf,
    providers: CryptoProviders,
}

impl MasterKeyStorage {
    pub fn new(path: impl Into<PathBuf>, providers: CryptoProviders) -> Self {
        Self {
            path: path.into(),
            providers,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the master key
    ///
    /// Returns `None` for a missing or unreadable file so the caller can
    /// regenerate; the reason is logged.
    pub async fn get(&self) -> Option<MasterKey> {
        match self.try_get().await {
            Ok(key) => key,
            Err(e) => {
                warn!("Cannot load master key from {:?}: {}", self.path, e);
                None
            }
        }
    }

    async fn try_get(&self) -> Result<Option<MasterKey>> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No master key file at {:?}", self.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let file: MasterKeyFile = serde_json::from_slice(&contents)?;
        if file.version != KEY_FILE_VERSION {
            return Err(StoreError::StorageError(format!(
                "Unsupported master key file version {}",
                file.version
            )));
        }

        let mut encrypted = BASE64
            .decode(file.value.as_bytes())
            .map_err(|e| StoreError::DecryptionError(format!("Invalid base64: {}", e)))?;

        let encryption = create_encryption_support(&file.encryption, &self.providers)?;
        let key = encryption.decrypt(&encrypted)?;
        encrypted.zeroize();

        if key.is_empty() {
            return Err(StoreError::DecryptionError("Master key is empty".to_string()));
        }

        debug!("Loaded master key ({:?})", file.encryption.kind);
        Ok(Some(MasterKey::new(key)))
    }

    /// Protection recorded in the key file, without decrypting it
    pub async fn encryption(&self) -> Option<EncryptionSpec> {
        let contents = tokio::fs::read(&self.path).await.ok()?;
        let file: MasterKeyFile = serde_json::from_slice(&contents).ok()?;
        Some(file.encryption)
    }

    /// Keep an unreadable key file as `corrupted.<name>` so a new key never overwrites it
    pub async fn move_aside(&self) -> Option<PathBuf> {
        if !self.exists() {
            return None;
        }
        rename_corrupted(&self.path).await
    }

    /// Store the master key with the given protection, or delete the file when `None`
    pub async fn set(&self, key: Option<&MasterKey>, encryption: &EncryptionSpec) -> Result<()> {
        let Some(key) = key else {
            remove_if_exists(&self.path).await?;
            info!("Deleted master key file {:?}", self.path);
            return Ok(());
        };

        let support = create_encryption_support(encryption, &self.providers)?;
        let mut encrypted = support.encrypt(key.as_bytes())?;

        let file = MasterKeyFile {
            version: KEY_FILE_VERSION,
            encryption: encryption.clone(),
            value: BASE64.encode(&encrypted),
        };
        encrypted.zeroize();

        let contents = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &contents).await?;

        info!("Saved master key ({:?}) to {:?}", encryption.kind, self.path);
        Ok(())
    }
}
