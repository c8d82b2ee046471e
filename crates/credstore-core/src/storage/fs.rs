//! File helpers shared by the database and the master key file

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Write `bytes` to `path` via a temp file in the same directory and an atomic rename.
/// The file is readable by the owner only from the moment it is created.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = temp_path_for(path)?;
    // a leftover temp file would keep its old permissions
    remove_if_exists(&temp_path).await?;

    let mut file = owner_only_options().open(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    debug!("Wrote {} bytes to {:?}", bytes.len(), path);
    Ok(())
}

fn temp_path_for(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::StorageError(format!("Not a file path: {:?}", path)))?;
    let mut temp_name = file_name.to_os_string();
    temp_name.push(".tmp");
    Ok(path.with_file_name(temp_name))
}

fn owner_only_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options
}

/// Move an unreadable file aside as `corrupted.<name>`, replacing an older one
pub(crate) async fn rename_corrupted(path: &Path) -> Option<PathBuf> {
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    let target = path.with_file_name(format!("corrupted.{}", file_name));

    match tokio::fs::rename(path, &target).await {
        Ok(()) => {
            warn!("Moved unreadable file {:?} to {:?}", path, target);
            Some(target)
        }
        Err(e) => {
            warn!("Cannot move unreadable file {:?} aside: {}", path, e);
            None
        }
    }
}

/// Remove a file, treating "already gone" as success
pub(crate) async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
