//! OS Keychain storage backend
//!
//! Uses the system keychain through `keyring`:
//! - macOS: Keychain
//! - Windows: Credential Manager
//! - Linux: Secret Service (GNOME Keyring, KWallet)
//!
//! Keyring calls block (and may show a permission prompt), so they run on the
//! blocking thread pool.

use std::sync::Arc;

use async_trait::async_trait;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CredentialStore;
use crate::credential::{CredentialAttributes, Credentials, Lookup, SERVICE_NAME_PREFIX};
use crate::crypto::SecretString;
use crate::error::{Result, StoreError};

/// Constructor that returns a store only if its native backend works here
pub type NativeProbe = fn() -> Option<Arc<dyn CredentialStore>>;

/// Native backends in priority order
pub fn default_native_probes() -> Vec<NativeProbe> {
    vec![keyring_probe]
}

/// Probe the platform keychain with a harmless read
pub fn keyring_probe() -> Option<Arc<dyn CredentialStore>> {
    let entry = match Entry::new(SERVICE_NAME_PREFIX, "__probe__") {
        Ok(entry) => entry,
        Err(e) => {
            debug!("Keychain probe failed: {}", e);
            return None;
        }
    };

    match entry.get_password() {
        Ok(_) | Err(keyring::Error::NoEntry) | Err(keyring::Error::NoStorageAccess(_)) => {
            debug!("Keychain storage is available");
            Some(Arc::new(KeychainCredentialStore::new()))
        }
        Err(e) => {
            warn!("Keychain storage is not available: {}", e);
            None
        }
    }
}

/// Secret payload kept in the keychain password field
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSecret {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    password: Option<SecretString>,
}

/// OS Keychain storage backend
#[derive(Debug, Default)]
pub struct KeychainCredentialStore;

impl KeychainCredentialStore {
    pub fn new() -> Self {
        Self
    }
}

/// Keychain (service, account) for `attributes`; the account falls back to the service name
fn keychain_key(attributes: &CredentialAttributes) -> (String, String) {
    let account = attributes
        .user_name()
        .unwrap_or(&attributes.service_name)
        .to_string();
    (attributes.service_name.clone(), account)
}

/// Run a keyring call on the blocking pool
async fn run_blocking<T, F>(call: F) -> Result<keyring::Result<T>>
where
    F: FnOnce() -> keyring::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| StoreError::KeychainError(format!("Keychain task failed: {}", e)))
}

fn map_keyring_error(error: keyring::Error) -> StoreError {
    match error {
        keyring::Error::PlatformFailure(e) => StoreError::NativeUnavailable(e.to_string()),
        other => StoreError::KeychainError(other.to_string()),
    }
}

/// Decode the stored payload; a plain string written by another tool is the password
fn decode_secret(stored: &str, attributes: &CredentialAttributes) -> Credentials {
    match serde_json::from_str::<StoredSecret>(stored) {
        Ok(secret) => Credentials {
            user_name: secret.user_name.or_else(|| attributes.user_name.clone()),
            password: secret.password,
        },
        Err(_) => Credentials {
            user_name: attributes.user_name.clone(),
            password: Some(SecretString::new(stored)),
        },
    }
}

fn encode_secret(credentials: Credentials) -> Result<String> {
    let secret = StoredSecret {
        user_name: credentials.user_name,
        password: credentials.password,
    };
    Ok(serde_json::to_string(&secret)?)
}

#[async_trait]
impl CredentialStore for KeychainCredentialStore {
    async fn get(&self, attributes: &CredentialAttributes) -> Result<Lookup> {
        let (service, account) = keychain_key(attributes);

        let result = run_blocking(move || Entry::new(&service, &account)?.get_password()).await?;

        match result {
            Ok(stored) => {
                debug!("Retrieved credentials from keychain: {}", attributes.service_name);
                Ok(Lookup::Found(decode_secret(&stored, attributes)))
            }
            Err(keyring::Error::NoEntry) => Ok(Lookup::Absent),
            Err(keyring::Error::NoStorageAccess(e)) => {
                debug!("Keychain access denied for {}: {}", attributes.service_name, e);
                Ok(Lookup::Denied)
            }
            Err(e) => Err(map_keyring_error(e)),
        }
    }

    async fn set(
        &self,
        attributes: &CredentialAttributes,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let (service, account) = keychain_key(attributes);

        let Some(credentials) = credentials else {
            let result =
                run_blocking(move || Entry::new(&service, &account)?.delete_password()).await?;
            return match result {
                Ok(()) | Err(keyring::Error::NoEntry) => {
                    debug!("Deleted credentials from keychain: {}", attributes.service_name);
                    Ok(())
                }
                Err(e) => Err(map_keyring_error(e)),
            };
        };

        let encoded = encode_secret(credentials)?;
        run_blocking(move || Entry::new(&service, &account)?.set_password(&encoded))
            .await?
            .map_err(map_keyring_error)?;

        debug!("Stored credentials in keychain: {}", attributes.service_name);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        #[cfg(target_os = "macos")]
        return "macOS Keychain";

        #[cfg(target_os = "windows")]
        return "Windows Credential Manager";

        #[cfg(target_os = "linux")]
        return "Linux Secret Service";

        #[cfg(not(any(target_os = "macos", target_os = "windows", target_os = "linux")))]
        return "System Keychain";
    }
}
