//! Credential service orchestration
//!
//! Picks the configured backend, keeps memory-only passwords out of it and
//! handles switching between backends at runtime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::credential::{CredentialAttributes, Credentials, Lookup};
use crate::crypto::{CryptoProviders, EncryptionSpec, KeyDerivationParams};
use crate::error::Result;
use crate::notify::{Notifier, TracingNotifier};
use crate::settings::{ProviderType, Settings};
use crate::storage::{
    default_native_probes, CredentialStore, DatabaseCredentialStore, DatabaseOptions,
    InMemoryCredentialStore, MasterKeyStorage, NativeProbe, ResilientCredentialStore,
};

/// Database file name inside the data directory
pub const DEFAULT_DATABASE_FILE_NAME: &str = "credentials.db";

/// Extension of the master key file kept next to the database
pub const MASTER_KEY_FILE_EXTENSION: &str = "key";

/// Collaborators and locations for a `CredentialService`
#[derive(Clone)]
pub struct ServiceOptions {
    /// Directory holding the default database and master key files
    pub data_dir: PathBuf,
    pub providers: CryptoProviders,
    pub notifier: Arc<dyn Notifier>,
    /// Native backends tried in order for `ProviderType::Keychain`
    pub native_probes: Vec<NativeProbe>,
    pub kdf_params: KeyDerivationParams,
}

impl ServiceOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            providers: CryptoProviders::default(),
            notifier: Arc::new(TracingNotifier),
            native_probes: default_native_probes(),
            kdf_params: KeyDerivationParams::default(),
        }
    }
}

/// The store serving requests, with handles to its layers
#[derive(Clone)]
struct ActiveStore {
    /// Entry point for `get`/`set`
    store: Arc<dyn CredentialStore>,
    /// Write queue to flush before saving
    wrapper: Option<Arc<ResilientCredentialStore>>,
    database: Option<Arc<DatabaseCredentialStore>>,
    /// Provider actually in use (keychain may have fallen back to the database)
    provider_type: ProviderType,
}

/// Front door for credential lookups and updates
///
/// `get` and `set` never fail; backend problems degrade to "no credentials".
pub struct CredentialService {
    options: ServiceOptions,
    settings: RwLock<Settings>,
    /// Lazily built from the settings
    current: Mutex<Option<ActiveStore>>,
    /// Passwords of entries flagged memory-only
    memory_only: OnceLock<InMemoryCredentialStore>,
}

impl CredentialService {
    pub fn new(settings: Settings, options: ServiceOptions) -> Self {
        Self {
            options,
            settings: RwLock::new(settings),
            current: Mutex::new(None),
            memory_only: OnceLock::new(),
        }
    }

    pub async fn settings(&self) -> Settings {
        self.settings.read().await.clone()
    }

    /// Database file used for `settings`
    pub fn database_path(&self, settings: &Settings) -> PathBuf {
        settings
            .database_path
            .clone()
            .unwrap_or_else(|| self.options.data_dir.join(DEFAULT_DATABASE_FILE_NAME))
    }

    /// Provider in use, after any fallback
    pub async fn provider_type(&self) -> ProviderType {
        self.active().await.provider_type
    }

    pub async fn backend_name(&self) -> &'static str {
        self.active().await.store.backend_name()
    }

    async fn active(&self) -> ActiveStore {
        let mut current = self.current.lock().await;
        if let Some(active) = current.as_ref() {
            return active.clone();
        }

        let settings = self.settings.read().await.clone();
        let active = self.create_store(&settings).await;
        info!("Using {} for credentials", active.store.backend_name());

        *current = Some(active.clone());
        active
    }

    async fn create_store(&self, settings: &Settings) -> ActiveStore {
        match settings.provider_type {
            ProviderType::MemoryOnly => ActiveStore {
                store: Arc::new(InMemoryCredentialStore::new()),
                wrapper: None,
                database: None,
                provider_type: ProviderType::MemoryOnly,
            },
            ProviderType::Keychain => match self.probe_native().await {
                Some(native) => {
                    let wrapper = Arc::new(ResilientCredentialStore::new(
                        native,
                        self.options.notifier.clone(),
                    ));
                    ActiveStore {
                        store: wrapper.clone(),
                        wrapper: Some(wrapper),
                        database: None,
                        provider_type: ProviderType::Keychain,
                    }
                }
                None => {
                    warn!("No native keychain is supported here, using the encrypted database");
                    self.options.notifier.notify(
                        "Keychain is not available",
                        "Passwords are stored in an encrypted database file instead.",
                    );
                    self.open_database(settings).await
                }
            },
            ProviderType::Database => self.open_database(settings).await,
        }
    }

    async fn probe_native(&self) -> Option<Arc<dyn CredentialStore>> {
        for probe in &self.options.native_probes {
            match tokio::task::spawn_blocking(*probe).await {
                Ok(Some(store)) => {
                    debug!("Native backend {} is supported", store.backend_name());
                    return Some(store);
                }
                Ok(None) => continue,
                Err(e) => warn!("Native backend probe failed: {}", e),
            }
        }
        None
    }

    async fn open_database(&self, settings: &Settings) -> ActiveStore {
        let db_path = self.database_path(settings);
        let key_path = db_path.with_extension(MASTER_KEY_FILE_EXTENSION);

        let database = Arc::new(
            DatabaseCredentialStore::open(
                db_path,
                MasterKeyStorage::new(key_path, self.options.providers.clone()),
                DatabaseOptions {
                    kdf_params: self.options.kdf_params.clone(),
                    notifier: self.options.notifier.clone(),
                },
            )
            .await,
        );
        let wrapper = Arc::new(ResilientCredentialStore::new(
            database.clone(),
            self.options.notifier.clone(),
        ));

        ActiveStore {
            store: wrapper.clone(),
            wrapper: Some(wrapper),
            database: Some(database),
            provider_type: ProviderType::Database,
        }
    }

    /// Look up credentials, consulting memory-only passwords when the backend has none
    pub async fn get(&self, attributes: &CredentialAttributes) -> Lookup {
        let active = self.active().await;
        let lookup = active.store.get(attributes).await.unwrap_or_else(|e| {
            warn!("Cannot read credentials for {}: {}", attributes.service_name, e);
            Lookup::Absent
        });

        if lookup.has_password() {
            return lookup;
        }

        if let Some(memory_only) = self.memory_only.get() {
            if let Ok(found @ Lookup::Found(_)) = memory_only.get(attributes).await {
                return found;
            }
        }
        lookup
    }

    /// Store credentials, or delete them when `None`
    pub async fn set(&self, attributes: &CredentialAttributes, credentials: Option<Credentials>) {
        let active = self.active().await;

        let persisted = match credentials.as_ref() {
            Some(credentials) if attributes.is_password_memory_only => {
                Some(credentials.without_password())
            }
            other => other.cloned(),
        };
        if let Err(e) = active.store.set(attributes, persisted.clone()).await {
            if self.was_replaced(&active).await {
                debug!("Store was replaced during a write, retrying {}", attributes.service_name);
                if let Err(e) = self.active().await.store.set(attributes, persisted).await {
                    warn!("Cannot store credentials for {}: {}", attributes.service_name, e);
                }
            } else {
                warn!("Cannot store credentials for {}: {}", attributes.service_name, e);
            }
        }

        let result = match credentials {
            Some(credentials) if attributes.is_password_memory_only => {
                self.memory_only
                    .get_or_init(InMemoryCredentialStore::new)
                    .set(attributes, Some(credentials))
                    .await
            }
            _ => match self.memory_only.get() {
                Some(memory_only) => memory_only.set(attributes, None).await,
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            warn!("Cannot update memory-only credentials: {}", e);
        }
    }

    /// Whether `update_settings` swapped out `active` since it was taken
    async fn was_replaced(&self, active: &ActiveStore) -> bool {
        match self.current.lock().await.as_ref() {
            Some(current) => !Arc::ptr_eq(&current.store, &active.store),
            None => true,
        }
    }

    /// Write pending changes to disk; returns whether a file was written
    pub async fn save(&self) -> bool {
        let Some(active) = self.current.lock().await.clone() else {
            return false;
        };
        let encryption = self.settings.read().await.encryption_spec();
        save_store(&active, &encryption).await
    }

    /// Apply new settings
    ///
    /// A change of provider, database file or master key protection closes
    /// the current store (saving it first if `save_previous`); the next call
    /// builds the new one. Moving the database to a new file copies the
    /// entries over when that file does not exist yet. A new master key
    /// protection is applied to the key file right away, or by the next save
    /// when no store was open.
    pub async fn update_settings(&self, settings: Settings, save_previous: bool) {
        let previous_settings = {
            let mut current_settings = self.settings.write().await;
            std::mem::replace(&mut *current_settings, settings.clone())
        };

        let store_changed = previous_settings.provider_type != settings.provider_type
            || self.database_path(&previous_settings) != self.database_path(&settings);
        let encryption_changed = previous_settings.encryption_spec() != settings.encryption_spec();

        if !store_changed && !encryption_changed {
            debug!("Storage settings unchanged");
            return;
        }

        let Some(previous) = self.current.lock().await.take() else {
            return;
        };
        let encryption = settings.encryption_spec();

        if encryption_changed {
            if let Some(database) = previous.database.as_ref() {
                if let Err(e) = database.set_master_key_encryption(&encryption).await {
                    warn!("Cannot re-protect the master key: {}", e);
                }
            }
        }
        if save_previous {
            save_store(&previous, &encryption).await;
        }

        let new_path = self.database_path(&settings);
        let move_database = settings.provider_type == ProviderType::Database
            && previous.provider_type == ProviderType::Database
            && store_changed
            && !new_path.exists();

        if move_database {
            if let Some(database) = previous.database.as_ref() {
                self.copy_database(database, &new_path).await;
            }
        }

        close_store(&previous).await;
        info!("Storage settings changed, closed {}", previous.store.backend_name());
    }

    async fn copy_database(&self, source: &DatabaseCredentialStore, new_path: &Path) {
        let active = self.active().await;
        let Some(target) = active.database.as_ref() else {
            return;
        };

        match source.copy_to(target.as_ref()).await {
            Ok(count) => {
                info!("Moved {} credentials to {:?}", count, new_path);
                let encryption = self.settings.read().await.encryption_spec();
                target.save(&encryption).await;
            }
            Err(e) => warn!("Cannot move credentials to {:?}: {}", new_path, e),
        }
    }

    /// Delete the database and master key files and forget every stored credential
    pub async fn clear_persistent_storage(&self) -> Result<()> {
        let active = self.active().await;
        if let Some(wrapper) = active.wrapper.as_ref() {
            wrapper.flush().await;
        }

        if let Some(memory_only) = self.memory_only.get() {
            memory_only.clear().await;
        }

        match active.database.as_ref() {
            Some(database) => database.delete_storage().await,
            None => {
                debug!("{} has no files to delete", active.store.backend_name());
                Ok(())
            }
        }
    }

    /// Save and release the current store
    pub async fn close(&self) {
        let Some(active) = self.current.lock().await.take() else {
            return;
        };
        let encryption = self.settings.read().await.encryption_spec();
        save_store(&active, &encryption).await;
        close_store(&active).await;
    }
}

async fn save_store(active: &ActiveStore, encryption: &EncryptionSpec) -> bool {
    if let Some(wrapper) = active.wrapper.as_ref() {
        wrapper.flush().await;
    }
    match active.database.as_ref() {
        Some(database) => database.save(encryption).await,
        None => false,
    }
}

async fn close_store(active: &ActiveStore) {
    if let Err(e) = active.store.close().await {
        warn!("Cannot close {}: {}", active.store.backend_name(), e);
    }
}
