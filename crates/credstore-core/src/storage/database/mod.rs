//! Encrypted database storage backend
//!
//! Keeps every credential in an in-process database that is persisted as a
//! single encrypted file. The file is sealed with AES-256-GCM under a key
//! derived from the master key; the master key itself lives in a separate
//! file managed by `MasterKeyStorage`.

mod model;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

pub use model::{Database, Entry, Group, ROOT_GROUP_NAME};

use super::fs::{remove_if_exists, rename_corrupted, write_atomic};
use super::{CredentialStore, MasterKeyStorage};
use crate::credential::{CredentialAttributes, Credentials, Lookup, SERVICE_NAME_PREFIX};
use crate::crypto::{
    derive_cipher_key, generate_salt, open, seal, EncryptionSpec, KeyDerivationParams, MasterKey,
    SealedData,
};
use crate::error::{Result, StoreError};
use crate::notify::{Notifier, TracingNotifier};

const DATABASE_FILE_VERSION: u32 = 1;

/// File format for the persisted database
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseFile {
    version: u32,
    kdf: KdfHeader,
    /// base64 sealed JSON of `Database`
    payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KdfHeader {
    salt: String,
    #[serde(flatten)]
    params: KeyDerivationParams,
}

impl KdfHeader {
    /// Header bytes authenticated together with the payload
    fn associated_data(&self, version: u32) -> Vec<u8> {
        format!(
            "credstore-db:v{}:{}:{}:{}:{}",
            version,
            self.salt,
            self.params.memory_cost,
            self.params.time_cost,
            self.params.parallelism
        )
        .into_bytes()
    }
}

/// Tuning for a database store
#[derive(Clone)]
pub struct DatabaseOptions {
    /// Cost parameters used when writing the file
    pub kdf_params: KeyDerivationParams,
    pub notifier: Arc<dyn Notifier>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            kdf_params: KeyDerivationParams::default(),
            notifier: Arc::new(TracingNotifier),
        }
    }
}

/// Mutable state, guarded by one coarse lock
struct DatabaseState {
    db: Database,
    master_key: Option<MasterKey>,
    /// Set by every mutation, cleared by a successful save
    dirty: bool,
    /// Save even when not dirty (fresh key, recovered from corruption)
    needs_save: bool,
}

impl DatabaseState {
    fn empty() -> Self {
        Self {
            db: Database::default(),
            master_key: None,
            dirty: false,
            needs_save: false,
        }
    }
}

/// Encrypted database credential store
pub struct DatabaseCredentialStore {
    /// `None` for a memory-only database that is never written
    db_path: Option<PathBuf>,
    master_key_storage: Option<MasterKeyStorage>,
    state: Mutex<DatabaseState>,
    options: DatabaseOptions,
}

impl DatabaseCredentialStore {
    /// Open the database at `db_path`, starting empty if it is missing or unreadable
    pub async fn open(
        db_path: impl Into<PathBuf>,
        master_key_storage: MasterKeyStorage,
        options: DatabaseOptions,
    ) -> Self {
        let db_path = db_path.into();
        let state = Self::load(&db_path, &master_key_storage, &options).await;

        Self {
            db_path: Some(db_path),
            master_key_storage: Some(master_key_storage),
            state: Mutex::new(state),
            options,
        }
    }

    /// Database that lives only in memory; `save` is a no-op
    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            master_key_storage: None,
            state: Mutex::new(DatabaseState::empty()),
            options: DatabaseOptions::default(),
        }
    }

    async fn load(
        db_path: &Path,
        master_key_storage: &MasterKeyStorage,
        options: &DatabaseOptions,
    ) -> DatabaseState {
        if !db_path.exists() {
            debug!("No credential database at {:?}, starting empty", db_path);
            return DatabaseState::empty();
        }

        let master_key = master_key_storage.get().await;
        let result = match master_key.as_ref() {
            Some(key) => read_database(db_path, key).await,
            None => Err(StoreError::MasterKeyMissing),
        };

        match result {
            Ok(db) => {
                let count = db.group(ROOT_GROUP_NAME).map_or(0, |g| g.entries.len());
                info!("Loaded {} credentials from {:?}", count, db_path);
                DatabaseState {
                    db,
                    master_key,
                    dirty: false,
                    needs_save: false,
                }
            }
            Err(e) => {
                error!("Cannot read credential database {:?}: {}", db_path, e);
                let moved = rename_corrupted(db_path).await;
                // the kept database is only readable with the key that could not be loaded now
                let moved_key = match master_key {
                    Some(_) => None,
                    None => master_key_storage.move_aside().await,
                };

                let mut message =
                    "Stored passwords could not be read and will be re-created.".to_string();
                if let Some(path) = moved {
                    message.push_str(&format!(" The old file was kept as {:?}.", path));
                }
                if let Some(path) = moved_key {
                    message.push_str(&format!(" Its master key was kept as {:?}.", path));
                }
                options
                    .notifier
                    .notify("Credential database is corrupted", &message);
                DatabaseState {
                    db: Database::default(),
                    master_key,
                    dirty: false,
                    needs_save: true,
                }
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub fn is_memory_only(&self) -> bool {
        self.db_path.is_none()
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.lock().await.dirty
    }

    pub async fn entry_count(&self) -> usize {
        self.state
            .lock()
            .await
            .db
            .group(ROOT_GROUP_NAME)
            .map_or(0, |group| group.entries.len())
    }

    /// Persist the database if it changed
    ///
    /// Errors are logged, not returned; the store stays dirty so the next call
    /// retries. Returns whether the file was written.
    pub async fn save(&self, encryption: &EncryptionSpec) -> bool {
        let mut state = self.state.lock().await;
        match self.save_locked(&mut state, encryption).await {
            Ok(written) => written,
            Err(e) => {
                error!("Cannot save credential database {:?}: {}", self.db_path, e);
                state.dirty = true;
                false
            }
        }
    }

    async fn save_locked(
        &self,
        state: &mut DatabaseState,
        encryption: &EncryptionSpec,
    ) -> Result<bool> {
        let (Some(db_path), Some(master_key_storage)) =
            (self.db_path.as_deref(), self.master_key_storage.as_ref())
        else {
            return Ok(false);
        };

        if let Some(key) = state.master_key.as_ref() {
            sync_key_file(master_key_storage, key, encryption).await?;
        }

        if !state.dirty && !state.needs_save {
            return Ok(false);
        }

        let master_key = match state.master_key.clone() {
            Some(key) => key,
            None => {
                let key = match master_key_storage.get().await {
                    Some(key) => {
                        sync_key_file(master_key_storage, &key, encryption).await?;
                        key
                    }
                    None => {
                        if let Some(path) = master_key_storage.move_aside().await {
                            warn!("Kept unreadable master key as {:?}", path);
                        }
                        info!("Generating new master key");
                        let key = MasterKey::generate();
                        master_key_storage.set(Some(&key), encryption).await?;
                        key
                    }
                };
                state.master_key = Some(key.clone());
                key
            }
        };

        write_database(db_path, &state.db, &master_key, &self.options.kdf_params).await?;

        state.dirty = false;
        state.needs_save = false;
        Ok(true)
    }

    /// Remove every credential
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        if let Some(group) = state.db.group_mut(ROOT_GROUP_NAME) {
            group.entries.clear();
        }
        state.dirty = true;
        info!("Cleared credential database");
    }

    /// Replace the master key and rewrite the whole database under it
    pub async fn change_master_key(
        &self,
        new_key: MasterKey,
        encryption: &EncryptionSpec,
    ) -> Result<()> {
        let master_key_storage = self.master_key_storage.as_ref().ok_or_else(|| {
            StoreError::ConfigurationError("Memory-only database has no master key".to_string())
        })?;

        let mut state = self.state.lock().await;
        let previous = state.master_key.take();

        master_key_storage.set(Some(&new_key), encryption).await?;
        state.master_key = Some(new_key);
        state.needs_save = true;

        if let Err(e) = self.save_locked(&mut state, encryption).await {
            error!("Cannot rewrite database with the new master key: {}", e);
            if let Some(previous) = previous {
                if let Err(restore) = master_key_storage.set(Some(&previous), encryption).await {
                    error!("Cannot restore previous master key: {}", restore);
                }
                state.master_key = Some(previous);
            }
            state.dirty = true;
            return Err(e);
        }

        info!("Master key changed");
        Ok(())
    }

    /// Rewrite the master key file with a different protection
    ///
    /// Without a key yet, the next `save` writes it with `encryption` anyway.
    pub async fn set_master_key_encryption(&self, encryption: &EncryptionSpec) -> Result<()> {
        let Some(master_key_storage) = self.master_key_storage.as_ref() else {
            return Ok(());
        };

        let mut state = self.state.lock().await;
        if state.master_key.is_none() {
            state.master_key = master_key_storage.get().await;
        }

        if let Some(key) = state.master_key.as_ref() {
            master_key_storage.set(Some(key), encryption).await?;
            info!("Master key protection changed to {:?}", encryption.kind);
        }
        Ok(())
    }

    /// Copy every stored credential into `target`
    pub async fn copy_to(&self, target: &dyn CredentialStore) -> Result<usize> {
        let entries: Vec<Entry> = {
            let state = self.state.lock().await;
            state
                .db
                .group(ROOT_GROUP_NAME)
                .map(|group| group.entries.clone())
                .unwrap_or_default()
        };

        for entry in &entries {
            let attributes = CredentialAttributes::new(entry.title.as_str(), entry.user_name.as_deref());
            let credentials = Credentials {
                user_name: entry.user_name.clone(),
                password: entry.password.clone(),
            };
            target.set(&attributes, Some(credentials)).await?;
        }

        info!("Copied {} credentials to {}", entries.len(), target.backend_name());
        Ok(entries.len())
    }

    /// Delete the database and master key files and forget the key
    pub async fn delete_storage(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(db_path) = self.db_path.as_deref() {
            remove_if_exists(db_path).await?;
        }
        if let Some(master_key_storage) = self.master_key_storage.as_ref() {
            master_key_storage.set(None, &EncryptionSpec::default()).await?;
        }

        *state = DatabaseState::empty();
        info!("Deleted credential database storage");
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for DatabaseCredentialStore {
    async fn get(&self, attributes: &CredentialAttributes) -> Result<Lookup> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state
            .db
            .group(ROOT_GROUP_NAME)
            .and_then(|group| group.find(&attributes.service_name, attributes.user_name()))
        {
            return Ok(Lookup::Found(entry.to_credentials()));
        }

        let Some(legacy) = attributes.legacy_attributes() else {
            return Ok(Lookup::Absent);
        };

        let Some(old) = state
            .db
            .group_mut(ROOT_GROUP_NAME)
            .and_then(|group| group.remove(&legacy.service_name, legacy.user_name()))
        else {
            return Ok(Lookup::Absent);
        };

        let password = if attributes.is_password_memory_only {
            None
        } else {
            old.password.clone()
        };
        let entry = state
            .db
            .group_or_create(ROOT_GROUP_NAME)
            .find_or_add(&attributes.service_name, None);
        entry.user_name = attributes.user_name.clone();
        entry.password = password;
        entry.touch();
        state.dirty = true;

        info!("Migrated legacy credential entry for {}", attributes.service_name);
        Ok(Lookup::Found(Credentials {
            user_name: attributes.user_name.clone(),
            password: old.password.clone(),
        }))
    }

    async fn set(
        &self,
        attributes: &CredentialAttributes,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;

        let Some(credentials) = credentials else {
            let removed = state
                .db
                .group_mut(ROOT_GROUP_NAME)
                .and_then(|group| group.remove(&attributes.service_name, attributes.user_name()));
            if removed.is_some() {
                state.dirty = true;
                debug!("Removed credentials for {}", attributes.service_name);
            }
            return Ok(());
        };

        // one live entry per service, except under our own prefix where the user name is the key
        let is_own_service = attributes.service_name == SERVICE_NAME_PREFIX;
        let identity_user = if is_own_service {
            attributes.user_name()
        } else {
            None
        };

        let entry = state
            .db
            .group_or_create(ROOT_GROUP_NAME)
            .find_or_add(&attributes.service_name, identity_user);

        entry.user_name = if is_own_service {
            attributes.user_name.clone()
        } else {
            credentials
                .user_name
                .clone()
                .or_else(|| attributes.user_name.clone())
        };
        entry.password = if attributes.is_password_memory_only || !credentials.has_password() {
            None
        } else {
            credentials.password.clone()
        };
        entry.touch();
        state.dirty = true;

        debug!("Stored credentials for {}", attributes.service_name);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "Encrypted Database"
    }
}

/// Make the key file hold `key` under the configured protection
///
/// A missing file must be written again; a failed re-protection leaves the
/// old, still readable file in place.
async fn sync_key_file(
    master_key_storage: &MasterKeyStorage,
    key: &MasterKey,
    encryption: &EncryptionSpec,
) -> Result<()> {
    match master_key_storage.encryption().await {
        Some(recorded) if recorded == *encryption => Ok(()),
        Some(recorded) => {
            info!(
                "Master key protection changed from {:?} to {:?}",
                recorded.kind, encryption.kind
            );
            if let Err(e) = master_key_storage.set(Some(key), encryption).await {
                warn!("Cannot re-protect the master key, keeping {:?}: {}", recorded.kind, e);
            }
            Ok(())
        }
        None => {
            warn!("Master key file is missing, writing it again");
            master_key_storage.set(Some(key), encryption).await
        }
    }
}

/// Read and decrypt the database file with `master_key`
async fn read_database(path: &Path, master_key: &MasterKey) -> Result<Database> {
    let contents = tokio::fs::read(path).await?;
    let file: DatabaseFile = serde_json::from_slice(&contents)
        .map_err(|e| StoreError::CorruptedDatabase(format!("Invalid container: {}", e)))?;

    if file.version != DATABASE_FILE_VERSION {
        return Err(StoreError::CorruptedDatabase(format!(
            "Unsupported database version {}",
            file.version
        )));
    }

    let cipher_key = derive_cipher_key(master_key, &file.kdf.salt, &file.kdf.params)?;
    let sealed = SealedData::from_base64(&file.payload)?;
    let mut plaintext = open(&sealed, &cipher_key, &file.kdf.associated_data(file.version))?;

    let db = serde_json::from_slice(&plaintext)
        .map_err(|e| StoreError::CorruptedDatabase(format!("Invalid database content: {}", e)));
    plaintext.zeroize();
    db
}

/// Encrypt and atomically write the database file
async fn write_database(
    path: &Path,
    db: &Database,
    master_key: &MasterKey,
    params: &KeyDerivationParams,
) -> Result<()> {
    let kdf = KdfHeader {
        salt: generate_salt(),
        params: params.clone(),
    };
    let cipher_key = derive_cipher_key(master_key, &kdf.salt, &kdf.params)?;

    let mut plaintext = serde_json::to_vec(db)?;
    let sealed = seal(&plaintext, &cipher_key, &kdf.associated_data(DATABASE_FILE_VERSION));
    plaintext.zeroize();

    let file = DatabaseFile {
        version: DATABASE_FILE_VERSION,
        kdf,
        payload: sealed?.to_base64(),
    };
    let contents = serde_json::to_vec_pretty(&file)?;
    write_atomic(path, &contents).await?;

    info!("Saved credential database to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::legacy_attributes;
    use crate::crypto::{fast_params, CryptoProviders};
    use crate::notify::testing::RecordingNotifier;
    use crate::storage::InMemoryCredentialStore;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        notifier: Arc<RecordingNotifier>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                temp_dir: TempDir::new().unwrap(),
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn db_path(&self) -> PathBuf {
            self.temp_dir.path().join("credentials.db")
        }

        fn key_storage(&self) -> MasterKeyStorage {
            MasterKeyStorage::new(
                self.temp_dir.path().join("credentials.key"),
                CryptoProviders::built_in_only(),
            )
        }

        async fn open(&self) -> DatabaseCredentialStore {
            self.open_with(CryptoProviders::built_in_only()).await
        }

        async fn open_with(&self, providers: CryptoProviders) -> DatabaseCredentialStore {
            DatabaseCredentialStore::open(
                self.db_path(),
                MasterKeyStorage::new(self.temp_dir.path().join("credentials.key"), providers),
                DatabaseOptions {
                    kdf_params: fast_params(),
                    notifier: self.notifier.clone(),
                },
            )
            .await
        }

        async fn read_file(&self) -> Database {
            let key = self.key_storage().get().await.unwrap();
            read_database(&self.db_path(), &key).await.unwrap()
        }
    }

    fn spec() -> EncryptionSpec {
        EncryptionSpec::built_in()
    }

    fn os_providers() -> CryptoProviders {
        CryptoProviders {
            os_protector: Some(Arc::new(crate::crypto::envelope::tests::XorProtector)),
            pgp: None,
        }
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let fixture = Fixture::new();
        let attributes = CredentialAttributes::new("github.com", Some("alice"));

        {
            let store = fixture.open().await;
            store
                .set(&attributes, Some(Credentials::new(Some("alice"), Some("p1"))))
                .await
                .unwrap();
            assert!(store.save(&spec()).await);
        }

        let store = fixture.open().await;
        let lookup = store.get(&attributes).await.unwrap();
        assert_eq!(lookup, Lookup::Found(Credentials::new(Some("alice"), Some("p1"))));
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let fixture = Fixture::new();
        let store = fixture.open().await;
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();

        assert!(store.save(&spec()).await);
        assert!(!store.is_dirty().await);
        assert!(!store.save(&spec()).await);
    }

    #[tokio::test]
    async fn test_failed_save_stays_dirty() {
        let fixture = Fixture::new();
        // a plain file where the database directory should be
        let blocker = fixture.temp_dir.path().join("data");
        std::fs::write(&blocker, b"").unwrap();

        let store = DatabaseCredentialStore::open(
            blocker.join("credentials.db"),
            fixture.key_storage(),
            DatabaseOptions {
                kdf_params: fast_params(),
                notifier: fixture.notifier.clone(),
            },
        )
        .await;
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();

        assert!(!store.save(&spec()).await);
        assert!(store.is_dirty().await);

        std::fs::remove_file(&blocker).unwrap();
        assert!(store.save(&spec()).await);
        assert!(!store.is_dirty().await);
    }

    #[tokio::test]
    async fn test_memory_only_password_never_persisted() {
        let fixture = Fixture::new();
        let store = fixture.open().await;
        let attributes = CredentialAttributes::new("github.com", Some("alice")).memory_only();

        store
            .set(&attributes, Some(Credentials::new(Some("alice"), Some("secret"))))
            .await
            .unwrap();
        assert!(store.save(&spec()).await);

        let db = fixture.read_file().await;
        let entry = db.group(ROOT_GROUP_NAME).unwrap().find("github.com", None).unwrap();
        assert_eq!(entry.user_name.as_deref(), Some("alice"));
        assert!(entry.password.is_none());

        let raw = std::fs::read_to_string(fixture.db_path()).unwrap();
        assert!(!raw.contains("secret"));
    }

    #[tokio::test]
    async fn test_missing_user_name_returns_first_service_entry() {
        let store = DatabaseCredentialStore::in_memory();
        store
            .set(
                &CredentialAttributes::new("x", Some("alice")),
                Some(Credentials::new(Some("alice"), Some("pw"))),
            )
            .await
            .unwrap();

        let lookup = store.get(&CredentialAttributes::new("x", None)).await.unwrap();
        assert_eq!(lookup, Lookup::Found(Credentials::new(Some("alice"), Some("pw"))));
    }

    #[tokio::test]
    async fn test_one_live_entry_per_service() {
        let store = DatabaseCredentialStore::in_memory();
        store
            .set(
                &CredentialAttributes::new("x", Some("alice")),
                Some(Credentials::new(Some("alice"), Some("one"))),
            )
            .await
            .unwrap();
        store
            .set(
                &CredentialAttributes::new("x", Some("bob")),
                Some(Credentials::new(Some("bob"), Some("two"))),
            )
            .await
            .unwrap();

        assert_eq!(store.entry_count().await, 1);
        assert_eq!(
            store.get(&CredentialAttributes::new("x", Some("alice"))).await.unwrap(),
            Lookup::Absent
        );
        assert!(store
            .get(&CredentialAttributes::new("x", Some("bob")))
            .await
            .unwrap()
            .has_password());
    }

    #[tokio::test]
    async fn test_user_name_is_identity_under_own_prefix() {
        let store = DatabaseCredentialStore::in_memory();
        for user in ["a", "b"] {
            store
                .set(
                    &CredentialAttributes::new(SERVICE_NAME_PREFIX, Some(user)),
                    Some(Credentials::new(Some(user), Some(user))),
                )
                .await
                .unwrap();
        }

        assert_eq!(store.entry_count().await, 2);
        let lookup = store
            .get(&CredentialAttributes::new(SERVICE_NAME_PREFIX, Some("b")))
            .await
            .unwrap();
        assert_eq!(lookup.credentials().unwrap().password(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let store = DatabaseCredentialStore::in_memory();
        let attributes = CredentialAttributes::new("x", Some("alice"));
        store
            .set(&attributes, Some(Credentials::new(Some("alice"), Some("pw"))))
            .await
            .unwrap();

        store.set(&attributes, None).await.unwrap();

        assert_eq!(store.get(&attributes).await.unwrap(), Lookup::Absent);
        assert_eq!(store.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_legacy_key_migration() {
        let store = DatabaseCredentialStore::in_memory();
        let legacy = legacy_attributes("GitHttpAuth", "alice");
        store
            .set(&legacy, Some(Credentials::new(None, Some("old-pw"))))
            .await
            .unwrap();

        let attributes = CredentialAttributes::new("github.com", Some("alice")).with_requestor("GitHttpAuth");
        let lookup = store.get(&attributes).await.unwrap();

        assert_eq!(lookup, Lookup::Found(Credentials::new(Some("alice"), Some("old-pw"))));
        assert_eq!(store.get(&legacy).await.unwrap(), Lookup::Absent);
        assert_eq!(store.entry_count().await, 1);

        // now served from the new key without a requestor
        let lookup = store
            .get(&CredentialAttributes::new("github.com", Some("alice")))
            .await
            .unwrap();
        assert_eq!(lookup.credentials().unwrap().password(), Some("old-pw"));
    }

    #[tokio::test]
    async fn test_clear_marks_dirty() {
        let fixture = Fixture::new();
        let store = fixture.open().await;
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();
        assert!(store.save(&spec()).await);

        store.clear().await;

        assert!(store.is_dirty().await);
        assert_eq!(store.entry_count().await, 0);
        assert!(store.save(&spec()).await);
        assert_eq!(fixture.open().await.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_corrupted_database_is_moved_aside() {
        let fixture = Fixture::new();
        fixture
            .key_storage()
            .set(Some(&MasterKey::generate()), &spec())
            .await
            .unwrap();
        std::fs::write(fixture.db_path(), b"definitely not a database").unwrap();

        let store = fixture.open().await;

        assert_eq!(store.entry_count().await, 0);
        assert!(fixture.temp_dir.path().join("corrupted.credentials.db").exists());
        assert_eq!(fixture.notifier.titles().len(), 1);

        // writes after recovery still persist
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();
        assert!(store.save(&spec()).await);
        assert_eq!(fixture.open().await.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_database_without_master_key_is_moved_aside() {
        let fixture = Fixture::new();
        {
            let store = fixture.open().await;
            store
                .set(
                    &CredentialAttributes::new("x", Some("u")),
                    Some(Credentials::new(Some("u"), Some("p"))),
                )
                .await
                .unwrap();
            assert!(store.save(&spec()).await);
        }
        std::fs::remove_file(fixture.key_storage().path()).unwrap();

        let store = fixture.open().await;

        assert_eq!(store.entry_count().await, 0);
        assert!(fixture.temp_dir.path().join("corrupted.credentials.db").exists());
    }

    #[tokio::test]
    async fn test_unreadable_master_key_is_kept_with_database() {
        let fixture = Fixture::new();
        let attributes = CredentialAttributes::new("x", Some("u"));
        {
            let store = fixture.open_with(os_providers()).await;
            store
                .set(&attributes, Some(Credentials::new(Some("u"), Some("p"))))
                .await
                .unwrap();
            assert!(store.save(&EncryptionSpec::os_wrapped()).await);
        }

        // no OS protector this time, so the key file cannot be decrypted
        let store = fixture.open().await;
        assert_eq!(store.entry_count().await, 0);
        store
            .set(
                &CredentialAttributes::new("y", Some("u")),
                Some(Credentials::new(Some("u"), Some("q"))),
            )
            .await
            .unwrap();
        assert!(store.save(&spec()).await);

        let kept_db = fixture.temp_dir.path().join("corrupted.credentials.db");
        let kept_key = fixture.temp_dir.path().join("corrupted.credentials.key");
        assert!(kept_db.exists());
        assert!(kept_key.exists());
        assert!(fixture.notifier.messages()[0].contains("corrupted.credentials.key"));

        // the kept pair still opens with the original protection
        let key = MasterKeyStorage::new(kept_key, os_providers())
            .get()
            .await
            .unwrap();
        let recovered = read_database(&kept_db, &key).await.unwrap();
        let entry = recovered.group(ROOT_GROUP_NAME).unwrap().find("x", Some("u")).unwrap();
        assert_eq!(entry.password.as_ref().map(|p| p.expose()), Some("p"));

        // the new database uses a fresh key
        assert_eq!(fixture.read_file().await.group(ROOT_GROUP_NAME).unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_save_applies_changed_key_protection() {
        let fixture = Fixture::new();
        let store = fixture.open_with(os_providers()).await;
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();
        assert!(store.save(&spec()).await);
        let key = fixture.key_storage().get().await.unwrap();

        // nothing to write, the key file is still re-protected
        assert!(!store.save(&EncryptionSpec::os_wrapped()).await);

        let key_storage = MasterKeyStorage::new(fixture.key_storage().path(), os_providers());
        assert_eq!(key_storage.encryption().await, Some(EncryptionSpec::os_wrapped()));
        assert_eq!(key_storage.get().await, Some(key));
        assert_eq!(fixture.open_with(os_providers()).await.entry_count().await, 1);
    }

    #[tokio::test]
    async fn test_unavailable_protection_keeps_old_key_file() {
        let fixture = Fixture::new();
        let store = fixture.open().await;
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();
        assert!(store.save(&spec()).await);

        store
            .set(
                &CredentialAttributes::new("y", Some("u")),
                Some(Credentials::new(Some("u"), Some("q"))),
            )
            .await
            .unwrap();
        // no OS protector: the database is still written, the key file stays built-in
        assert!(store.save(&EncryptionSpec::os_wrapped()).await);

        assert_eq!(fixture.key_storage().encryption().await, Some(spec()));
        assert_eq!(fixture.open().await.entry_count().await, 2);
    }

    #[tokio::test]
    async fn test_change_master_key_rewrites_database() {
        let fixture = Fixture::new();
        let attributes = CredentialAttributes::new("x", Some("u"));
        {
            let store = fixture.open().await;
            store
                .set(&attributes, Some(Credentials::new(Some("u"), Some("p"))))
                .await
                .unwrap();
            assert!(store.save(&spec()).await);

            let new_key = MasterKey::generate();
            store.change_master_key(new_key.clone(), &spec()).await.unwrap();
            assert_eq!(fixture.key_storage().get().await, Some(new_key));
        }

        let store = fixture.open().await;
        assert!(store.get(&attributes).await.unwrap().has_password());
    }

    #[tokio::test]
    async fn test_set_master_key_encryption_keeps_key() {
        use crate::crypto::envelope::tests::XorProtector;

        let fixture = Fixture::new();
        let providers = CryptoProviders {
            os_protector: Some(Arc::new(XorProtector)),
            pgp: None,
        };
        let key_path = fixture.temp_dir.path().join("credentials.key");
        let store = DatabaseCredentialStore::open(
            fixture.db_path(),
            MasterKeyStorage::new(key_path.clone(), providers.clone()),
            DatabaseOptions {
                kdf_params: fast_params(),
                notifier: fixture.notifier.clone(),
            },
        )
        .await;
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();
        assert!(store.save(&spec()).await);
        let before = fixture.key_storage().get().await.unwrap();

        store
            .set_master_key_encryption(&EncryptionSpec::os_wrapped())
            .await
            .unwrap();

        // the built-in only reader can no longer open it, the OS-aware one can
        assert!(fixture.key_storage().get().await.is_none());
        let reader = MasterKeyStorage::new(key_path, providers);
        assert_eq!(reader.get().await, Some(before));
    }

    #[tokio::test]
    async fn test_copy_to_other_store() {
        let store = DatabaseCredentialStore::in_memory();
        for service in ["a", "b"] {
            store
                .set(
                    &CredentialAttributes::new(service, Some("u")),
                    Some(Credentials::new(Some("u"), Some(service))),
                )
                .await
                .unwrap();
        }

        let target = InMemoryCredentialStore::new();
        assert_eq!(store.copy_to(&target).await.unwrap(), 2);

        let lookup = target.get(&CredentialAttributes::new("b", Some("u"))).await.unwrap();
        assert_eq!(lookup.credentials().unwrap().password(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_storage_removes_files() {
        let fixture = Fixture::new();
        let store = fixture.open().await;
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();
        assert!(store.save(&spec()).await);

        store.delete_storage().await.unwrap();

        assert!(!fixture.db_path().exists());
        assert!(!fixture.key_storage().exists());
        assert_eq!(store.entry_count().await, 0);
        assert!(!store.save(&spec()).await);
    }

    #[tokio::test]
    async fn test_in_memory_database_never_saves() {
        let store = DatabaseCredentialStore::in_memory();
        store
            .set(
                &CredentialAttributes::new("x", Some("u")),
                Some(Credentials::new(Some("u"), Some("p"))),
            )
            .await
            .unwrap();

        assert!(store.is_memory_only());
        assert!(!store.save(&spec()).await);
    }
}
