//! # credstore-core
//!
//! Credential storage orchestration:
//! - Encrypted database file (AES-256-GCM, Argon2id) with a separately protected master key
//! - OS keychain behind a non-blocking, failure-tolerant write queue
//! - In-memory storage for memory-only secrets and as the last resort
//! - A facade that switches between backends from settings

pub mod credential;
pub mod crypto;
pub mod error;
pub mod notify;
pub mod settings;
pub mod storage;
mod service;

pub use credential::{
    generate_service_name, legacy_attributes, CredentialAttributes, Credentials, Lookup,
    SERVICE_NAME_PREFIX,
};
pub use crypto::{
    create_encryption_support, CryptoProviders, EncryptionSpec, EncryptionSupport,
    EncryptionType, GpgEngine, MasterKey, OsProtector, PgpEngine, PgpKey,
};
pub use error::{Result, StoreError};
pub use notify::{Notifier, TracingNotifier};
pub use service::{CredentialService, ServiceOptions, DEFAULT_DATABASE_FILE_NAME};
pub use settings::{default_data_dir, ProviderType, Settings, SettingsManager};
pub use storage::{
    CredentialStore, DatabaseCredentialStore, InMemoryCredentialStore, KeychainCredentialStore,
    MasterKeyStorage, ResilientCredentialStore,
};
