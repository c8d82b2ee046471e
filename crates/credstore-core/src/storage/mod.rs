//! Storage backends for credential persistence
//!
//! - Encrypted database file, protected by a separately stored master key
//! - OS keychain, wrapped in a resilience layer with in-memory fallback
//! - Plain in-memory storage

mod database;
mod fs;
mod keychain;
mod master_key;
mod memory;
mod resilient;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use database::{Database, DatabaseCredentialStore, DatabaseOptions, Entry, Group, ROOT_GROUP_NAME};
pub use keychain::{default_native_probes, keyring_probe, KeychainCredentialStore, NativeProbe};
pub use master_key::MasterKeyStorage;
pub use memory::InMemoryCredentialStore;
pub use resilient::{BackendState, ResilientCredentialStore, DENIED_ITEMS_TTL};
pub use traits::CredentialStore;
