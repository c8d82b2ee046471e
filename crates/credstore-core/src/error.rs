//! Error types for credstore-core

use thiserror::Error;

/// Result type alias for credential store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Credential store error types
#[derive(Error, Debug)]
pub enum StoreError {
    /// The native backend could not be loaded (missing library, no session bus, ...).
    /// Triggers the permanent in-memory fallback.
    #[error("Native credential store is unavailable: {0}")]
    NativeUnavailable(String),

    #[error("Cannot encrypt: {0}")]
    EncryptionError(String),

    #[error("Cannot decrypt: {0}")]
    DecryptionError(String),

    #[error("Malformed encrypted envelope: {0}")]
    EnvelopeError(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationError(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Master key is not available")]
    MasterKeyMissing,

    #[error("Database is corrupted: {0}")]
    CorruptedDatabase(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Keychain error: {0}")]
    KeychainError(String),

    #[error("PGP error: {0}")]
    PgpError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether this error means the backend itself cannot be used at all
    pub fn is_native_unavailable(&self) -> bool {
        matches!(self, StoreError::NativeUnavailable(_))
    }
}
