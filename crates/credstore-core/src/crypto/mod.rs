//! Cryptographic primitives for credential storage
//!
//! This module provides:
//! - Envelope encryption (built-in AES-CBC, OS-wrapped, PGP) for the master key
//! - AES-256-GCM sealing of the credential database
//! - Argon2id derivation of the database key from the master key
//! - Secure memory handling with zeroize

mod encryption;
pub mod envelope;
mod key_derivation;
pub mod pgp;
mod secure_memory;

pub use encryption::{open, seal, SealedData};
pub use envelope::{
    create_encryption_support, BuiltInEncryption, CryptoProviders, EncryptionSpec,
    EncryptionSupport, EncryptionType, OsProtector, OsWrappedEncryption, PgpEncryption,
};
pub use key_derivation::{derive_cipher_key, generate_salt, KeyDerivationParams};
pub use pgp::{GpgEngine, PgpEngine, PgpKey};
pub use secure_memory::{CipherKey, MasterKey, SecretString, MASTER_KEY_LEN};

#[cfg(test)]
pub(crate) use key_derivation::fast_params;
