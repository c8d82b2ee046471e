//! Database key derivation using Argon2id
//!
//! The master key is random, but the database cipher key is still run through
//! a KDF so the container carries its own salt and cost parameters.

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Algorithm, Argon2, Params, Version,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use super::{CipherKey, MasterKey};
use crate::error::{Result, StoreError};

/// Parameters for Argon2id key derivation, persisted in the database header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDerivationParams {
    /// Memory cost in KiB (default: 19456 = 19MB)
    pub memory_cost: u32,
    /// Time cost / iterations (default: 2)
    pub time_cost: u32,
    /// Parallelism (default: 1)
    pub parallelism: u32,
}

impl Default for KeyDerivationParams {
    fn default() -> Self {
        Self {
            memory_cost: 19456,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Generate a cryptographically secure random salt
pub fn generate_salt() -> String {
    SaltString::generate(&mut OsRng).to_string()
}

/// Derive the 256-bit database cipher key from the master key
///
/// # Arguments
/// * `master_key` - The stored master key
/// * `salt` - A salt string (use `generate_salt()` to create one)
/// * `params` - Argon2id cost parameters
pub fn derive_cipher_key(
    master_key: &MasterKey,
    salt: &str,
    params: &KeyDerivationParams,
) -> Result<CipherKey> {
    if master_key.is_empty() {
        return Err(StoreError::KeyDerivationError(
            "Master key is empty".to_string(),
        ));
    }

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| StoreError::KeyDerivationError(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let salt = SaltString::from_b64(salt)
        .map_err(|e| StoreError::KeyDerivationError(format!("Invalid salt: {}", e)))?;

    let password_hash = argon2
        .hash_password(master_key.as_bytes(), &salt)
        .map_err(|e| StoreError::KeyDerivationError(e.to_string()))?;

    let hash = password_hash
        .hash
        .ok_or_else(|| StoreError::KeyDerivationError("No hash output".to_string()))?;

    let hash_bytes = hash.as_bytes();
    if hash_bytes.len() < 32 {
        return Err(StoreError::KeyDerivationError(
            "Hash output too short".to_string(),
        ));
    }

    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(&hash_bytes[..32]);

    Ok(CipherKey::new(key_bytes))
}

#[cfg(test)]
pub(crate) fn fast_params() -> KeyDerivationParams {
    KeyDerivationParams {
        memory_cost: 8192,
        time_cost: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        let master = MasterKey::new(b"master-key-material".to_vec());
        let salt = generate_salt();

        let key1 = derive_cipher_key(&master, &salt, &fast_params()).unwrap();
        let key2 = derive_cipher_key(&master, &salt, &fast_params()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_different_master_keys_differ() {
        let salt = generate_salt();

        let key1 = derive_cipher_key(&MasterKey::generate(), &salt, &fast_params()).unwrap();
        let key2 = derive_cipher_key(&MasterKey::generate(), &salt, &fast_params()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_empty_master_key_rejected() {
        let result = derive_cipher_key(&MasterKey::new(Vec::new()), &generate_salt(), &fast_params());
        assert!(matches!(result, Err(StoreError::KeyDerivationError(_))));
    }

    #[test]
    fn test_invalid_salt_rejected() {
        let result = derive_cipher_key(&MasterKey::generate(), "not a salt!", &fast_params());
        assert!(result.is_err());
    }
}
