//! Secure memory handling with automatic zeroization

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a freshly generated master key (512 bits)
pub const MASTER_KEY_LEN: usize = 64;

/// Master secret protecting the credential database - automatically zeroed when dropped
///
/// Never used directly as a cipher key: the database key is derived from it.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: Vec<u8>,
}

impl MasterKey {
    /// Create a master key from raw bytes
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Generate a new random master key using the OS random source
    pub fn generate() -> Self {
        let mut key = vec![0u8; MASTER_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Get the key bytes (use carefully - avoid copying)
    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// 256-bit key for the database cipher - automatically zeroed when dropped
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey {
    key: [u8; 32],
}

impl CipherKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Secret value (passwords) - automatically zeroed when dropped
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretString {
    value: String,
}

impl SecretString {
    /// Create a new secret string
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Get the secret value (use carefully)
    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Wipe the value now instead of waiting for drop
    pub fn clear(&mut self) {
        self.value.zeroize();
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretString")
            .field("value", &"[REDACTED]")
            .finish()
    }
}

impl Serialize for SecretString {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de> Deserialize<'de> for SecretString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(SecretString::new)
    }
}
