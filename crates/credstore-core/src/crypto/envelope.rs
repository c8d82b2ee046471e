//! Envelope encryption for small secrets (the master key file)
//!
//! Built-in envelope layout:
//! - IV length: 4 bytes, big-endian
//! - IV: `iv_length` bytes
//! - Ciphertext: the rest of the buffer (AES-128-CBC, PKCS#7 padding)

use std::sync::Arc;

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use super::pgp::{GpgEngine, PgpEngine};
use crate::error::{Result, StoreError};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Application-embedded key for the built-in envelope. Not a secret against a
/// determined attacker; it only keeps the key file from being plain text.
const BUILT_IN_KEY: &[u8; 16] = b"credstore-k3y!v1";

const IV_LEN: usize = 16;
const IV_LEN_FIELD: usize = 4;

/// Symmetric encrypt/decrypt of opaque payloads
pub trait EncryptionSupport: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// OS-supplied data protection primitive (e.g. DPAPI), bound to the current user account
pub trait OsProtector: Send + Sync {
    fn protect(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn unprotect(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Which envelope strategy protects a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EncryptionType {
    #[default]
    BuiltIn,
    OsWrapped,
    PgpKey,
}

/// Strategy selection plus the PGP key id when `PgpKey` is used
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionSpec {
    #[serde(rename = "type")]
    pub kind: EncryptionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_key_id: Option<String>,
}

impl EncryptionSpec {
    pub fn built_in() -> Self {
        Self::default()
    }

    pub fn os_wrapped() -> Self {
        Self {
            kind: EncryptionType::OsWrapped,
            pgp_key_id: None,
        }
    }

    pub fn pgp(key_id: impl Into<String>) -> Self {
        Self {
            kind: EncryptionType::PgpKey,
            pgp_key_id: Some(key_id.into()),
        }
    }
}

/// External engines the envelope strategies may need
#[derive(Clone)]
pub struct CryptoProviders {
    pub os_protector: Option<Arc<dyn OsProtector>>,
    pub pgp: Option<Arc<dyn PgpEngine>>,
}

impl CryptoProviders {
    /// No OS protector and no PGP engine: only the built-in envelope works
    pub fn built_in_only() -> Self {
        Self {
            os_protector: None,
            pgp: None,
        }
    }
}

impl Default for CryptoProviders {
    fn default() -> Self {
        Self {
            os_protector: None,
            pgp: Some(Arc::new(GpgEngine::default())),
        }
    }
}

impl std::fmt::Debug for CryptoProviders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoProviders")
            .field("os_protector", &self.os_protector.is_some())
            .field("pgp", &self.pgp.is_some())
            .finish()
    }
}

/// Build the encryption strategy described by `spec`
pub fn create_encryption_support(
    spec: &EncryptionSpec,
    providers: &CryptoProviders,
) -> Result<Box<dyn EncryptionSupport>> {
    match spec.kind {
        EncryptionType::BuiltIn => Ok(Box::new(BuiltInEncryption::new())),
        EncryptionType::OsWrapped => {
            let protector = providers.os_protector.clone().ok_or_else(|| {
                StoreError::ConfigurationError(
                    "OS-wrapped encryption is not supported on this platform".to_string(),
                )
            })?;
            Ok(Box::new(OsWrappedEncryption::new(protector)))
        }
        EncryptionType::PgpKey => {
            let key_id = spec.pgp_key_id.clone().ok_or_else(|| {
                StoreError::ConfigurationError("PGP encryption requires a key id".to_string())
            })?;
            let engine = providers.pgp.clone().ok_or_else(|| {
                StoreError::ConfigurationError("No PGP engine is available".to_string())
            })?;
            Ok(Box::new(PgpEncryption::new(engine, key_id)))
        }
    }
}

/// AES-128-CBC with the embedded key
#[derive(Debug, Clone)]
pub struct BuiltInEncryption {
    key: [u8; 16],
}

impl BuiltInEncryption {
    pub fn new() -> Self {
        Self { key: *BUILT_IN_KEY }
    }

    #[cfg(test)]
    fn with_key(key: [u8; 16]) -> Self {
        Self { key }
    }
}

impl Default for BuiltInEncryption {
    fn default() -> Self {
        Self::new()
    }
}

impl EncryptionSupport for BuiltInEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher = Aes128CbcEnc::new_from_slices(&self.key, &iv)
            .map_err(|e| StoreError::EncryptionError(e.to_string()))?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut envelope = Vec::with_capacity(IV_LEN_FIELD + IV_LEN + ciphertext.len());
        envelope.extend_from_slice(&(IV_LEN as u32).to_be_bytes());
        envelope.extend_from_slice(&iv);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let (iv, ciphertext) = split_envelope(envelope)?;

        let cipher = Aes128CbcDec::new_from_slices(&self.key, iv)
            .map_err(|e| StoreError::DecryptionError(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| StoreError::DecryptionError(e.to_string()))
    }
}

/// Split `[iv length][iv][ciphertext]` into its parts
fn split_envelope(envelope: &[u8]) -> Result<(&[u8], &[u8])> {
    if envelope.len() < IV_LEN_FIELD {
        return Err(StoreError::EnvelopeError(format!(
            "Envelope too short for IV length field: {} bytes",
            envelope.len()
        )));
    }

    let mut len_field = [0u8; IV_LEN_FIELD];
    len_field.copy_from_slice(&envelope[..IV_LEN_FIELD]);
    let iv_len = u32::from_be_bytes(len_field) as usize;

    let rest = &envelope[IV_LEN_FIELD..];
    if iv_len > rest.len() {
        return Err(StoreError::EnvelopeError(format!(
            "IV length {} exceeds remaining {} bytes",
            iv_len,
            rest.len()
        )));
    }
    if iv_len != IV_LEN {
        return Err(StoreError::EnvelopeError(format!(
            "Unsupported IV length: expected {}, got {}",
            IV_LEN, iv_len
        )));
    }

    Ok(rest.split_at(iv_len))
}

/// Built-in envelope, additionally wrapped by the OS protection primitive
pub struct OsWrappedEncryption {
    base: BuiltInEncryption,
    protector: Arc<dyn OsProtector>,
}

impl OsWrappedEncryption {
    pub fn new(protector: Arc<dyn OsProtector>) -> Self {
        Self {
            base: BuiltInEncryption::new(),
            protector,
        }
    }
}

impl EncryptionSupport for OsWrappedEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let envelope = self.base.encrypt(plaintext)?;
        self.protector
            .protect(&envelope)
            .map_err(|e| StoreError::EncryptionError(format!("OS protect failed: {}", e)))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let envelope = self
            .protector
            .unprotect(ciphertext)
            .map_err(|e| StoreError::DecryptionError(format!("OS unprotect failed: {}", e)))?;
        self.base.decrypt(&envelope)
    }
}

/// Public-key encryption through an OpenPGP engine
pub struct PgpEncryption {
    engine: Arc<dyn PgpEngine>,
    key_id: String,
}

impl PgpEncryption {
    pub fn new(engine: Arc<dyn PgpEngine>, key_id: String) -> Self {
        Self { engine, key_id }
    }
}

impl EncryptionSupport for PgpEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.engine
            .encrypt(plaintext, &self.key_id)
            .map_err(|e| StoreError::EncryptionError(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.engine
            .decrypt(ciphertext)
            .map_err(|e| StoreError::DecryptionError(e.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::pgp::PgpKey;

    /// XOR "protection" standing in for the OS primitive
    pub(crate) struct XorProtector;

    impl OsProtector for XorProtector {
        fn protect(&self, data: &[u8]) -> Result<Vec<u8>> {
            Ok(data.iter().map(|b| b ^ 0x5A).collect())
        }

        fn unprotect(&self, data: &[u8]) -> Result<Vec<u8>> {
            self.protect(data)
        }
    }

    /// Reversible fake engine that tags payloads with the recipient key id
    pub(crate) struct FakePgpEngine;

    impl PgpEngine for FakePgpEngine {
        fn encrypt(&self, data: &[u8], key_id: &str) -> Result<Vec<u8>> {
            let mut out = format!("{}:", key_id).into_bytes();
            out.extend(data.iter().rev());
            Ok(out)
        }

        fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
            let split = data
                .iter()
                .position(|b| *b == b':')
                .ok_or_else(|| StoreError::PgpError("no recipient".to_string()))?;
            Ok(data[split + 1..].iter().rev().copied().collect())
        }

        fn list_secret_keys(&self) -> Result<Vec<PgpKey>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn test_built_in_roundtrip_empty_and_multi_block() {
        let encryption = BuiltInEncryption::new();

        for plaintext in [Vec::new(), vec![0xABu8; 100]] {
            let envelope = encryption.encrypt(&plaintext).unwrap();
            assert_eq!(encryption.decrypt(&envelope).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_built_in_envelope_layout() {
        let envelope = BuiltInEncryption::new().encrypt(b"0123456789").unwrap();

        assert_eq!(&envelope[..4], &16u32.to_be_bytes());
        // one padded block after the IV
        assert_eq!(envelope.len(), 4 + 16 + 16);
    }

    #[test]
    fn test_random_iv_per_call() {
        let encryption = BuiltInEncryption::new();
        let a = encryption.encrypt(b"same").unwrap();
        let b = encryption.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_oversized_iv_length_is_envelope_error() {
        let mut envelope = BuiltInEncryption::new().encrypt(b"data").unwrap();
        envelope[..4].copy_from_slice(&1000u32.to_be_bytes());

        let result = BuiltInEncryption::new().decrypt(&envelope);
        assert!(matches!(result, Err(StoreError::EnvelopeError(_))));
    }

    #[test]
    fn test_truncated_envelope_is_envelope_error() {
        let result = BuiltInEncryption::new().decrypt(&[0, 0]);
        assert!(matches!(result, Err(StoreError::EnvelopeError(_))));
    }

    #[test]
    fn test_wrong_key_is_decrypt_error() {
        let envelope = BuiltInEncryption::with_key([1u8; 16]).encrypt(b"secret").unwrap();
        let result = BuiltInEncryption::with_key([2u8; 16]).decrypt(&envelope);

        // wrong key either breaks padding or yields different bytes
        match result {
            Err(StoreError::DecryptionError(_)) => {}
            Ok(bytes) => assert_ne!(bytes, b"secret"),
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_os_wrapped_roundtrip() {
        let providers = CryptoProviders {
            os_protector: Some(Arc::new(XorProtector)),
            pgp: None,
        };
        let encryption = create_encryption_support(&EncryptionSpec::os_wrapped(), &providers).unwrap();

        let protected = encryption.encrypt(b"master").unwrap();
        // the wrapped bytes are not a plain built-in envelope
        assert_ne!(&protected[..4], &16u32.to_be_bytes());
        assert_eq!(encryption.decrypt(&protected).unwrap(), b"master");
    }

    #[test]
    fn test_os_wrapped_without_protector_is_config_error() {
        let result = create_encryption_support(
            &EncryptionSpec::os_wrapped(),
            &CryptoProviders::built_in_only(),
        );
        assert!(matches!(result, Err(StoreError::ConfigurationError(_))));
    }

    #[test]
    fn test_pgp_delegates_to_engine() {
        let providers = CryptoProviders {
            os_protector: None,
            pgp: Some(Arc::new(FakePgpEngine)),
        };
        let encryption = create_encryption_support(&EncryptionSpec::pgp("ABCD1234"), &providers).unwrap();

        let encrypted = encryption.encrypt(b"key").unwrap();
        assert!(encrypted.starts_with(b"ABCD1234:"));
        assert_eq!(encryption.decrypt(&encrypted).unwrap(), b"key");
    }

    #[test]
    fn test_pgp_without_key_id_is_config_error() {
        let spec = EncryptionSpec {
            kind: EncryptionType::PgpKey,
            pgp_key_id: None,
        };
        let result = create_encryption_support(&spec, &CryptoProviders::default());
        assert!(matches!(result, Err(StoreError::ConfigurationError(_))));
    }
}
