//! AES-256-GCM authenticated encryption for the credential database
//!
//! Sealed format (base64 encoded when persisted): `{nonce}{ciphertext}{auth_tag}`
//! - Nonce: 12 bytes (96 bits) - standard for GCM
//! - Ciphertext: variable length
//! - Auth tag: 16 bytes (128 bits), appended by aes-gcm

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;

use super::CipherKey;
use crate::error::{Result, StoreError};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Sealed database payload
#[derive(Debug, Clone)]
pub struct SealedData {
    /// Random nonce (12 bytes for GCM)
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the auth tag appended
    pub ciphertext: Vec<u8>,
}

impl SealedData {
    /// Serialize as base64 of `nonce || ciphertext`
    pub fn to_base64(&self) -> String {
        let mut bytes = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        BASE64.encode(bytes)
    }

    /// Parse from the base64 form produced by `to_base64`
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| StoreError::DecryptionError(format!("Invalid base64 payload: {}", e)))?;

        if bytes.len() < NONCE_LEN + TAG_LEN {
            return Err(StoreError::DecryptionError(format!(
                "Sealed payload too short: {} bytes",
                bytes.len()
            )));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);

        Ok(Self {
            nonce,
            ciphertext: bytes[NONCE_LEN..].to_vec(),
        })
    }
}

/// Encrypt plaintext using AES-256-GCM
///
/// `associated_data` is authenticated but not encrypted; the same bytes must be
/// supplied to `open`.
pub fn seal(plaintext: &[u8], key: &CipherKey, associated_data: &[u8]) -> Result<SealedData> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| StoreError::EncryptionError(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|e| StoreError::EncryptionError(e.to_string()))?;

    Ok(SealedData { nonce, ciphertext })
}

/// Decrypt and authenticate a sealed payload
pub fn open(sealed: &SealedData, key: &CipherKey, associated_data: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| StoreError::DecryptionError(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: sealed.ciphertext.as_slice(),
                aad: associated_data,
            },
        )
        .map_err(|e| StoreError::DecryptionError(e.to_string()))
}
