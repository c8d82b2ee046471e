//! OpenPGP engine used to protect the master key with a user's public key

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Result, StoreError};

/// A secret key available for decryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgpKey {
    pub key_id: String,
    pub user_id: String,
}

/// External OpenPGP implementation
pub trait PgpEngine: Send + Sync {
    /// Encrypt `data` for the recipient `key_id`
    fn encrypt(&self, data: &[u8], key_id: &str) -> Result<Vec<u8>>;

    /// Decrypt with whichever secret key the engine holds
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Keys that could decrypt a payload encrypted by this engine
    fn list_secret_keys(&self) -> Result<Vec<PgpKey>>;
}

/// `PgpEngine` driving the `gpg` executable
#[derive(Debug, Clone)]
pub struct GpgEngine {
    executable: PathBuf,
}

impl GpgEngine {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    fn run(&self, args: &[&str], input: Option<&[u8]>) -> Result<Vec<u8>> {
        debug!("Running {:?} {:?}", self.executable, args);

        let mut child = Command::new(&self.executable)
            .args(["--batch", "--yes", "--quiet"])
            .args(args)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| StoreError::PgpError(format!("Cannot start gpg: {}", e)))?;

        if let Some(input) = input {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| StoreError::PgpError("gpg stdin unavailable".to_string()))?;
            stdin.write_all(input)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(StoreError::PgpError(format!(
                "gpg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(output.stdout)
    }
}

impl Default for GpgEngine {
    fn default() -> Self {
        Self::new("gpg")
    }
}

impl PgpEngine for GpgEngine {
    fn encrypt(&self, data: &[u8], key_id: &str) -> Result<Vec<u8>> {
        self.run(&["--encrypt", "--recipient", key_id], Some(data))
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.run(&["--decrypt"], Some(data))
    }

    fn list_secret_keys(&self) -> Result<Vec<PgpKey>> {
        let output = self.run(&["--list-secret-keys", "--with-colons"], None)?;
        Ok(parse_secret_keys(&String::from_utf8_lossy(&output)))
    }
}

/// Parse `gpg --list-secret-keys --with-colons` output
///
/// A `sec` record carries the key id in field 5; the first `uid` record that
/// follows carries the user id in field 10.
pub fn parse_secret_keys(output: &str) -> Vec<PgpKey> {
    let mut keys: Vec<PgpKey> = Vec::new();
    let mut awaiting_uid = false;

    for line in output.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields.first().copied() {
            Some("sec") => {
                if let Some(key_id) = fields.get(4).filter(|id| !id.is_empty()) {
                    keys.push(PgpKey {
                        key_id: key_id.to_string(),
                        user_id: String::new(),
                    });
                    awaiting_uid = true;
                }
            }
            Some("uid") if awaiting_uid => {
                if let (Some(key), Some(uid)) = (keys.last_mut(), fields.get(9)) {
                    key.user_id = uid.to_string();
                }
                awaiting_uid = false;
            }
            _ => {}
        }
    }

    keys
}
