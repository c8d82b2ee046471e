//! Credential type definitions

use std::hash::{Hash, Hasher};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::SecretString;

/// Reserved service name prefix owned by this store
pub const SERVICE_NAME_PREFIX: &str = "credstore";

/// User name marker of entries written under the old hashed key scheme
pub const LEGACY_KEY_MARKER: &str = "old-hashed-key|";

/// Build a service name under the reserved prefix, e.g. `credstore Git - github.com`
pub fn generate_service_name(subsystem: &str, key: &str) -> String {
    format!("{} {} - {}", SERVICE_NAME_PREFIX, subsystem, key)
}

/// Identifies a secret
///
/// Equality and hashing only consider `(service_name, user_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialAttributes {
    /// Logical namespace (e.g. application + purpose)
    pub service_name: String,

    pub user_name: Option<String>,

    /// Type-like tag used only to find entries stored under the legacy key scheme
    pub requestor: Option<String>,

    /// The password must never reach persistent storage
    #[serde(default)]
    pub is_password_memory_only: bool,

    /// A denial for this key may be cached briefly
    #[serde(default)]
    pub cache_denied_items: bool,
}

impl CredentialAttributes {
    pub fn new(service_name: impl Into<String>, user_name: Option<&str>) -> Self {
        Self {
            service_name: service_name.into(),
            user_name: user_name.map(str::to_string),
            requestor: None,
            is_password_memory_only: false,
            cache_denied_items: false,
        }
    }

    pub fn with_requestor(mut self, requestor: impl Into<String>) -> Self {
        self.requestor = Some(requestor.into());
        self
    }

    pub fn memory_only(mut self) -> Self {
        self.is_password_memory_only = true;
        self
    }

    pub fn cache_denied(mut self) -> Self {
        self.cache_denied_items = true;
        self
    }

    /// User name with empty strings treated as absent
    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref().filter(|name| !name.is_empty())
    }

    /// Attributes under which the old hashed key scheme stored this secret
    pub fn legacy_attributes(&self) -> Option<CredentialAttributes> {
        match (self.requestor.as_deref(), self.user_name()) {
            (Some(requestor), Some(user_name)) => Some(legacy_attributes(requestor, user_name)),
            _ => None,
        }
    }
}

impl PartialEq for CredentialAttributes {
    fn eq(&self, other: &Self) -> bool {
        self.service_name == other.service_name && self.user_name == other.user_name
    }
}

impl Eq for CredentialAttributes {}

impl Hash for CredentialAttributes {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service_name.hash(state);
        self.user_name.hash(state);
    }
}

/// Attributes of the old scheme: reserved service, hashed `requestor/user_name` as user name
pub fn legacy_attributes(requestor: &str, user_name: &str) -> CredentialAttributes {
    let digest = Sha256::digest(format!("{}/{}", requestor, user_name).as_bytes());
    let hashed = format!("{}{}", LEGACY_KEY_MARKER, BASE64.encode(digest));
    CredentialAttributes::new(SERVICE_NAME_PREFIX, Some(&hashed))
}

/// The secret value
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub user_name: Option<String>,
    pub password: Option<SecretString>,
}

impl Credentials {
    pub fn new(user_name: Option<&str>, password: Option<&str>) -> Self {
        Self {
            user_name: user_name.map(str::to_string),
            password: password.map(SecretString::new),
        }
    }

    /// Password text, if any (use carefully)
    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(SecretString::expose)
    }

    /// Whether a non-empty password is present
    pub fn has_password(&self) -> bool {
        self.password.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Copy keeping only the user name
    pub fn without_password(&self) -> Self {
        Self {
            user_name: self.user_name.clone(),
            password: None,
        }
    }

    /// Wipe the password now
    pub fn clear(&mut self) {
        if let Some(password) = self.password.as_mut() {
            password.clear();
        }
        self.password = None;
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Result of a credential lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Credentials),
    Absent,
    /// The user or the OS refused access to the secret
    Denied,
}

impl Lookup {
    pub fn found(credentials: Option<Credentials>) -> Self {
        credentials.map_or(Lookup::Absent, Lookup::Found)
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        match self {
            Lookup::Found(credentials) => Some(credentials),
            _ => None,
        }
    }

    pub fn into_credentials(self) -> Option<Credentials> {
        match self {
            Lookup::Found(credentials) => Some(credentials),
            _ => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Lookup::Denied)
    }

    /// Found with a non-empty password
    pub fn has_password(&self) -> bool {
        self.credentials().is_some_and(Credentials::has_password)
    }
}
