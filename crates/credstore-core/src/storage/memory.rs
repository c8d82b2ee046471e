//! In-memory storage backend
//!
//! Used as the fallback when the native store cannot load, for the
//! memory-only provider and for entries flagged as memory-only.

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::RwLock;
use tracing::debug;

use super::CredentialStore;
use crate::credential::{CredentialAttributes, Credentials, Lookup};
use crate::error::Result;

/// Map-backed credential store; nothing is ever persisted
#[derive(Default)]
pub struct InMemoryCredentialStore {
    /// Insertion ordered so "first entry for a service" is stable
    entries: RwLock<IndexMap<CredentialAttributes, Credentials>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot of all entries in insertion order
    pub async fn entries(&self) -> Vec<(CredentialAttributes, Credentials)> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(attributes, credentials)| (attributes.clone(), credentials.clone()))
            .collect()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, attributes: &CredentialAttributes) -> Result<Lookup> {
        let entries = self.entries.read().await;

        if let Some(credentials) = entries.get(attributes) {
            return Ok(Lookup::Found(credentials.clone()));
        }

        if attributes.user_name().is_none() {
            let first = entries
                .iter()
                .find(|(key, _)| key.service_name == attributes.service_name)
                .map(|(_, credentials)| credentials.clone());
            return Ok(Lookup::found(first));
        }

        Ok(Lookup::Absent)
    }

    async fn set(
        &self,
        attributes: &CredentialAttributes,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let mut entries = self.entries.write().await;
        match credentials {
            Some(credentials) => {
                entries.insert(attributes.clone(), credentials);
            }
            None => {
                entries.shift_remove(attributes);
            }
        }
        debug!("In-memory store now holds {} entries", entries.len());
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "In-Memory Storage"
    }
}
