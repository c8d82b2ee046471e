//! Scripted credential backends for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use super::{CredentialStore, InMemoryCredentialStore};
use crate::credential::{CredentialAttributes, Credentials, Lookup};
use crate::error::{Result, StoreError};

/// What a `ScriptedStore` answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Script {
    /// Every call fails as if the native library could not be loaded
    Unavailable,
    /// Reads are refused by the user
    Denied,
    /// Every call fails with an unexpected error
    Broken,
}

/// Backend that never stores anything and counts calls
pub(crate) struct ScriptedStore {
    script: Script,
    calls: AtomicUsize,
}

impl ScriptedStore {
    pub(crate) fn new(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self) -> Result<Lookup> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script {
            Script::Unavailable => Err(StoreError::NativeUnavailable("libsecret.so.0".to_string())),
            Script::Denied => Ok(Lookup::Denied),
            Script::Broken => Err(StoreError::KeychainError("unexpected".to_string())),
        }
    }
}

#[async_trait]
impl CredentialStore for ScriptedStore {
    async fn get(&self, _attributes: &CredentialAttributes) -> Result<Lookup> {
        self.answer()
    }

    async fn set(
        &self,
        _attributes: &CredentialAttributes,
        _credentials: Option<Credentials>,
    ) -> Result<()> {
        self.answer().map(|_| ())
    }

    fn backend_name(&self) -> &'static str {
        "Scripted"
    }
}

/// In-memory backend whose writes wait for a permit from the test
pub(crate) struct GatedStore {
    inner: InMemoryCredentialStore,
    gate: Semaphore,
    /// Passwords in the order writes reached the store
    writes: Mutex<Vec<Option<String>>>,
    closed: AtomicBool,
}

impl GatedStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryCredentialStore::new(),
            gate: Semaphore::new(0),
            writes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Let `count` more writes through
    pub(crate) fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }

    pub(crate) fn writes(&self) -> Vec<Option<String>> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stored value, bypassing any wrapper
    pub(crate) async fn stored(&self, attributes: &CredentialAttributes) -> Lookup {
        self.inner.get(attributes).await.unwrap()
    }
}

#[async_trait]
impl CredentialStore for GatedStore {
    async fn get(&self, attributes: &CredentialAttributes) -> Result<Lookup> {
        self.inner.get(attributes).await
    }

    async fn set(
        &self,
        attributes: &CredentialAttributes,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        self.gate.acquire().await.unwrap().forget();
        self.writes.lock().unwrap().push(
            credentials
                .as_ref()
                .and_then(|c| c.password().map(str::to_string)),
        );
        self.inner.set(attributes, credentials).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "Gated"
    }
}
