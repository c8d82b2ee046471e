//! Resilience layer over a backing credential store
//!
//! Writes are acknowledged at once and applied by a single background worker
//! in submission order. Until a write lands, reads of that key are answered
//! from an overlay. When the backing store reports that its native library
//! cannot load, the wrapper switches to an in-memory store for good.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::{CredentialStore, InMemoryCredentialStore};
use crate::credential::{CredentialAttributes, Credentials, Lookup};
use crate::error::{Result, StoreError};
use crate::notify::Notifier;

/// How long a cached denial stays valid after its last access
pub const DENIED_ITEMS_TTL: Duration = Duration::from_secs(60);

/// Which store currently serves requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Primary,
    /// Backing store failed to load; in-memory store for the rest of the process
    Fallback,
}

/// Value written by `set` but not yet confirmed by the backing store
struct Postponed {
    /// `None` is a pending delete
    value: Option<Credentials>,
    seq: u64,
}

enum WriteCommand {
    Write {
        attributes: CredentialAttributes,
        credentials: Option<Credentials>,
        seq: u64,
    },
    Flush(oneshot::Sender<()>),
}

/// State shared with the write worker
struct Shared {
    backing: Arc<dyn CredentialStore>,
    fallback: OnceLock<Arc<InMemoryCredentialStore>>,
    postponed: Mutex<HashMap<CredentialAttributes, Postponed>>,
    notifier: Arc<dyn Notifier>,
}

impl Shared {
    fn activate_fallback(&self, cause: &StoreError) -> Arc<InMemoryCredentialStore> {
        let mut activated = false;
        let fallback = self.fallback.get_or_init(|| {
            activated = true;
            Arc::new(InMemoryCredentialStore::new())
        });

        if activated {
            error!(
                "{} cannot be used, keeping credentials in memory: {}",
                self.backing.backend_name(),
                cause
            );
            self.notifier.notify(
                "Credential storage is unavailable",
                "Passwords will be kept in memory only and are lost when the application exits.",
            );
        }
        fallback.clone()
    }

    async fn read(&self, attributes: &CredentialAttributes) -> Lookup {
        if let Some(fallback) = self.fallback.get() {
            return read_fallback(fallback, attributes).await;
        }

        match self.backing.get(attributes).await {
            Ok(lookup) => lookup,
            Err(e) if e.is_native_unavailable() => {
                let fallback = self.activate_fallback(&e);
                read_fallback(&fallback, attributes).await
            }
            Err(e) => {
                warn!("Cannot read credentials for {}: {}", attributes.service_name, e);
                Lookup::Absent
            }
        }
    }

    async fn write(&self, attributes: &CredentialAttributes, credentials: Option<Credentials>) {
        let result = match self.fallback.get() {
            Some(fallback) => fallback.set(attributes, credentials).await,
            None => match self.backing.set(attributes, credentials.clone()).await {
                Err(e) if e.is_native_unavailable() => {
                    self.activate_fallback(&e).set(attributes, credentials).await
                }
                other => other,
            },
        };

        if let Err(e) = result {
            warn!("Cannot store credentials for {}: {}", attributes.service_name, e);
        }
    }

    /// Drop the overlay entry unless a newer write replaced it
    async fn complete(&self, attributes: &CredentialAttributes, seq: u64) {
        let mut postponed = self.postponed.lock().await;
        if postponed.get(attributes).is_some_and(|p| p.seq == seq) {
            postponed.remove(attributes);
        }
    }
}

async fn read_fallback(fallback: &InMemoryCredentialStore, attributes: &CredentialAttributes) -> Lookup {
    fallback.get(attributes).await.unwrap_or(Lookup::Absent)
}

async fn run_worker(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<WriteCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Write {
                attributes,
                credentials,
                seq,
            } => {
                shared.write(&attributes, credentials).await;
                shared.complete(&attributes, seq).await;
            }
            WriteCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Credential write worker stopped");
}

/// Credential store wrapper that never fails and never blocks on writes
pub struct ResilientCredentialStore {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<WriteCommand>,
    next_seq: AtomicU64,
    denied: Mutex<HashMap<CredentialAttributes, Instant>>,
    denied_ttl: Duration,
    /// Set by `close`; later writes are refused instead of reaching a closed store
    closed: AtomicBool,
}

impl ResilientCredentialStore {
    /// Wrap `backing`; spawns the write worker on the current Tokio runtime
    pub fn new(backing: Arc<dyn CredentialStore>, notifier: Arc<dyn Notifier>) -> Self {
        let shared = Arc::new(Shared {
            backing,
            fallback: OnceLock::new(),
            postponed: Mutex::new(HashMap::new()),
            notifier,
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(shared.clone(), receiver));

        Self {
            shared,
            commands,
            next_seq: AtomicU64::new(0),
            denied: Mutex::new(HashMap::new()),
            denied_ttl: DENIED_ITEMS_TTL,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_denied_ttl(mut self, ttl: Duration) -> Self {
        self.denied_ttl = ttl;
        self
    }

    pub fn state(&self) -> BackendState {
        if self.shared.fallback.get().is_some() {
            BackendState::Fallback
        } else {
            BackendState::Primary
        }
    }

    pub fn is_fallback_active(&self) -> bool {
        self.state() == BackendState::Fallback
    }

    /// Wait until every write enqueued so far has reached the store
    pub async fn flush(&self) {
        let (done, waiter) = oneshot::channel();
        if self.commands.send(WriteCommand::Flush(done)).is_ok() {
            let _ = waiter.await;
        }
    }

    /// Number of writes not yet confirmed
    pub async fn pending_writes(&self) -> usize {
        self.shared.postponed.lock().await.len()
    }

    /// Cached denial still valid; refreshes its expiry
    async fn is_denial_cached(&self, attributes: &CredentialAttributes) -> bool {
        let mut denied = self.denied.lock().await;
        let fresh = denied
            .get(attributes)
            .map(|at| at.elapsed() < self.denied_ttl);

        match fresh {
            Some(true) => {
                denied.insert(attributes.clone(), Instant::now());
                true
            }
            Some(false) => {
                denied.remove(attributes);
                false
            }
            None => false,
        }
    }

    async fn cache_denial(&self, attributes: &CredentialAttributes) {
        let mut denied = self.denied.lock().await;
        denied.retain(|_, at| at.elapsed() < self.denied_ttl);
        denied.insert(attributes.clone(), Instant::now());
    }

    #[cfg(test)]
    async fn cached_denials(&self) -> usize {
        self.denied.lock().await.len()
    }
}

#[async_trait]
impl CredentialStore for ResilientCredentialStore {
    async fn get(&self, attributes: &CredentialAttributes) -> Result<Lookup> {
        if let Some(postponed) = self.shared.postponed.lock().await.get(attributes) {
            return Ok(Lookup::found(postponed.value.clone()));
        }

        if attributes.cache_denied_items && self.is_denial_cached(attributes).await {
            debug!("Access to {} was denied recently", attributes.service_name);
            return Ok(Lookup::Denied);
        }

        let lookup = self.shared.read(attributes).await;

        if lookup.is_denied() && attributes.cache_denied_items {
            self.cache_denial(attributes).await;
        }
        Ok(lookup)
    }

    async fn set(
        &self,
        attributes: &CredentialAttributes,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        self.denied.lock().await.remove(attributes);

        let mut postponed = self.shared.postponed.lock().await;

        if self.closed.load(Ordering::SeqCst) {
            warn!(
                "{} is closed, dropping credentials for {}",
                self.backend_name(),
                attributes.service_name
            );
            return Err(StoreError::StorageError(format!(
                "{} is closed",
                self.backend_name()
            )));
        }

        // once degraded, write through unless a queued write for this key would land later
        if let Some(fallback) = self.shared.fallback.get() {
            if !postponed.contains_key(attributes) {
                drop(postponed);
                if let Err(e) = fallback.set(attributes, credentials).await {
                    warn!("Cannot store credentials for {}: {}", attributes.service_name, e);
                }
                return Ok(());
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        postponed.insert(
            attributes.clone(),
            Postponed {
                value: credentials.clone(),
                seq,
            },
        );

        let command = WriteCommand::Write {
            attributes: attributes.clone(),
            credentials,
            seq,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            drop(postponed);
            warn!("Credential write worker is gone, writing directly");
            if let WriteCommand::Write {
                attributes,
                credentials,
                seq,
            } = command
            {
                self.shared.write(&attributes, credentials).await;
                self.shared.complete(&attributes, seq).await;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            // writes already accepted stay in the queue ahead of the flush
            let _postponed = self.shared.postponed.lock().await;
            self.closed.store(true, Ordering::SeqCst);
        }
        self.flush().await;
        if let Err(e) = self.shared.backing.close().await {
            warn!("Cannot close {}: {}", self.shared.backing.backend_name(), e);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        match self.shared.fallback.get() {
            Some(fallback) => fallback.backend_name(),
            None => self.shared.backing.backend_name(),
        }
    }
}
