//! Storage trait definitions

use async_trait::async_trait;

use crate::credential::{CredentialAttributes, Credentials, Lookup};
use crate::error::Result;

/// Trait for credential storage backends
///
/// Native bindings may fail with `StoreError::NativeUnavailable`; callers wrap
/// them in `ResilientCredentialStore`, which treats every other error as "not found".
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up the credentials identified by `attributes`
    async fn get(&self, attributes: &CredentialAttributes) -> Result<Lookup>;

    /// Store `credentials`, or delete the entry when `None`
    async fn set(
        &self,
        attributes: &CredentialAttributes,
        credentials: Option<Credentials>,
    ) -> Result<()>;

    /// Release OS handles held by the backend
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Get a human-readable name for this storage backend
    fn backend_name(&self) -> &'static str;
}
