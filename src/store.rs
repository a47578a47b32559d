//! In-memory secret storage with secure memory handling.
//!
//! The submitted password is held only in RAM and zeroized on drop. It is
//! never persisted to disk. The slot is written at most once: the first
//! accepted submission wins and later writes are refused.

use std::sync::Arc;
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// The human-supplied password.
///
/// `Debug` never prints the value; use [`Secret::expose`] where the raw
/// bytes are actually needed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl AsRef<[u8]> for Secret {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Result of a write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This write moved the store from absent to present
    Accepted,
    /// A secret was already present; the new value was dropped
    AlreadyPresent,
}

/// Single-assignment secret slot shared between the public form handler
/// (writer) and the local relay (readers).
pub struct SecretStore {
    secret: RwLock<Option<Secret>>,
}

impl SecretStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            secret: RwLock::new(None),
        }
    }

    /// Store the secret if none is present yet.
    ///
    /// The write is complete and visible to readers before this returns, so
    /// callers may tear down the public listener as soon as they see
    /// [`WriteOutcome::Accepted`].
    pub async fn write(&self, secret: Secret) -> WriteOutcome {
        let mut guard = self.secret.write().await;
        if guard.is_some() {
            return WriteOutcome::AlreadyPresent;
        }
        *guard = Some(secret);
        WriteOutcome::Accepted
    }

    /// Current value, or `None` while absent. Does not wait for a submission.
    pub async fn read(&self) -> Option<Secret> {
        self.secret.read().await.clone()
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Shared secret store handle for use across the service.
pub type SharedSecretStore = Arc<SecretStore>;

/// Create a new shared secret store.
pub fn create_secret_store() -> SharedSecretStore {
    Arc::new(SecretStore::new())
}
