//! Key storage collaborator for channel keys.
//!
//! The channel manager never persists keys itself; it hands them to a
//! [`Keychain`] under ids of the form `peer:{peer_id}:{channel}`.
//!
//! Backends:
//! - [`MemoryKeychain`]: process-local map, used by tests and ephemeral nodes
//! - `SystemKeychain` (feature `system-keychain`): the OS keychain via the
//!   `keyring` crate, secrets stored base64-encoded

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors that can occur during keychain operations.
#[derive(Debug, Error)]
pub enum KeychainError {
    /// Access to the keychain was denied.
    #[error("Keychain access denied: {0}")]
    AccessDenied(String),

    /// The keychain service is unavailable.
    #[error("Keychain service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A stored secret could not be encoded or decoded.
    #[error("Key encoding error: {0}")]
    EncodingError(String),

    /// A platform-specific keychain error occurred.
    #[error("Keychain error: {0}")]
    PlatformError(String),
}

/// Result type for keychain operations.
pub type KeychainResult<T> = Result<T, KeychainError>;

/// Injected key storage capability.
pub trait Keychain: Send + Sync {
    /// Stores `key` under `key_id`, replacing any previous value.
    fn store_key(&self, key_id: &str, key: &[u8]) -> KeychainResult<()>;

    /// Retrieves the key stored under `key_id`, if any.
    fn retrieve_key(&self, key_id: &str) -> KeychainResult<Option<Vec<u8>>>;

    /// Deletes the key under `key_id`. Deleting a missing key is not an error.
    fn delete_key(&self, key_id: &str) -> KeychainResult<()>;
}

impl<K: Keychain + ?Sized> Keychain for Arc<K> {
    fn store_key(&self, key_id: &str, key: &[u8]) -> KeychainResult<()> {
        (**self).store_key(key_id, key)
    }

    fn retrieve_key(&self, key_id: &str) -> KeychainResult<Option<Vec<u8>>> {
        (**self).retrieve_key(key_id)
    }

    fn delete_key(&self, key_id: &str) -> KeychainResult<()> {
        (**self).delete_key(key_id)
    }
}

/// Keychain id for `peer`'s key to `channel`.
pub fn peer_channel_key_id(peer_id: &str, channel: &str) -> String {
    format!("peer:{}:{}", peer_id, channel)
}

/// In-memory keychain.
#[derive(Debug, Default)]
pub struct MemoryKeychain {
    storage: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeychain {
    /// Create an empty keychain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.storage.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Whether no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> KeychainResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.storage
            .lock()
            .map_err(|_| KeychainError::ServiceUnavailable("keychain lock poisoned".to_string()))
    }
}

impl Keychain for MemoryKeychain {
    fn store_key(&self, key_id: &str, key: &[u8]) -> KeychainResult<()> {
        self.lock()?.insert(key_id.to_string(), key.to_vec());
        Ok(())
    }

    fn retrieve_key(&self, key_id: &str) -> KeychainResult<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key_id).cloned())
    }

    fn delete_key(&self, key_id: &str) -> KeychainResult<()> {
        self.lock()?.remove(key_id);
        Ok(())
    }
}

#[cfg(feature = "system-keychain")]
pub use system::SystemKeychain;

#[cfg(feature = "system-keychain")]
mod system {
    use base64::{engine::general_purpose::STANDARD, Engine};

    use super::{Keychain, KeychainError, KeychainResult};

    /// The service name used for keychain entries.
    const SERVICE_NAME: &str = "bitchat";

    /// OS keychain backend.
    #[derive(Debug, Clone)]
    pub struct SystemKeychain {
        service: String,
    }

    impl SystemKeychain {
        /// Uses the default `bitchat` service name.
        pub fn new() -> Self {
            Self::with_service(SERVICE_NAME)
        }

        /// Uses a custom service name.
        pub fn with_service(service: impl Into<String>) -> Self {
            Self {
                service: service.into(),
            }
        }

        fn entry(&self, key_id: &str) -> KeychainResult<keyring::Entry> {
            keyring::Entry::new(&self.service, key_id)
                .map_err(|e| KeychainError::PlatformError(e.to_string()))
        }
    }

    impl Default for SystemKeychain {
        fn default() -> Self {
            Self::new()
        }
    }

    fn map_error(e: keyring::Error) -> KeychainError {
        match e {
            keyring::Error::NoStorageAccess(_) => {
                KeychainError::AccessDenied("No storage access".to_string())
            }
            keyring::Error::PlatformFailure(_) => {
                KeychainError::ServiceUnavailable("Platform failure".to_string())
            }
            keyring::Error::TooLong(_, _) => {
                KeychainError::EncodingError("Value too long".to_string())
            }
            _ => KeychainError::PlatformError(e.to_string()),
        }
    }

    impl Keychain for SystemKeychain {
        fn store_key(&self, key_id: &str, key: &[u8]) -> KeychainResult<()> {
            self.entry(key_id)?
                .set_password(&STANDARD.encode(key))
                .map_err(map_error)
        }

        fn retrieve_key(&self, key_id: &str) -> KeychainResult<Option<Vec<u8>>> {
            match self.entry(key_id)?.get_password() {
                Ok(encoded) => STANDARD
                    .decode(encoded)
                    .map(Some)
                    .map_err(|e| KeychainError::EncodingError(e.to_string())),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(e) => Err(map_error(e)),
            }
        }

        fn delete_key(&self, key_id: &str) -> KeychainResult<()> {
            match self.entry(key_id)?.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(e) => Err(map_error(e)),
            }
        }
    }
}
