//! Keychain Integration
//!
//! Securely stores passwords and passphrases in the system keychain.
//! Uses the `keyring` crate for cross-platform keychain access.

use std::collections::HashMap;

use keyring::Entry;
use parking_lot::Mutex;

/// Service name for keychain entries
const SERVICE_NAME: &str = "com.devicelink.ssh";

/// Keychain errors
#[derive(Debug, thiserror::Error)]
pub enum KeychainError {
    #[error("Keychain error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Keychain store could not be verified for ID: {0}")]
    Unverified(String),
}

/// Durable string secret storage keyed by string
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, KeychainError>;

    fn store(&self, key: &str, secret: &str) -> Result<(), KeychainError>;

    /// Deleting a missing key is not an error
    fn delete(&self, key: &str) -> Result<(), KeychainError>;
}

/// System keychain backed [`SecretStore`]
pub struct Keychain {
    service: String,
}

impl Keychain {
    /// Create a new keychain manager
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name (for testing)
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    // Explicit username keeps the keychain identity stable on macOS
    fn entry(&self, key: &str) -> Result<Entry, KeychainError> {
        let username = whoami::username();
        Ok(Entry::new(&self.service, &format!("{}@{}", username, key))?)
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for Keychain {
    fn get(&self, key: &str) -> Result<Option<String>, KeychainError> {
        tracing::debug!("Keychain get: service={}, key={}", self.service, key);
        match self.entry(key)?.get_password() {
            Ok(secret) => {
                tracing::debug!("Keychain get success: key={}, len={}", key, secret.len());
                Ok(Some(secret))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                tracing::error!("Keychain get failed: key={}, error={:?}", key, e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    fn store(&self, key: &str, secret: &str) -> Result<(), KeychainError> {
        tracing::info!("Keychain store: service={}, key={}", self.service, key);
        let entry = self.entry(key)?;
        entry.set_password(secret)?;
        // Read back: some backends accept the write and drop it silently
        match entry.get_password() {
            Ok(read_back) if read_back == secret => Ok(()),
            Ok(_) => {
                tracing::error!("Keychain store verification failed: content mismatch");
                Err(KeychainError::Unverified(key.to_string()))
            }
            Err(e) => {
                tracing::error!("Keychain store verification failed: {:?}", e);
                Err(KeychainError::Keyring(e))
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), KeychainError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::Keyring(e)),
        }
    }
}

/// Process-local [`SecretStore`] for headless use and tests
#[derive(Default)]
pub struct MemorySecretStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<String>, KeychainError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn store(&self, key: &str, secret: &str) -> Result<(), KeychainError> {
        self.entries.lock().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), KeychainError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}
