//! Configuration Management Module
//!
//! Scoped device configuration, user settings, and secret caching via the
//! system keychain.

pub mod credentials;
pub mod keychain;
pub mod settings;
pub mod storage;

pub use credentials::{
    CredentialCacheEntry, CredentialIdentity, CredentialResolver, SecretKind, WorkspaceScope,
};
pub use keychain::{Keychain, KeychainError, MemorySecretStore, SecretStore};
pub use settings::Settings;
pub use storage::{
    config_dir, write_fingerprint, ConfigFile, ConfigScope, ConfigStore, JsonConfigStore,
    MemoryConfigStore, StorageError, CONFIG_VERSION,
};
