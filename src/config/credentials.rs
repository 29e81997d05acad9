//! Credential resolution
//!
//! Secrets are cached per identity: the slot key is derived from the host,
//! username and workspace scope, so a configuration change never lets a
//! stale secret authenticate somewhere else without the user agreeing.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::keychain::{KeychainError, SecretStore};
use crate::prompt::Prompter;

const KEY_PREFIX: &str = "devicelink";

/// What kind of secret is being resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    Password,
    Passphrase,
}

impl SecretKind {
    fn as_str(self) -> &'static str {
        match self {
            SecretKind::Password => "password",
            SecretKind::Passphrase => "passphrase",
        }
    }
}

impl fmt::Display for SecretKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The workspace a session was opened from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceScope {
    pub id: String,
    pub label: String,
}

impl WorkspaceScope {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Who a secret is for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialIdentity {
    /// Device id, suffixed for bastion hops so they cache independently
    pub device_id: String,
    pub host: String,
    pub username: String,
    pub workspace: WorkspaceScope,
}

impl CredentialIdentity {
    fn describe(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Metadata persisted next to every cached secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialCacheEntry {
    pub secret_store_key: String,
    pub host: String,
    pub username: String,
    pub workspace_scope_id: String,
    pub workspace_label: String,
}

impl CredentialCacheEntry {
    fn matches(&self, identity: &CredentialIdentity) -> bool {
        self.host.eq_ignore_ascii_case(&identity.host)
            && self.username == identity.username
            && self.workspace_scope_id == identity.workspace.id
    }
}

fn short_hash(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

fn scoped_key(identity: &CredentialIdentity, kind: SecretKind) -> String {
    format!(
        "{}:{}:{}{}{}:{}",
        KEY_PREFIX,
        kind.as_str(),
        short_hash(&identity.host.to_ascii_lowercase()),
        short_hash(&identity.username),
        short_hash(&identity.workspace.id),
        identity.device_id
    )
}

fn meta_key(device_id: &str, kind: SecretKind) -> String {
    format!("{}:{}:meta:{}", KEY_PREFIX, kind.as_str(), device_id)
}

/// Unscoped slot written by earlier releases
fn legacy_key(device_id: &str, kind: SecretKind) -> String {
    format!("{}:{}:{}", KEY_PREFIX, kind.as_str(), device_id)
}

const REUSE: usize = 0;

/// Resolves passwords and passphrases from the cache or the user
pub struct CredentialResolver {
    store: Arc<dyn SecretStore>,
    prompter: Arc<dyn Prompter>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn SecretStore>, prompter: Arc<dyn Prompter>) -> Self {
        Self { store, prompter }
    }

    /// Resolve a secret for `identity`.
    ///
    /// Returns `Ok(None)` when the user cancels; callers must treat that as a
    /// failed authentication, never as an empty secret.
    pub async fn resolve(
        &self,
        identity: &CredentialIdentity,
        kind: SecretKind,
    ) -> Result<Option<String>, KeychainError> {
        let key = scoped_key(identity, kind);

        if let Some(secret) = self.store.get(&key)?.filter(|s| !s.is_empty()) {
            debug!("Using cached {} for {}", kind, identity.describe());
            self.write_meta(identity, kind, &key);
            return Ok(Some(secret));
        }

        let mut declined_reuse = false;
        if let Some(meta) = self.read_meta(&identity.device_id, kind)? {
            if !meta.matches(identity) {
                if let Some(old_secret) = self.store.get(&meta.secret_store_key)?.filter(|s| !s.is_empty()) {
                    let message = format!(
                        "A {} is saved for {}@{} ({}). Reuse it for {} ({}), or enter a new one?",
                        kind,
                        meta.username,
                        meta.host,
                        meta.workspace_label,
                        identity.describe(),
                        identity.workspace.label
                    );
                    let choice = self
                        .prompter
                        .ask_choice(&message, &["Reuse saved", "Enter new"])
                        .await;
                    if choice == Some(REUSE) {
                        info!("User approved {} reuse for {}", kind, identity.describe());
                        self.save(identity, kind, &key, &old_secret);
                        return Ok(Some(old_secret));
                    }
                    declined_reuse = true;
                }
            }
        }

        let legacy = legacy_key(&identity.device_id, kind);
        let legacy_secret = if declined_reuse {
            None
        } else {
            self.store.get(&legacy)?.filter(|s| !s.is_empty())
        };
        if let Some(old_secret) = legacy_secret.as_ref() {
            let message = format!(
                "A {} saved by an earlier version exists for this device. Reuse it for {}?",
                kind,
                identity.describe()
            );
            let choice = self
                .prompter
                .ask_choice(&message, &["Reuse saved", "Enter new"])
                .await;
            if choice == Some(REUSE) {
                info!("Migrating legacy {} for device {}", kind, identity.device_id);
                self.save(identity, kind, &key, old_secret);
                if let Err(e) = self.store.delete(&legacy) {
                    warn!("Failed to delete legacy {} slot: {}", kind, e);
                }
                return Ok(Some(old_secret.clone()));
            }
        }

        let prompt = format!("Enter {} for {}", kind, identity.describe());
        let Some(secret) = self
            .prompter
            .ask_secret(&prompt)
            .await
            .filter(|s| !s.is_empty())
        else {
            info!("No {} entered for {}", kind, identity.describe());
            return Ok(None);
        };

        self.save(identity, kind, &key, &secret);
        if legacy_secret.is_some() {
            if let Err(e) = self.store.delete(&legacy) {
                warn!("Failed to delete legacy {} slot: {}", kind, e);
            }
        }
        Ok(Some(secret))
    }

    /// Drop the cached secret for `identity`, e.g. after the server rejected it.
    pub fn forget(&self, identity: &CredentialIdentity, kind: SecretKind) -> Result<(), KeychainError> {
        let key = scoped_key(identity, kind);
        self.store.delete(&key)?;
        if let Some(meta) = self.read_meta(&identity.device_id, kind)? {
            if meta.secret_store_key == key {
                self.store.delete(&meta_key(&identity.device_id, kind))?;
            }
        }
        info!("Forgot cached {} for {}", kind, identity.describe());
        Ok(())
    }

    fn read_meta(
        &self,
        device_id: &str,
        kind: SecretKind,
    ) -> Result<Option<CredentialCacheEntry>, KeychainError> {
        let Some(raw) = self.store.get(&meta_key(device_id, kind))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!("Ignoring unreadable credential metadata for {}: {}", device_id, e);
                Ok(None)
            }
        }
    }

    // Cache writes are best effort: a failing keychain must not block a connect.
    fn save(&self, identity: &CredentialIdentity, kind: SecretKind, key: &str, secret: &str) {
        if let Err(e) = self.store.store(key, secret) {
            warn!("Failed to cache {} for {}: {}", kind, identity.describe(), e);
            return;
        }
        self.write_meta(identity, kind, key);
    }

    fn write_meta(&self, identity: &CredentialIdentity, kind: SecretKind, key: &str) {
        let meta = CredentialCacheEntry {
            secret_store_key: key.to_string(),
            host: identity.host.clone(),
            username: identity.username.clone(),
            workspace_scope_id: identity.workspace.id.clone(),
            workspace_label: identity.workspace.label.clone(),
        };
        let result = serde_json::to_string(&meta)
            .map_err(|e| e.to_string())
            .and_then(|json| {
                self.store
                    .store(&meta_key(&identity.device_id, kind), &json)
                    .map_err(|e| e.to_string())
            });
        if let Err(e) = result {
            warn!("Failed to write credential metadata: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemorySecretStore;
    use crate::testing::ScriptedPrompter;

    fn identity(host: &str, user: &str, scope: &str) -> CredentialIdentity {
        CredentialIdentity {
            device_id: "dev-1".to_string(),
            host: host.to_string(),
            username: user.to_string(),
            workspace: WorkspaceScope::new(scope, format!("ws {}", scope)),
        }
    }

    fn resolver(
        store: Arc<MemorySecretStore>,
        prompter: Arc<ScriptedPrompter>,
    ) -> CredentialResolver {
        CredentialResolver::new(store, prompter)
    }

    #[tokio::test]
    async fn test_prompts_then_caches() {
        let store = Arc::new(MemorySecretStore::new());
        let prompter = Arc::new(ScriptedPrompter::new().secret("hunter2"));
        let r = resolver(store.clone(), prompter.clone());
        let id = identity("10.0.0.2", "root", "ws1");

        assert_eq!(r.resolve(&id, SecretKind::Password).await.unwrap().as_deref(), Some("hunter2"));
        // Second resolve hits the cache, no further prompt
        assert_eq!(r.resolve(&id, SecretKind::Password).await.unwrap().as_deref(), Some("hunter2"));
        assert_eq!(prompter.secret_prompts(), 1);
    }

    #[tokio::test]
    async fn test_cancel_returns_none() {
        let store = Arc::new(MemorySecretStore::new());
        let prompter = Arc::new(ScriptedPrompter::new());
        let r = resolver(store.clone(), prompter);

        let id = identity("10.0.0.2", "root", "ws1");
        assert_eq!(r.resolve(&id, SecretKind::Password).await.unwrap(), None);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_identity_change_requires_approval() {
        let store = Arc::new(MemorySecretStore::new());
        let first = Arc::new(ScriptedPrompter::new().secret("old-secret"));
        resolver(store.clone(), first)
            .resolve(&identity("10.0.0.2", "root", "ws1"), SecretKind::Password)
            .await
            .unwrap();

        // Host changed: user declines reuse and types a new secret
        let declining = Arc::new(ScriptedPrompter::new().choice(Some(1)).secret("new-secret"));
        let got = resolver(store.clone(), declining.clone())
            .resolve(&identity("10.0.0.9", "root", "ws1"), SecretKind::Password)
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("new-secret"));
        assert_eq!(declining.choice_prompts(), 1);

        // Username changed: user cancels the choice and the secret prompt
        let cancelling = Arc::new(ScriptedPrompter::new());
        let got = resolver(store.clone(), cancelling)
            .resolve(&identity("10.0.0.9", "admin", "ws1"), SecretKind::Password)
            .await
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_identity_change_with_approval_reuses() {
        let store = Arc::new(MemorySecretStore::new());
        resolver(store.clone(), Arc::new(ScriptedPrompter::new().secret("s3cret")))
            .resolve(&identity("10.0.0.2", "root", "ws1"), SecretKind::Password)
            .await
            .unwrap();

        let approving = Arc::new(ScriptedPrompter::new().choice(Some(0)));
        let other = identity("10.0.0.2", "root", "ws2");
        let got = resolver(store.clone(), approving.clone())
            .resolve(&other, SecretKind::Password)
            .await
            .unwrap();
        assert_eq!(got.as_deref(), Some("s3cret"));
        assert_eq!(approving.secret_prompts(), 0);
        assert_eq!(store.get(&scoped_key(&other, SecretKind::Password)).unwrap().as_deref(), Some("s3cret"));
    }

    #[tokio::test]
    async fn test_legacy_slot_migration() {
        let store = Arc::new(MemorySecretStore::new());
        store.store(&legacy_key("dev-1", SecretKind::Passphrase), "legacy").unwrap();

        let prompter = Arc::new(ScriptedPrompter::new().choice(Some(0)));
        let id = identity("10.0.0.2", "root", "ws1");
        let got = resolver(store.clone(), prompter)
            .resolve(&id, SecretKind::Passphrase)
            .await
            .unwrap();

        assert_eq!(got.as_deref(), Some("legacy"));
        assert_eq!(store.get(&legacy_key("dev-1", SecretKind::Passphrase)).unwrap(), None);
        assert_eq!(store.get(&scoped_key(&id, SecretKind::Passphrase)).unwrap().as_deref(), Some("legacy"));
    }

    #[tokio::test]
    async fn test_forget_forces_prompt() {
        let store = Arc::new(MemorySecretStore::new());
        let prompter = Arc::new(ScriptedPrompter::new().secret("one").secret("two"));
        let r = resolver(store, prompter.clone());
        let id = identity("10.0.0.2", "root", "ws1");

        r.resolve(&id, SecretKind::Password).await.unwrap();
        r.forget(&id, SecretKind::Password).unwrap();
        assert_eq!(r.resolve(&id, SecretKind::Password).await.unwrap().as_deref(), Some("two"));
        assert_eq!(prompter.secret_prompts(), 2);
    }

    #[test]
    fn test_key_changes_with_each_identity_field() {
        let base = scoped_key(&identity("h", "u", "w"), SecretKind::Password);
        assert_ne!(base, scoped_key(&identity("h2", "u", "w"), SecretKind::Password));
        assert_ne!(base, scoped_key(&identity("h", "u2", "w"), SecretKind::Password));
        assert_ne!(base, scoped_key(&identity("h", "u", "w2"), SecretKind::Password));
        assert_ne!(base, scoped_key(&identity("h", "u", "w"), SecretKind::Passphrase));
        assert!(base.ends_with(":dev-1"));
    }
}
