//! Transport connector
//!
//! Turns a [`DeviceTarget`] into an authenticated [`Transport`]: validate,
//! resolve credentials, then dial each configured endpoint in turn with host
//! key verification on every hop.

use std::sync::Arc;

use tracing::{info, warn};

use super::client::{HopAuth, HopSpec};
use super::config::{validate_command, AuthConfig, DeviceTarget, EndpointLabel, HostEndpoint};
use super::error::SshError;
use super::fingerprint::Fingerprint;
use super::host_keys::FingerprintStore;
use super::proxy::{DialPlan, Dialer};
use super::transport::Transport;
use crate::config::{CredentialIdentity, CredentialResolver, SecretKind, Settings, WorkspaceScope};
use crate::prompt::Prompter;

/// Total dial attempts when a failover endpoint exists
const MULTI_ENDPOINT_ATTEMPTS: usize = 3;

/// User-approved pin updates allowed within one `connect` call
pub const MAX_HOST_KEY_UPDATES: usize = 3;

const UPDATE_PIN: usize = 0;

/// Resolved secret plus the identity it was cached under
struct HopCredential {
    auth: HopAuth,
    identity: CredentialIdentity,
    kind: Option<SecretKind>,
}

pub struct TransportConnector {
    dialer: Arc<dyn Dialer>,
    credentials: Arc<CredentialResolver>,
    fingerprints: FingerprintStore,
    prompter: Arc<dyn Prompter>,
    workspace: WorkspaceScope,
    settings: Settings,
}

impl TransportConnector {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        credentials: Arc<CredentialResolver>,
        fingerprints: FingerprintStore,
        prompter: Arc<dyn Prompter>,
        workspace: WorkspaceScope,
        settings: Settings,
    ) -> Self {
        Self {
            dialer,
            credentials,
            fingerprints,
            prompter,
            workspace,
            settings,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Validate `command`, then connect.
    pub async fn connect_for_command(
        &self,
        target: &mut DeviceTarget,
        command: &str,
    ) -> Result<Arc<dyn Transport>, SshError> {
        validate_command(command)?;
        self.connect(target).await
    }

    /// Connect to the first reachable endpoint of `target`.
    ///
    /// Pinned fingerprints learned or replaced along the way are persisted and
    /// written into `target`, so later reconnects use them.
    pub async fn connect(&self, target: &mut DeviceTarget) -> Result<Arc<dyn Transport>, SshError> {
        target.validate()?;
        let endpoints = target.endpoints();
        for endpoint in &endpoints {
            FingerprintStore::pinned(target, endpoint.label)?;
        }
        let bastion_endpoint = target.bastion_endpoint();
        if bastion_endpoint.is_some() {
            FingerprintStore::pinned(target, EndpointLabel::Bastion)?;
        }

        let target_cred = self.resolve_hop(&target.id, &target.host, &target.username, &target.auth).await?;
        let bastion_cred = match &target.bastion {
            Some(bastion) => Some(
                self.resolve_hop(
                    &format!("{}/bastion", target.id),
                    &bastion.host,
                    &bastion.username,
                    &bastion.auth,
                )
                .await?,
            ),
            None => None,
        };

        let attempts = if endpoints.len() > 1 {
            MULTI_ENDPOINT_ATTEMPTS
        } else {
            1
        };
        let mut attempt = 0;
        let mut updates = 0;
        let mut last_error = None;

        while attempt < attempts {
            let endpoint = &endpoints[attempt % endpoints.len()];
            let plan = DialPlan {
                target: HopSpec {
                    label: endpoint.label,
                    host: endpoint.host.clone(),
                    port: endpoint.port,
                    username: target.username.clone(),
                    auth: target_cred.auth.clone(),
                    expected: FingerprintStore::pinned(target, endpoint.label)?,
                },
                bastion: match (&bastion_endpoint, &target.bastion, &bastion_cred) {
                    (Some(hop), Some(config), Some(cred)) => Some(self.bastion_hop(target, hop, &config.username, cred)?),
                    _ => None,
                },
                timeout: self.settings.connect_timeout(),
                keepalive: self.settings.keepalive_interval(),
            };

            info!(
                "Connect attempt {}/{} for {} via {} endpoint {}",
                attempt + 1,
                attempts,
                target.display_name(),
                endpoint.label,
                endpoint.address()
            );

            match self.dialer.dial(&plan).await {
                Ok(outcome) => {
                    for (label, observed) in &outcome.observed {
                        self.capture_first_use(target, *label, observed).await;
                    }
                    info!("Connected to {} via {} endpoint", target.display_name(), endpoint.label);
                    return Ok(outcome.transport);
                }
                Err(mismatch @ SshError::HostKeyMismatch { .. }) => {
                    if updates >= MAX_HOST_KEY_UPDATES {
                        warn!("Giving up after {} host key updates", updates);
                        return Err(mismatch);
                    }
                    if !self.approve_update(&mismatch).await {
                        info!("User kept the pinned fingerprint; aborting connect");
                        return Err(mismatch);
                    }
                    if let SshError::HostKeyMismatch { label, received, .. } = &mismatch {
                        let fingerprint = Fingerprint::parse(received).map_err(|_| {
                            SshError::InvalidFingerprintFormat {
                                label: *label,
                                value: received.clone(),
                            }
                        })?;
                        self.fingerprints
                            .update_fingerprint(target, *label, &fingerprint)
                            .await?;
                    }
                    updates += 1;
                    // Same endpoint again; rotation budget untouched
                }
                Err(e @ (SshError::AuthenticationFailed(_) | SshError::KeyError(_))) => {
                    warn!("Authentication to {} failed: {}", target.display_name(), e);
                    self.forget(&target_cred);
                    if let Some(cred) = &bastion_cred {
                        self.forget(cred);
                    }
                    return Err(match e {
                        SshError::KeyError(msg) => SshError::AuthenticationFailed(msg),
                        other => other,
                    });
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        "Attempt {} to {} endpoint {} failed: {}",
                        attempt + 1,
                        endpoint.label,
                        endpoint.address(),
                        e
                    );
                    last_error = Some(e);
                    attempt += 1;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SshError::ConnectionFailed(format!("No endpoint of {} reachable", target.display_name()))
        }))
    }

    fn bastion_hop(
        &self,
        target: &DeviceTarget,
        endpoint: &HostEndpoint,
        username: &str,
        cred: &HopCredential,
    ) -> Result<HopSpec, SshError> {
        Ok(HopSpec {
            label: EndpointLabel::Bastion,
            host: endpoint.host.clone(),
            port: endpoint.port,
            username: username.to_string(),
            auth: cred.auth.clone(),
            expected: FingerprintStore::pinned(target, EndpointLabel::Bastion)?,
        })
    }

    async fn resolve_hop(
        &self,
        device_id: &str,
        host: &str,
        username: &str,
        auth: &AuthConfig,
    ) -> Result<HopCredential, SshError> {
        let identity = CredentialIdentity {
            device_id: device_id.to_string(),
            host: host.trim().to_string(),
            username: username.to_string(),
            workspace: self.workspace.clone(),
        };
        match auth {
            AuthConfig::Password => {
                let password = self
                    .credentials
                    .resolve(&identity, SecretKind::Password)
                    .await?
                    .ok_or_else(|| {
                        SshError::AuthenticationFailed(format!(
                            "No password provided for {}@{}",
                            username, host
                        ))
                    })?;
                Ok(HopCredential {
                    auth: HopAuth::Password(password),
                    identity,
                    kind: Some(SecretKind::Password),
                })
            }
            AuthConfig::PrivateKey {
                key_path,
                encrypted,
            } => {
                let passphrase = if *encrypted {
                    Some(
                        self.credentials
                            .resolve(&identity, SecretKind::Passphrase)
                            .await?
                            .ok_or_else(|| {
                                SshError::AuthenticationFailed(format!(
                                    "No passphrase provided for {}",
                                    key_path
                                ))
                            })?,
                    )
                } else {
                    None
                };
                Ok(HopCredential {
                    auth: HopAuth::Key {
                        key_path: key_path.clone(),
                        passphrase,
                    },
                    identity,
                    kind: encrypted.then_some(SecretKind::Passphrase),
                })
            }
        }
    }

    fn forget(&self, cred: &HopCredential) {
        if let Some(kind) = cred.kind {
            if let Err(e) = self.credentials.forget(&cred.identity, kind) {
                warn!("Failed to forget cached {}: {}", kind, e);
            }
        }
    }

    async fn approve_update(&self, mismatch: &SshError) -> bool {
        let message = format!(
            "{}. Update the pinned fingerprint to the received value and continue?",
            mismatch
        );
        self.prompter
            .ask_choice(&message, &["Update fingerprint and continue", "Abort"])
            .await
            == Some(UPDATE_PIN)
    }

    async fn capture_first_use(
        &self,
        target: &mut DeviceTarget,
        label: EndpointLabel,
        observed: &Fingerprint,
    ) {
        if target.fingerprint_for(label).is_some() {
            return;
        }
        info!("Trust on first use: pinning {} fingerprint {}", label, observed);
        if let Err(e) = self
            .fingerprints
            .update_fingerprint(target, label, observed)
            .await
        {
            // Still pin for this session so reconnects verify against it
            warn!("Failed to persist {} fingerprint: {}", label, e);
            target.set_fingerprint(label, observed.display().to_string());
        }
    }
}
