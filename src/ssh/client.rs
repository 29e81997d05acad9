//! SSH handshake stage using russh
//!
//! One stage = SSH handshake + host key check + authentication over any
//! byte stream. A direct connection runs it over a `TcpStream`; a tunneled
//! connection runs it over the `ChannelStream` of a bastion's direct-tcpip
//! channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::config::EndpointLabel;
use super::error::SshError;
use super::fingerprint::{verify, Fingerprint, HostKeyVerification};

/// Authentication material for one hop, already resolved
#[derive(Clone)]
pub enum HopAuth {
    Password(String),
    Key {
        key_path: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for HopAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HopAuth::Password(_) => f.write_str("Password(..)"),
            HopAuth::Key {
                key_path,
                passphrase,
            } => f
                .debug_struct("Key")
                .field("key_path", key_path)
                .field("passphrase", &passphrase.as_ref().map(|_| ".."))
                .finish(),
        }
    }
}

/// One hop of a dial plan
#[derive(Debug, Clone)]
pub struct HopSpec {
    pub label: EndpointLabel,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: HopAuth,
    /// Pinned fingerprint; `None` means trust on first use
    pub expected: Option<Fingerprint>,
}

impl HopSpec {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// russh callback handler verifying the server key of one hop
pub struct ClientHandler {
    label: EndpointLabel,
    host: String,
    port: u16,
    expected: Option<Fingerprint>,
    observed: Arc<Mutex<Option<Fingerprint>>>,
}

impl ClientHandler {
    fn new(hop: &HopSpec, observed: Arc<Mutex<Option<Fingerprint>>>) -> Self {
        Self {
            label: hop.label,
            host: hop.host.clone(),
            port: hop.port,
            expected: hop.expected.clone(),
            observed,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let observed = Fingerprint::of_key_bytes(&server_public_key.public_key_bytes());
        *self.observed.lock() = Some(observed.clone());

        match verify(&observed, self.expected.as_ref()) {
            HostKeyVerification::Verified => {
                info!(
                    "Host key verified for {} endpoint {}:{}",
                    self.label, self.host, self.port
                );
                Ok(true)
            }
            HostKeyVerification::FirstUse => {
                info!(
                    "No pinned key for {} endpoint {}:{}, observed {}",
                    self.label, self.host, self.port, observed
                );
                Ok(true)
            }
            HostKeyVerification::Mismatch { expected, received } => {
                warn!(
                    "HOST KEY MISMATCH for {} endpoint {}:{}: expected {}, got {}",
                    self.label, self.host, self.port, expected, received
                );
                Err(SshError::HostKeyMismatch {
                    label: self.label,
                    host: self.host.clone(),
                    expected: expected.display().to_string(),
                    received: received.display().to_string(),
                })
            }
        }
    }
}

/// A completed, authenticated stage
pub struct Handshake {
    pub handle: Handle<ClientHandler>,
    pub observed: Fingerprint,
}

/// russh client configuration shared by every stage
pub fn client_config(keepalive: Option<Duration>) -> Arc<client::Config> {
    Arc::new(client::Config {
        // Liveness comes from keepalives and the owner task's polling
        inactivity_timeout: None,
        keepalive_interval: keepalive,
        keepalive_max: 3,
        ..Default::default()
    })
}

/// Open a TCP connection to the hop, bounded by `timeout`.
pub async fn dial_tcp(hop: &HopSpec, timeout: Duration) -> Result<TcpStream, SshError> {
    let addr = hop.address();
    info!("Connecting to {} endpoint at {}", hop.label, addr);
    tokio::time::timeout(timeout, TcpStream::connect((hop.host.as_str(), hop.port)))
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| SshError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e)))
}

/// Run the SSH handshake and authentication for `hop` over `stream`.
pub async fn handshake<S>(
    hop: &HopSpec,
    stream: S,
    config: Arc<client::Config>,
    timeout: Duration,
) -> Result<Handshake, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let observed_slot = Arc::new(Mutex::new(None));
    let handler = ClientHandler::new(hop, observed_slot.clone());

    let mut handle = tokio::time::timeout(timeout, client::connect_stream(config, stream, handler))
        .await
        .map_err(|_| SshError::Timeout(format!("SSH handshake with {} timed out", hop.address())))??;

    debug!("SSH handshake with {} completed", hop.address());

    let observed = observed_slot.lock().take().ok_or_else(|| {
        SshError::ConnectionFailed(format!("{} presented no host key", hop.address()))
    })?;

    tokio::time::timeout(timeout, authenticate(&mut handle, hop))
        .await
        .map_err(|_| SshError::Timeout(format!("Authentication to {} timed out", hop.address())))??;

    Ok(Handshake { handle, observed })
}

async fn authenticate(handle: &mut Handle<ClientHandler>, hop: &HopSpec) -> Result<(), SshError> {
    let result = match &hop.auth {
        HopAuth::Password(password) => {
            info!("Authenticating to {} with password", hop.address());
            handle
                .authenticate_password(&hop.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        HopAuth::Key {
            key_path,
            passphrase,
        } => {
            let path = expand_tilde(key_path);
            info!("Authenticating to {} with key: {}", hop.address(), path);
            let key = russh::keys::load_secret_key(&path, passphrase.as_deref())?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&hop.username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
    };

    if !result.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "Authentication to {}@{} rejected",
            hop.username, hop.host
        )));
    }
    info!("Authenticated to {}@{}", hop.username, hop.address());
    Ok(())
}

/// Expand `~` to the home directory; russh::keys does not.
pub fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}
