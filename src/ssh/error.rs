//! SSH Error types

use thiserror::Error;

use super::config::EndpointLabel;
use crate::config::{KeychainError, StorageError};

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("No host key fingerprint given for the {0} endpoint")]
    MissingFingerprint(EndpointLabel),

    #[error("Invalid host key fingerprint for the {label} endpoint: {value:?} (expected SHA256:<base64> or 64 hex digits)")]
    InvalidFingerprintFormat { label: EndpointLabel, value: String },

    #[error(
        "Host key mismatch for {label} endpoint {host}: expected {expected}, received {received}"
    )]
    HostKeyMismatch {
        label: EndpointLabel,
        host: String,
        expected: String,
        received: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Remote operation failed: {0}")]
    RemoteOperationFailed(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration store error: {0}")]
    Storage(#[from] StorageError),

    #[error("Secret store error: {0}")]
    Secret(#[from] KeychainError),

    #[error("Session disposed")]
    Disposed,
}

impl SshError {
    /// Whether the reconnect supervisor may schedule another attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshError::ConnectionFailed(_)
                | SshError::Timeout(_)
                | SshError::TransportClosed(_)
                | SshError::ChannelError(_)
                | SshError::IoError(_)
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect | russh::Error::HUP => {
                SshError::TransportClosed(err.to_string())
            }
            other => SshError::ConnectionFailed(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
