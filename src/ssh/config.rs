//! Device target configuration

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Which hop of a connection an endpoint (and its pinned fingerprint) belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointLabel {
    Primary,
    Secondary,
    Bastion,
}

impl fmt::Display for EndpointLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointLabel::Primary => write!(f, "primary"),
            EndpointLabel::Secondary => write!(f, "secondary"),
            EndpointLabel::Bastion => write!(f, "bastion"),
        }
    }
}

/// Authentication methods supported for a device or bastion.
///
/// Secrets themselves never live in the configuration; they are resolved
/// through the credential cache at connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// Password authentication
    #[default]
    Password,

    /// SSH key authentication
    PrivateKey {
        /// Path to private key file
        key_path: String,
        /// Whether the key is encrypted and needs a passphrase
        #[serde(default)]
        encrypted: bool,
    },
}

/// Configuration for the bastion (jump) host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionConfig {
    /// Jump host address
    pub host: String,

    /// Jump host port (default: 22)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username for the jump host
    pub username: String,

    /// Authentication method for the jump host
    #[serde(default)]
    pub auth: AuthConfig,

    /// Pinned host key fingerprint of the jump host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// A remote device as stored in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    /// Stable identifier used for credential and fingerprint bookkeeping
    pub id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Primary host address
    pub host: String,

    /// Failover host, tried only after the primary fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_host: Option<String>,

    /// SSH port (default: 22)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    #[serde(default)]
    pub auth: AuthConfig,

    /// Pinned fingerprint of the primary host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_fingerprint: Option<String>,

    /// Pinned fingerprint of the secondary host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_fingerprint: Option<String>,

    /// Optional jump host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bastion: Option<BastionConfig>,

    /// Command streamed by log sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Directory an interactive shell is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

/// One connectable host derived from a [`DeviceTarget`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEndpoint {
    pub label: EndpointLabel,
    pub host: String,
    pub port: u16,
    pub fingerprint: Option<String>,
}

impl HostEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub(crate) fn default_port() -> u16 {
    22
}

impl DeviceTarget {
    pub fn new(id: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            host: host.into(),
            secondary_host: None,
            port: None,
            username: username.into(),
            auth: AuthConfig::Password,
            host_fingerprint: None,
            secondary_fingerprint: None,
            bastion: None,
            command: None,
            working_directory: None,
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.username, self.host))
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(default_port)
    }

    /// Ordered endpoint list: primary, then the optional failover host
    pub fn endpoints(&self) -> Vec<HostEndpoint> {
        let mut endpoints = vec![HostEndpoint {
            label: EndpointLabel::Primary,
            host: self.host.trim().to_string(),
            port: self.port(),
            fingerprint: self.host_fingerprint.clone(),
        }];
        if let Some(secondary) = self
            .secondary_host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
        {
            endpoints.push(HostEndpoint {
                label: EndpointLabel::Secondary,
                host: secondary.to_string(),
                port: self.port(),
                fingerprint: self.secondary_fingerprint.clone(),
            });
        }
        endpoints
    }

    pub fn bastion_endpoint(&self) -> Option<HostEndpoint> {
        self.bastion.as_ref().map(|b| HostEndpoint {
            label: EndpointLabel::Bastion,
            host: b.host.trim().to_string(),
            port: b.port.unwrap_or_else(default_port),
            fingerprint: b.fingerprint.clone(),
        })
    }

    pub fn fingerprint_for(&self, label: EndpointLabel) -> Option<&str> {
        match label {
            EndpointLabel::Primary => self.host_fingerprint.as_deref(),
            EndpointLabel::Secondary => self.secondary_fingerprint.as_deref(),
            EndpointLabel::Bastion => self.bastion.as_ref().and_then(|b| b.fingerprint.as_deref()),
        }
    }

    /// Replace the pinned fingerprint of one hop in memory.
    ///
    /// Callers persist first (see `FingerprintStore::update_fingerprint`).
    pub fn set_fingerprint(&mut self, label: EndpointLabel, value: String) {
        match label {
            EndpointLabel::Primary => self.host_fingerprint = Some(value),
            EndpointLabel::Secondary => self.secondary_fingerprint = Some(value),
            EndpointLabel::Bastion => {
                if let Some(bastion) = self.bastion.as_mut() {
                    bastion.fingerprint = Some(value);
                }
            }
        }
    }

    /// Check host, username and port of the target and its bastion.
    pub fn validate(&self) -> Result<(), SshError> {
        validate_hop("device", &self.host, &self.username, self.port)?;
        if let Some(secondary) = &self.secondary_host {
            if !secondary.trim().is_empty() && secondary.trim().contains(char::is_whitespace) {
                return Err(SshError::InvalidConfiguration(format!(
                    "secondary host {:?} contains whitespace",
                    secondary
                )));
            }
        }
        if let Some(bastion) = &self.bastion {
            validate_hop("bastion", &bastion.host, &bastion.username, bastion.port)?;
        }
        Ok(())
    }
}

fn validate_hop(what: &str, host: &str, username: &str, port: Option<u16>) -> Result<(), SshError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(SshError::InvalidConfiguration(format!("{} host is empty", what)));
    }
    if host.contains(char::is_whitespace) {
        return Err(SshError::InvalidConfiguration(format!(
            "{} host {:?} contains whitespace",
            what, host
        )));
    }
    if username.trim().is_empty() {
        return Err(SshError::InvalidConfiguration(format!(
            "{} username is empty",
            what
        )));
    }
    if port == Some(0) {
        return Err(SshError::InvalidConfiguration(format!(
            "{} port must be a positive integer",
            what
        )));
    }
    Ok(())
}

/// Reject commands containing line breaks.
///
/// Only `\r` and `\n` are refused; shell metacharacters pass through untouched.
pub fn validate_command(command: &str) -> Result<(), SshError> {
    if command.trim().is_empty() {
        return Err(SshError::InvalidCommand("command is empty".to_string()));
    }
    if command.contains(['\r', '\n']) {
        return Err(SshError::InvalidCommand(
            "command must not contain line breaks".to_string(),
        ));
    }
    Ok(())
}
