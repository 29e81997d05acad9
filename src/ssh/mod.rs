//! SSH module - connection establishment and transports
//!
//! This module provides the core SSH functionality using the russh library.
//!
//! # Features
//! - Direct and bastion-tunneled (direct-tcpip) connections
//! - Pinned host key fingerprints with trust on first use
//! - Failover across a primary and secondary endpoint
//! - Single-owner handle task with liveness polling

mod client;
mod config;
mod connector;
mod error;
mod fingerprint;
mod handle_owner;
mod host_keys;
mod proxy;
mod transport;

pub use client::{expand_tilde, ClientHandler, HopAuth, HopSpec};
pub use config::{
    validate_command, AuthConfig, BastionConfig, DeviceTarget, EndpointLabel, HostEndpoint,
};
pub use connector::{TransportConnector, MAX_HOST_KEY_UPDATES};
pub use error::SshError;
pub use fingerprint::{verify, Fingerprint, FingerprintError, HostKeyVerification};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use host_keys::FingerprintStore;
pub use proxy::{DialOutcome, DialPlan, Dialer, RusshDialer};
pub use transport::{
    exec_on, ChannelCommand, ChannelEvent, ChannelIo, ChannelWriter, ExecOutput, PtySize,
    RusshTransport, Transport,
};
