//! Pinned host key bookkeeping
//!
//! Pins live on the [`DeviceTarget`] (one per hop). Reading a pin parses it;
//! updating a pin writes through to the configuration store first and only
//! then touches the in-memory target.

use std::sync::Arc;

use tracing::{info, warn};

use super::config::{DeviceTarget, EndpointLabel};
use super::error::SshError;
use super::fingerprint::{Fingerprint, FingerprintError};
use crate::config::{write_fingerprint, ConfigScope, ConfigStore};

/// Reads and persists the pinned fingerprints of a device
#[derive(Clone)]
pub struct FingerprintStore {
    config: Arc<dyn ConfigStore>,
}

impl FingerprintStore {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self { config }
    }

    /// Parsed pin for one hop.
    ///
    /// An absent pin is `Ok(None)` (trust on first use). A pin that is present
    /// but blank or malformed is an error: the hop must not be contacted.
    pub fn pinned(
        device: &DeviceTarget,
        label: EndpointLabel,
    ) -> Result<Option<Fingerprint>, SshError> {
        let Some(raw) = device.fingerprint_for(label) else {
            return Ok(None);
        };
        match Fingerprint::parse(raw) {
            Ok(fp) => Ok(Some(fp)),
            Err(FingerprintError::Missing) => Err(SshError::MissingFingerprint(label)),
            Err(FingerprintError::InvalidFormat(value)) => {
                warn!("Malformed {} fingerprint for device {}", label, device.id);
                Err(SshError::InvalidFingerprintFormat { label, value })
            }
        }
    }

    /// Persist a new pin for `label`, then mirror it into `device`.
    pub async fn update_fingerprint(
        &self,
        device: &mut DeviceTarget,
        label: EndpointLabel,
        fingerprint: &Fingerprint,
    ) -> Result<ConfigScope, SshError> {
        let scope =
            write_fingerprint(self.config.as_ref(), device, label, fingerprint.display()).await?;
        device.set_fingerprint(label, fingerprint.display().to_string());
        info!(
            "Pinned {} fingerprint {} for device {}",
            label, fingerprint, device.id
        );
        Ok(scope)
    }
}
