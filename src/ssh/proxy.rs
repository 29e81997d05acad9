//! Dialing: direct and bastion-tunneled connections
//!
//! A tunneled dial is two handshake stages composed:
//! ```text
//! Client --SSH--> [Bastion] --direct-tcpip--> [Target]
//! ```
//! The bastion stage runs over TCP. Its direct-tcpip channel is wrapped as a
//! `ChannelStream` and handed to the target stage, which runs its own
//! handshake and host key check over it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::client::{client_config, dial_tcp, handshake, HopSpec};
use super::config::EndpointLabel;
use super::error::SshError;
use super::fingerprint::Fingerprint;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::transport::{RusshTransport, Transport};

/// Everything needed to reach one endpoint
#[derive(Debug, Clone)]
pub struct DialPlan {
    pub target: HopSpec,
    pub bastion: Option<HopSpec>,
    pub timeout: Duration,
    pub keepalive: Option<Duration>,
}

/// A successful dial
pub struct DialOutcome {
    pub transport: Arc<dyn Transport>,
    /// Fingerprint observed on each hop, bastion first
    pub observed: Vec<(EndpointLabel, Fingerprint)>,
}

/// Opens authenticated transports
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, plan: &DialPlan) -> Result<DialOutcome, SshError>;
}

/// [`Dialer`] over russh
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshDialer;

impl RusshDialer {
    pub fn new() -> Self {
        Self
    }

    async fn dial_direct(&self, plan: &DialPlan) -> Result<DialOutcome, SshError> {
        let target = &plan.target;
        let config = client_config(plan.keepalive);
        let stream = dial_tcp(target, plan.timeout).await?;
        let stage = handshake(target, stream, config, plan.timeout).await?;

        let name = format!("{}@{}", target.username, target.address());
        let controller = spawn_handle_owner_task(stage.handle, name.clone());
        Ok(DialOutcome {
            transport: Arc::new(RusshTransport::new(target.label, name, controller, None)),
            observed: vec![(target.label, stage.observed)],
        })
    }

    async fn dial_tunneled(&self, bastion: &HopSpec, plan: &DialPlan) -> Result<DialOutcome, SshError> {
        let target = &plan.target;
        let config = client_config(plan.keepalive);
        info!(
            "Connecting to {} via bastion {}@{}",
            target.address(),
            bastion.username,
            bastion.address()
        );

        let stream = dial_tcp(bastion, plan.timeout).await?;
        let bastion_stage = handshake(bastion, stream, config.clone(), plan.timeout).await?;
        let bastion_name = format!("{}@{}", bastion.username, bastion.address());
        let bastion_controller = spawn_handle_owner_task(bastion_stage.handle, bastion_name);

        let target_stage = match self
            .target_over_bastion(&bastion_controller, target, config, plan.timeout)
            .await
        {
            Ok(stage) => stage,
            Err(e) => {
                bastion_controller.disconnect().await;
                return Err(e);
            }
        };

        let name = format!("{}@{} via {}", target.username, target.address(), bastion.host);
        let controller = spawn_handle_owner_task(target_stage.handle, name.clone());
        info!("Target connection established through bastion");

        Ok(DialOutcome {
            transport: Arc::new(RusshTransport::new(
                target.label,
                name,
                controller,
                Some(bastion_controller),
            )),
            observed: vec![
                (bastion.label, bastion_stage.observed),
                (target.label, target_stage.observed),
            ],
        })
    }

    async fn target_over_bastion(
        &self,
        bastion: &HandleController,
        target: &HopSpec,
        config: Arc<russh::client::Config>,
        timeout: Duration,
    ) -> Result<super::client::Handshake, SshError> {
        let channel = tokio::time::timeout(
            timeout,
            bastion.open_direct_tcpip(&target.host, u32::from(target.port), "127.0.0.1", 0),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Tunnel to {} timed out", target.address())))??;

        handshake(target, channel.into_stream(), config, timeout).await
    }
}

#[async_trait]
impl Dialer for RusshDialer {
    async fn dial(&self, plan: &DialPlan) -> Result<DialOutcome, SshError> {
        match &plan.bastion {
            Some(bastion) => self.dial_tunneled(bastion, plan).await,
            None => self.dial_direct(plan).await,
        }
    }
}
