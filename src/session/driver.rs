//! Connection lifecycle shared by every session facade
//!
//! A [`SessionDriver`] runs one task per session:
//!
//! ```text
//! connect ──ok──> activity.run() ──ends──> supervisor ──trigger──> connect
//!    └──err──> supervisor ───────────────────────trigger──────────────┘
//! ```
//!
//! What happens while connected is the facade's business ([`SessionActivity`]);
//! state transitions, close de-duplication, disposal and the reconnect
//! countdown are handled here the same way for all of them.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{CloseGuard, EventSink};
use super::reconnect::ReconnectSupervisor;
use super::state::LifecycleState;
use crate::ssh::{validate_command, DeviceTarget, SshError, Transport, TransportConnector};

/// How an activity ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEnd {
    /// The connection or channel was lost; `failover` asks for a reconnect
    /// even with auto-reconnect off
    Lost { reason: String, failover: bool },
    /// Terminal end; the session stays disconnected
    Finished { reason: String },
}

/// What is available to an activity while it runs
pub struct ActivityContext {
    pub sink: EventSink,
    pub supervisor: ReconnectSupervisor,
    /// Number of configured endpoints of the target
    pub endpoint_count: usize,
}

/// The facade-specific part of a session
#[async_trait]
pub trait SessionActivity: Send + Sync + 'static {
    /// Command to validate before connecting, if the activity runs one
    fn command(&self) -> Option<&str> {
        None
    }

    /// Set up on a fresh connection before it is reported as connected.
    async fn prepare(&self, _transport: &Arc<dyn Transport>) -> Result<(), SshError> {
        Ok(())
    }

    /// Use the connection until it ends.
    async fn run(
        &self,
        transport: Arc<dyn Transport>,
        ctx: &ActivityContext,
    ) -> Result<ActivityEnd, SshError>;

    /// Called after the transport of a finished run has been released
    fn detached(&self) {}
}

pub struct SessionDriver {
    connector: Arc<TransportConnector>,
    activity: Arc<dyn SessionActivity>,
    sink: EventSink,
    supervisor: ReconnectSupervisor,
    cancel: CancellationToken,
    /// Taken by the task on `start`
    startup: Mutex<Option<(DeviceTarget, mpsc::UnboundedReceiver<()>)>>,
    transport: Arc<Mutex<Option<Arc<dyn Transport>>>>,
    endpoint_count: usize,
    name: String,
}

impl SessionDriver {
    pub fn new(
        connector: Arc<TransportConnector>,
        target: DeviceTarget,
        activity: Arc<dyn SessionActivity>,
        sink: EventSink,
        inline_banner: bool,
    ) -> Self {
        let (supervisor, triggers) = ReconnectSupervisor::new(connector.settings(), sink.clone());
        let supervisor = if inline_banner {
            supervisor.with_inline_banner()
        } else {
            supervisor
        };
        Self {
            connector,
            activity,
            sink,
            supervisor,
            cancel: CancellationToken::new(),
            endpoint_count: target.endpoints().len(),
            name: target.display_name(),
            startup: Mutex::new(Some((target, triggers))),
            transport: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.supervisor.state()
    }

    pub fn supervisor(&self) -> &ReconnectSupervisor {
        &self.supervisor
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Validate the target and start connecting in the background.
    ///
    /// Configuration and command errors are returned here, before any
    /// network activity. Calling `start` again is a no-op.
    pub fn start(&self) -> Result<(), SshError> {
        if self.is_disposed() {
            return Err(SshError::Disposed);
        }
        let mut startup = self.startup.lock();
        let Some((target, _)) = startup.as_ref() else {
            debug!("Session {} already started", self.name);
            return Ok(());
        };
        target.validate()?;
        if let Some(command) = self.activity.command() {
            validate_command(command)?;
        }
        let Some((target, triggers)) = startup.take() else {
            return Ok(());
        };

        let task = DriverTask {
            connector: self.connector.clone(),
            activity: self.activity.clone(),
            sink: self.sink.clone(),
            supervisor: self.supervisor.clone(),
            cancel: self.cancel.clone(),
            transport: self.transport.clone(),
            endpoint_count: self.endpoint_count,
        };
        tokio::spawn(task.run(target, triggers));
        Ok(())
    }

    /// Drop the connection and stay disconnected until [`reconnect`](Self::reconnect).
    pub async fn disconnect(&self) {
        self.supervisor.user_disconnect();
        self.close_transport().await;
    }

    /// Connect again now, skipping any countdown.
    pub async fn reconnect(&self) {
        if self.supervisor.user_reconnect() {
            self.close_transport().await;
        }
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.supervisor.set_auto_reconnect(enabled);
    }

    /// Tear everything down. No event is delivered after this returns.
    pub async fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!("Disposing session {}", self.name);
        self.cancel.cancel();
        self.supervisor.dispose();
        self.sink.close();
        self.close_transport().await;
    }

    async fn close_transport(&self) {
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.close().await;
        }
    }
}

impl Drop for SessionDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.supervisor.dispose();
        self.sink.close();
    }
}

struct DriverTask {
    connector: Arc<TransportConnector>,
    activity: Arc<dyn SessionActivity>,
    sink: EventSink,
    supervisor: ReconnectSupervisor,
    cancel: CancellationToken,
    transport: Arc<Mutex<Option<Arc<dyn Transport>>>>,
    endpoint_count: usize,
}

impl DriverTask {
    async fn run(self, mut target: DeviceTarget, mut triggers: mpsc::UnboundedReceiver<()>) {
        let name = target.display_name();
        let close_guard = CloseGuard::new();
        let ctx = ActivityContext {
            sink: self.sink.clone(),
            supervisor: self.supervisor.clone(),
            endpoint_count: self.endpoint_count,
        };
        info!("Session task started for {}", name);

        loop {
            if !self
                .supervisor
                .begin_connect(&format!("Connecting to {}", name))
            {
                break;
            }

            // Not raced against cancellation: a connect that completes after
            // dispose is closed right here instead of being abandoned mid-handshake
            let result = match self.activity.command() {
                Some(command) => self.connector.connect_for_command(&mut target, command).await,
                None => self.connector.connect(&mut target).await,
            };

            match result {
                Err(e) => {
                    warn!("Connect to {} failed: {}", name, e);
                    self.sink.error(e.to_string());
                    self.supervisor.connect_failed(&e);
                }
                Ok(transport) if self.cancel.is_cancelled() => {
                    info!("Session for {} disposed during connect; closing transport", name);
                    transport.close().await;
                    break;
                }
                Ok(transport) if self.supervisor.is_suppressed() => {
                    info!("Disconnect requested during connect to {}", name);
                    transport.close().await;
                }
                Ok(transport) => {
                    *self.transport.lock() = Some(transport.clone());
                    if let Err(e) = self.activity.prepare(&transport).await {
                        warn!("Session setup on {} failed: {}", name, e);
                        self.transport.lock().take();
                        transport.close().await;
                        self.activity.detached();
                        self.sink.error(e.to_string());
                        self.supervisor.connect_failed(&e);
                        if !self.wait_for_trigger(&mut triggers).await {
                            break;
                        }
                        continue;
                    }
                    close_guard.arm();
                    self.supervisor.connected(&format!(
                        "Connected to {} ({} endpoint)",
                        name,
                        transport.endpoint()
                    ));

                    let end = tokio::select! {
                        _ = self.cancel.cancelled() => None,
                        end = self.activity.run(transport.clone(), &ctx) => Some(end),
                    };

                    self.transport.lock().take();
                    transport.close().await;
                    self.activity.detached();

                    let Some(end) = end else { break };
                    match end {
                        Ok(ActivityEnd::Lost { reason, failover }) => {
                            close_guard.fire(&self.sink, &reason);
                            self.supervisor.connection_lost(&reason, failover);
                        }
                        Ok(ActivityEnd::Finished { reason }) => {
                            close_guard.fire(&self.sink, &reason);
                            self.supervisor.finished(&reason);
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            self.sink.error(reason.clone());
                            close_guard.fire(&self.sink, &reason);
                            if e.is_retryable() {
                                self.supervisor
                                    .connection_lost(&reason, self.endpoint_count > 1);
                            } else {
                                self.supervisor.connect_failed(&e);
                            }
                        }
                    }
                }
            }

            if !self.wait_for_trigger(&mut triggers).await {
                break;
            }
        }
        info!("Session task finished for {}", name);
    }

    /// Returns false when the session is being torn down
    async fn wait_for_trigger(&self, triggers: &mut mpsc::UnboundedReceiver<()>) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            trigger = triggers.recv() => trigger.is_some(),
        }
    }
}
