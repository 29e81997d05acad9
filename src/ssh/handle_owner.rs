//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to
//! it through a cloneable [`HandleController`] over an mpsc channel, so no
//! lock on the handle is ever held across an `.await`.
//!
//! The owner task also watches liveness: keepalives are sent by russh itself
//! (see `client_config`), and the owner polls the handle once a second. When
//! the connection goes away every subscriber of
//! [`HandleController::subscribe_disconnect`] is notified.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use super::client::ClientHandler;
use super::error::SshError;

const LIVENESS_POLL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (exec, shell, sftp)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Open a direct-tcpip channel (bastion tunnel)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to disconnect notifications.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Resolves once the connection is gone.
    pub async fn closed(&self) {
        // Subscribe before checking: the owner closes its queue before it broadcasts
        let mut rx = self.subscribe_disconnect();
        if !self.is_connected() {
            return;
        }
        let _ = rx.recv().await;
    }

    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| disconnected())?;
        reply_rx
            .await
            .map_err(|_| disconnected())?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| disconnected())?;
        reply_rx
            .await
            .map_err(|_| disconnected())?
            .map_err(|e| SshError::ConnectionFailed(format!("direct-tcpip to {}:{} failed: {}", host, port, e)))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Whether the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

fn disconnected() -> SshError {
    SshError::TransportClosed("SSH connection is closed".to_string())
}

/// Spawn the Handle Owner Task.
///
/// Consumes the handle; `name` is only used in log lines.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    name: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let notify_tx = disconnect_tx.clone();

    tokio::spawn(async move {
        let handle = handle;
        info!("Handle owner task started for {}", name);

        let mut liveness = tokio::time::interval(LIVENESS_POLL);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All controllers dropped for {}", name);
                        break;
                    };
                    match cmd {
                        HandleCommand::ChannelOpenSession { reply_tx } => {
                            let result = handle.channel_open_session().await;
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving channel_open_session result");
                            }
                        }
                        HandleCommand::ChannelOpenDirectTcpip {
                            host,
                            port,
                            originator_host,
                            originator_port,
                            reply_tx,
                        } => {
                            let result = handle
                                .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                                .await;
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        }
                        HandleCommand::Disconnect => {
                            info!("Disconnect requested for {}", name);
                            break;
                        }
                    }
                }
                _ = liveness.tick() => {
                    if handle.is_closed() {
                        warn!("SSH connection to {} closed by peer", name);
                        break;
                    }
                }
            }
        }

        // Queue closes before the broadcast so `closed()` never misses it
        drain_pending_commands(&mut cmd_rx);
        let _ = notify_tx.send(());

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", name);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Fail every queued command with a disconnect
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
impl HandleController {
    /// Controller with no owner task behind it
    pub(crate) fn detached() -> (Self, mpsc::Receiver<HandleCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (disconnect_tx, _) = broadcast::channel(1);
        (
            Self {
                cmd_tx,
                disconnect_tx,
            },
            cmd_rx,
        )
    }
}
