//! Established transports
//!
//! A [`Transport`] is an authenticated connection that can run one-shot
//! commands, stream a long-running command, open a PTY shell, or open an
//! SFTP subsystem. [`RusshTransport`] is the real one; tests use fakes.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::config::EndpointLabel;
use super::error::SshError;
use super::handle_owner::HandleController;
use crate::sftp::{FileSystem, SftpFileSystem};

const CHANNEL_BUFFER: usize = 1024;

/// Commands that can be sent to an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    /// Data to send to stdin
    Data(Vec<u8>),
    /// Resize the PTY
    Resize(PtySize),
    Close,
}

/// Output of an open channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// stdout and stderr, in arrival order
    Data(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    /// Channel is finished; nothing follows
    Closed,
}

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Both directions of an open streaming channel
pub struct ChannelIo {
    cmd_tx: mpsc::Sender<ChannelCommand>,
    output_rx: mpsc::Receiver<ChannelEvent>,
}

impl ChannelIo {
    pub fn new(cmd_tx: mpsc::Sender<ChannelCommand>, output_rx: mpsc::Receiver<ChannelEvent>) -> Self {
        Self { cmd_tx, output_rx }
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<(), SshError> {
        self.cmd_tx
            .send(ChannelCommand::Data(data))
            .await
            .map_err(|_| SshError::ChannelError("channel is closed".to_string()))
    }

    pub async fn resize(&self, size: PtySize) -> Result<(), SshError> {
        self.cmd_tx
            .send(ChannelCommand::Resize(size))
            .await
            .map_err(|_| SshError::ChannelError("channel is closed".to_string()))
    }

    /// Next output event; `None` once the channel task is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.output_rx.recv().await
    }

    pub fn close(&self) {
        let _ = self.cmd_tx.try_send(ChannelCommand::Close);
    }

    /// Input handle that can outlive borrows of `self`
    pub fn writer(&self) -> ChannelWriter {
        ChannelWriter {
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

/// Cloneable input side of a [`ChannelIo`]; dropping it does not close the channel
#[derive(Clone)]
pub struct ChannelWriter {
    cmd_tx: mpsc::Sender<ChannelCommand>,
}

impl ChannelWriter {
    pub async fn send(&self, data: Vec<u8>) -> Result<(), SshError> {
        self.cmd_tx
            .send(ChannelCommand::Data(data))
            .await
            .map_err(|_| SshError::ChannelError("channel is closed".to_string()))
    }

    pub async fn resize(&self, size: PtySize) -> Result<(), SshError> {
        self.cmd_tx
            .send(ChannelCommand::Resize(size))
            .await
            .map_err(|_| SshError::ChannelError("channel is closed".to_string()))
    }
}

impl Drop for ChannelIo {
    fn drop(&mut self) {
        // Best effort: the channel task may already be gone
        let _ = self.cmd_tx.try_send(ChannelCommand::Close);
    }
}

/// Captured result of a one-shot command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
    pub exit_signal: Option<String>,
}

impl ExecOutput {
    /// A command failed if it exited non-zero or was killed by a signal.
    pub fn succeeded(&self) -> bool {
        self.exit_signal.is_none() && self.exit_status.unwrap_or(0) == 0
    }

    /// stdout followed by stderr, lossily decoded and trimmed
    pub fn combined_output(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text.trim().to_string()
    }

    /// Turn a failed run into [`SshError::RemoteOperationFailed`].
    pub fn check(self, command: &str) -> Result<Self, SshError> {
        if self.succeeded() {
            return Ok(self);
        }
        let reason = match (&self.exit_signal, self.exit_status) {
            (Some(signal), _) => format!("killed by signal {}", signal),
            (None, Some(code)) => format!("exit status {}", code),
            (None, None) => "unknown failure".to_string(),
        };
        let output = self.combined_output();
        Err(SshError::RemoteOperationFailed(if output.is_empty() {
            format!("{:?} failed: {}", command, reason)
        } else {
            format!("{:?} failed: {}: {}", command, reason, output)
        }))
    }
}

/// An authenticated connection to one endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which configured endpoint this transport reached
    fn endpoint(&self) -> EndpointLabel;

    /// Run a command to completion
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError>;

    /// Start a command and stream its output
    async fn open_exec(&self, command: &str) -> Result<ChannelIo, SshError>;

    /// Open an interactive shell on a PTY
    async fn open_shell(&self, size: PtySize) -> Result<ChannelIo, SshError>;

    /// Open the SFTP subsystem
    async fn open_sftp(&self) -> Result<Arc<dyn FileSystem>, SshError>;

    /// Resolves once the connection is lost or closed
    async fn closed(&self);

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// [`Transport`] over a russh connection, possibly tunneled through a bastion
pub struct RusshTransport {
    endpoint: EndpointLabel,
    name: String,
    controller: HandleController,
    /// Keeps the bastion connection alive for the tunnel's lifetime
    bastion: Option<HandleController>,
}

impl RusshTransport {
    pub fn new(
        endpoint: EndpointLabel,
        name: String,
        controller: HandleController,
        bastion: Option<HandleController>,
    ) -> Self {
        Self {
            endpoint,
            name,
            controller,
            bastion,
        }
    }

    pub fn controller(&self) -> &HandleController {
        &self.controller
    }
}

/// Run `command` on a fresh session channel and collect its output.
pub async fn exec_on(controller: &HandleController, command: &str) -> Result<ExecOutput, SshError> {
    let mut channel = controller.open_session_channel().await?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| SshError::ChannelError(format!("exec request failed: {}", e)))?;

    let mut output = ExecOutput::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                output.stderr.extend_from_slice(&data)
            }
            ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                output.exit_signal = Some(format!("{:?}", signal_name))
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    debug!(
        "exec finished: status={:?} signal={:?}",
        output.exit_status, output.exit_signal
    );
    Ok(output)
}

/// Pump a russh channel into a [`ChannelIo`] pair.
fn spawn_channel_task(mut channel: Channel<Msg>, name: String) -> ChannelIo {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ChannelCommand>(CHANNEL_BUFFER);
    let (out_tx, out_rx) = mpsc::channel::<ChannelEvent>(CHANNEL_BUFFER);

    tokio::spawn(async move {
        debug!("Channel handler started for {}", name);
        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        ChannelCommand::Data(data) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to channel on {}: {}", name, e);
                                break;
                            }
                        }
                        ChannelCommand::Resize(size) => {
                            if let Err(e) = channel.window_change(size.cols, size.rows, 0, 0).await {
                                error!("Failed to resize PTY on {}: {}", name, e);
                            } else {
                                debug!("PTY resized to {}x{} on {}", size.cols, size.rows, name);
                            }
                        }
                        ChannelCommand::Close => {
                            info!("Close requested for channel on {}", name);
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    let Some(msg) = msg else { break };
                    let event = match msg {
                        ChannelMsg::Data { data } => ChannelEvent::Data(data.to_vec()),
                        ChannelMsg::ExtendedData { data, ext: 1 } => ChannelEvent::Data(data.to_vec()),
                        ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                        ChannelMsg::ExitSignal { signal_name, .. } => {
                            ChannelEvent::ExitSignal(format!("{:?}", signal_name))
                        }
                        ChannelMsg::Close => break,
                        _ => continue,
                    };
                    if out_tx.send(event).await.is_err() {
                        break;
                    }
                }

                else => break,
            }
        }
        let _ = out_tx.send(ChannelEvent::Closed).await;
        debug!("Channel handler terminated for {}", name);
    });

    ChannelIo::new(cmd_tx, out_rx)
}

#[async_trait]
impl Transport for RusshTransport {
    fn endpoint(&self) -> EndpointLabel {
        self.endpoint
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        info!("exec on {}: {}", self.name, command);
        exec_on(&self.controller, command).await
    }

    async fn open_exec(&self, command: &str) -> Result<ChannelIo, SshError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("exec request failed: {}", e)))?;
        info!("Streaming {:?} on {}", command, self.name);
        Ok(spawn_channel_task(channel, self.name.clone()))
    }

    async fn open_shell(&self, size: PtySize) -> Result<ChannelIo, SshError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .request_pty(false, "xterm-256color", size.cols, size.rows, 0, 0, &[])
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;
        info!("Interactive shell started on {} ({}x{})", self.name, size.cols, size.rows);
        Ok(spawn_channel_task(channel, self.name.clone()))
    }

    async fn open_sftp(&self) -> Result<Arc<dyn FileSystem>, SshError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP subsystem request failed: {}", e)))?;
        let fs = SftpFileSystem::open(channel.into_stream(), self.controller.clone()).await?;
        info!("SFTP session opened on {}", self.name);
        Ok(Arc::new(fs))
    }

    async fn closed(&self) {
        match &self.bastion {
            Some(bastion) => {
                tokio::select! {
                    _ = self.controller.closed() => {}
                    _ = bastion.closed() => {}
                }
            }
            None => self.controller.closed().await,
        }
    }

    fn is_closed(&self) -> bool {
        !self.controller.is_connected()
            || self.bastion.as_ref().is_some_and(|b| !b.is_connected())
    }

    async fn close(&self) {
        info!("Closing transport to {}", self.name);
        self.controller.disconnect().await;
        if let Some(bastion) = &self.bastion {
            bastion.disconnect().await;
        }
    }
}
