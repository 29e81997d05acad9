//! Interactive shell session over a PTY
//!
//! Keystrokes go in through [`InteractiveShellSession::write`], raw output
//! comes back as [`SessionEvent::Output`]. While the connection is down the
//! reconnect countdown is drawn into the terminal output itself, and the shell
//! is reopened (back in its working directory) once reconnected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::driver::{ActivityContext, ActivityEnd, SessionActivity, SessionDriver};
use super::events::{EventSink, SessionEvent};
use super::state::LifecycleState;
use crate::sftp::path_utils::shell_quote;
use crate::ssh::{
    ChannelEvent, ChannelWriter, DeviceTarget, PtySize, SshError, Transport, TransportConnector,
};

struct ShellChannel {
    size: Mutex<PtySize>,
    writer: Mutex<Option<ChannelWriter>>,
    working_directory: Option<String>,
    /// Set once the first shell has been opened
    opened_before: AtomicBool,
}

impl ShellChannel {
    fn notice(sink: &EventSink, text: &str) {
        sink.emit(SessionEvent::Output {
            data: format!("\r\n\x1b[2K\x1b[33m[{}]\x1b[0m\r\n", text).into_bytes(),
        });
    }
}

#[async_trait]
impl SessionActivity for ShellChannel {
    async fn run(
        &self,
        transport: Arc<dyn Transport>,
        ctx: &ActivityContext,
    ) -> Result<ActivityEnd, SshError> {
        let size = *self.size.lock();
        let mut channel = transport.open_shell(size).await?;

        let resumed = self.opened_before.swap(true, Ordering::SeqCst);
        if resumed {
            Self::notice(&ctx.sink, "reconnected");
        }
        if let Some(dir) = &self.working_directory {
            debug!("Changing shell directory to {}", dir);
            channel
                .send(format!("cd {}\n", shell_quote(dir)).into_bytes())
                .await?;
        }
        *self.writer.lock() = Some(channel.writer());

        let mut exit = None;
        loop {
            let event = tokio::select! {
                event = channel.recv() => event,
                _ = transport.closed() => None,
            };
            match event {
                Some(ChannelEvent::Data(data)) => {
                    ctx.sink.emit(SessionEvent::Output { data });
                }
                Some(ChannelEvent::ExitStatus(code)) => exit = Some(format!("exit status {}", code)),
                Some(ChannelEvent::ExitSignal(signal)) => exit = Some(format!("signal {}", signal)),
                Some(ChannelEvent::Closed) | None => break,
            }
        }
        self.writer.lock().take();

        match exit {
            // The shell itself ended (e.g. `exit`); nothing to resume
            Some(exit) => {
                let reason = format!("Shell ended ({})", exit);
                info!("{}", reason);
                Self::notice(&ctx.sink, &reason);
                Ok(ActivityEnd::Finished { reason })
            }
            None => {
                Self::notice(&ctx.sink, "connection lost");
                Ok(ActivityEnd::Lost {
                    reason: "Shell connection lost".to_string(),
                    failover: ctx.endpoint_count > 1,
                })
            }
        }
    }

    fn detached(&self) {
        self.writer.lock().take();
    }
}

pub struct InteractiveShellSession {
    driver: SessionDriver,
    channel: Arc<ShellChannel>,
}

impl InteractiveShellSession {
    pub fn new(
        connector: Arc<TransportConnector>,
        target: DeviceTarget,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let settings = connector.settings();
        let channel = Arc::new(ShellChannel {
            size: Mutex::new(PtySize {
                cols: settings.terminal_cols,
                rows: settings.terminal_rows,
            }),
            writer: Mutex::new(None),
            working_directory: target
                .working_directory
                .clone()
                .filter(|dir| !dir.trim().is_empty()),
            opened_before: AtomicBool::new(false),
        });
        let (sink, events) = EventSink::new();
        let driver = SessionDriver::new(connector, target, channel.clone(), sink, true);
        (Self { driver, channel }, events)
    }

    pub fn start(&self) -> Result<(), SshError> {
        self.driver.start()
    }

    pub fn state(&self) -> LifecycleState {
        self.driver.state()
    }

    /// Forward keystrokes to the remote shell.
    pub async fn write(&self, data: &[u8]) -> Result<(), SshError> {
        let writer = self.channel.writer.lock().clone();
        match writer {
            Some(writer) => writer.send(data.to_vec()).await,
            None => Err(SshError::TransportClosed("shell is not connected".to_string())),
        }
    }

    /// Resize the PTY; the size is kept for shells opened later.
    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), SshError> {
        let size = PtySize { cols, rows };
        *self.channel.size.lock() = size;
        let writer = self.channel.writer.lock().clone();
        match writer {
            Some(writer) => writer.resize(size).await,
            None => Ok(()),
        }
    }

    pub async fn disconnect(&self) {
        self.driver.disconnect().await;
    }

    pub async fn reconnect(&self) {
        self.driver.reconnect().await;
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.driver.set_auto_reconnect(enabled);
    }

    pub fn pending_timers(&self) -> usize {
        self.driver.supervisor().pending_timers()
    }

    pub async fn dispose(&self) {
        self.channel.writer.lock().take();
        self.driver.dispose().await;
    }
}
