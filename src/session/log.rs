//! Log session: stream a fixed command's output line by line

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::decoder::LineStreamDecoder;
use super::driver::{ActivityContext, ActivityEnd, SessionActivity, SessionDriver};
use super::events::{EventSink, SessionEvent};
use super::state::LifecycleState;
use crate::ssh::{ChannelEvent, DeviceTarget, SshError, Transport, TransportConnector};

/// Marker line emitted when a log session ends for good
pub fn closed_marker() -> String {
    format!(
        "--- session closed at {} ---",
        chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
    )
}

struct LogStream {
    command: String,
}

#[async_trait]
impl SessionActivity for LogStream {
    fn command(&self) -> Option<&str> {
        Some(&self.command)
    }

    async fn run(
        &self,
        transport: Arc<dyn Transport>,
        ctx: &ActivityContext,
    ) -> Result<ActivityEnd, SshError> {
        let mut channel = transport.open_exec(&self.command).await?;
        let mut decoder = LineStreamDecoder::new();
        let mut exit = None;

        loop {
            let event = tokio::select! {
                event = channel.recv() => event,
                _ = transport.closed() => None,
            };
            match event {
                Some(ChannelEvent::Data(data)) => {
                    for text in decoder.feed(&data) {
                        ctx.sink.emit(SessionEvent::Line { text });
                    }
                }
                Some(ChannelEvent::ExitStatus(code)) => exit = Some(format!("exit status {}", code)),
                Some(ChannelEvent::ExitSignal(signal)) => exit = Some(format!("signal {}", signal)),
                Some(ChannelEvent::Closed) | None => break,
            }
        }
        if let Some(text) = decoder.finish() {
            ctx.sink.emit(SessionEvent::Line { text });
        }

        let reason = match exit {
            Some(exit) => format!("Command ended ({})", exit),
            None => "Log stream closed".to_string(),
        };
        info!("{}: {}", self.command, reason);

        let failover = ctx.endpoint_count > 1;
        if failover || ctx.supervisor.auto_reconnect() {
            return Ok(ActivityEnd::Lost { reason, failover });
        }
        ctx.sink.emit(SessionEvent::Line {
            text: closed_marker(),
        });
        Ok(ActivityEnd::Finished { reason })
    }
}

/// Runs `target.command` and streams its output as [`SessionEvent::Line`]s.
pub struct LogSession {
    driver: SessionDriver,
}

impl LogSession {
    /// Fails with `InvalidCommand` when the target has no command.
    pub fn new(
        connector: Arc<TransportConnector>,
        target: DeviceTarget,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), SshError> {
        let command = target
            .command
            .clone()
            .ok_or_else(|| SshError::InvalidCommand("no log command configured".to_string()))?;
        debug!("Log session for {} runs {:?}", target.display_name(), command);
        let (sink, events) = EventSink::new();
        let driver = SessionDriver::new(connector, target, Arc::new(LogStream { command }), sink, false);
        Ok((Self { driver }, events))
    }

    pub fn start(&self) -> Result<(), SshError> {
        self.driver.start()
    }

    pub fn state(&self) -> LifecycleState {
        self.driver.state()
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
        self.driver.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{
        ConfigScope, CredentialResolver, MemoryConfigStore, MemorySecretStore, Settings,
        WorkspaceScope,
    };
    use crate::ssh::{FingerprintStore, ChannelCommand};
    use crate::testing::{ChannelKind, FakeDialer, ScriptedPrompter};

    fn connector(
        dialer: Arc<FakeDialer>,
        config: Arc<MemoryConfigStore>,
        settings: Settings,
    ) -> Arc<TransportConnector> {
        let prompter = Arc::new(ScriptedPrompter::new().secret("pw"));
        Arc::new(TransportConnector::new(
            dialer,
            Arc::new(CredentialResolver::new(
                Arc::new(MemorySecretStore::new()),
                prompter.clone(),
            )),
            FingerprintStore::new(config),
            prompter,
            WorkspaceScope::new("ws", "Workspace"),
            settings,
        ))
    }

    fn device() -> DeviceTarget {
        let mut target = DeviceTarget::new("dev-1", "10.0.0.2", "root");
        target.command = Some("tail -F /var/log/messages".to_string());
        target
    }

    async fn next_status(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> (LifecycleState, Option<u64>) {
        loop {
            match events.recv().await {
                Some(SessionEvent::Status {
                    state, countdown, ..
                }) => return (state, countdown),
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    }

    #[tokio::test]
    async fn test_streams_lines_and_pins_first_use() {
        let target = device();
        let config = Arc::new(
            MemoryConfigStore::new().with_devices(ConfigScope::Workspace, vec![target.clone()]),
        );
        let dialer = Arc::new(FakeDialer::new());
        let (session, mut events) =
            LogSession::new(connector(dialer.clone(), config.clone(), Settings::default()), target)
                .unwrap();
        session.start().unwrap();

        assert_eq!(next_status(&mut events).await.0, LifecycleState::Connecting);
        assert_eq!(next_status(&mut events).await.0, LifecycleState::Connected);
        let stored = config.devices(ConfigScope::Workspace).unwrap();
        assert!(stored[0].host_fingerprint.is_some());

        let channel = dialer.next_channel().await;
        assert_eq!(channel.kind, ChannelKind::Exec("tail -F /var/log/messages".to_string()));
        channel.send(b"boot ok\nkern").await;
        channel.send(b"el: up\n").await;

        let mut lines = Vec::new();
        while lines.len() < 2 {
            if let Some(SessionEvent::Line { text }) = events.recv().await {
                lines.push(text);
            }
        }
        assert_eq!(lines, vec!["boot ok", "kernel: up"]);
        session.dispose().await;
    }

    #[tokio::test]
    async fn test_rejects_command_with_newline_before_dialing() {
        let mut target = device();
        target.command = Some("tail -f x\nreboot".to_string());
        let dialer = Arc::new(FakeDialer::new());
        let (session, _events) = LogSession::new(
            connector(dialer.clone(), Arc::new(MemoryConfigStore::new()), Settings::default()),
            target,
        )
        .unwrap();
        assert!(matches!(session.start(), Err(SshError::InvalidCommand(_))));
        tokio::task::yield_now().await;
        assert_eq!(dialer.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_exit_without_reconnect_is_terminal() {
        let settings = Settings {
            auto_reconnect: false,
            ..Settings::default()
        };
        let dialer = Arc::new(FakeDialer::new());
        let (session, mut events) = LogSession::new(
            connector(dialer.clone(), Arc::new(MemoryConfigStore::new()), settings),
            device(),
        )
        .unwrap();
        session.start().unwrap();

        let channel = dialer.next_channel().await;
        channel.send(b"last words").await;
        channel.exit(0).await;

        let mut lines = Vec::new();
        let mut closed = 0;
        loop {
            match events.recv().await {
                Some(SessionEvent::Line { text }) => lines.push(text),
                Some(SessionEvent::Closed { .. }) => closed += 1,
                Some(SessionEvent::Status {
                    state: LifecycleState::Disconnected,
                    ..
                }) => break,
                Some(_) => {}
                None => panic!("event stream ended"),
            }
        }
        assert_eq!(lines[0], "last words");
        assert!(lines[1].starts_with("--- session closed at "));
        assert!(lines[1].ends_with(" ---"));
        assert_eq!(closed, 1);
        assert_eq!(session.pending_timers(), 0);
        assert_eq!(dialer.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_reconnects_after_countdown() {
        let dialer = Arc::new(FakeDialer::new());
        let (session, mut events) = LogSession::new(
            connector(dialer.clone(), Arc::new(MemoryConfigStore::new()), Settings::default()),
            device(),
        )
        .unwrap();
        session.start().unwrap();
        assert_eq!(next_status(&mut events).await.0, LifecycleState::Connecting);
        assert_eq!(next_status(&mut events).await.0, LifecycleState::Connected);
        let _first = dialer.next_channel().await;

        dialer.transport(0).drop_connection();

        let mut states = Vec::new();
        let mut closed = 0;
        while states.last() != Some(&(LifecycleState::Connected, None)) {
            match events.recv().await {
                Some(SessionEvent::Status {
                    state, countdown, ..
                }) => states.push((state, countdown)),
                Some(SessionEvent::Closed { .. }) => closed += 1,
                Some(_) => {}
                None => panic!("event stream ended"),
            }
        }

        use LifecycleState::*;
        assert_eq!(
            states,
            vec![
                (Disconnected, None),
                (Reconnecting, Some(5)),
                (Reconnecting, Some(4)),
                (Reconnecting, Some(3)),
                (Reconnecting, Some(2)),
                (Reconnecting, Some(1)),
                (Connecting, None),
                (Connected, None),
            ]
        );
        assert_eq!(closed, 1);
        assert_eq!(dialer.dial_count(), 2);
        // The pin captured on the first connect is verified on the second
        assert!(dialer.plans()[1].target.expected.is_some());
        session.dispose().await;
    }

    #[tokio::test]
    async fn test_dispose_during_connect_closes_late_transport() {
        let dialer = Arc::new(FakeDialer::new());
        let gate = dialer.hold_dials();
        let (session, mut events) = LogSession::new(
            connector(dialer.clone(), Arc::new(MemoryConfigStore::new()), Settings::default()),
            device(),
        )
        .unwrap();
        session.start().unwrap();
        assert_eq!(next_status(&mut events).await.0, LifecycleState::Connecting);

        session.dispose().await;
        gate.notify_one();

        let transport = dialer.wait_transport(0).await;
        tokio::time::timeout(Duration::from_secs(1), transport.closed())
            .await
            .unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_user_disconnect_closes_channel_without_reconnect() {
        let dialer = Arc::new(FakeDialer::new());
        let (session, mut events) = LogSession::new(
            connector(dialer.clone(), Arc::new(MemoryConfigStore::new()), Settings::default()),
            device(),
        )
        .unwrap();
        session.start().unwrap();
        let mut channel = dialer.next_channel().await;

        session.disconnect().await;
        assert_eq!(session.state(), LifecycleState::Disconnected);
        assert!(dialer.transport(0).is_closed());
        assert!(matches!(channel.commands.recv().await, Some(ChannelCommand::Close) | None));
        assert_eq!(session.pending_timers(), 0);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(
                event,
                SessionEvent::Status {
                    state: LifecycleState::Reconnecting,
                    ..
                }
            ));
        }
        session.dispose().await;
    }
}
