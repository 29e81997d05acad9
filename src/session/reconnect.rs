//! Reconnect supervisor
//!
//! Owns the lifecycle state of one session and the (single) countdown timer
//! that leads to an automatic reconnect. The supervisor never connects by
//! itself: when a countdown elapses, or the user asks to reconnect, it sends
//! a trigger that the session driver turns into a connect attempt.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::events::{EventSink, SessionEvent};
use super::state::LifecycleState;
use crate::config::Settings;
use crate::ssh::SshError;

const TICK: Duration = Duration::from_secs(1);

struct SupervisorInner {
    state: LifecycleState,
    auto_reconnect: bool,
    /// Set by a user disconnect or a non-retryable failure; only a user reconnect clears it
    suppressed: bool,
    /// A trigger has been sent and not yet consumed by `begin_connect`
    trigger_pending: bool,
    delay_secs: u64,
    inline_banner: bool,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every timer start; a stale timer task sees the mismatch and exits
    generation: u64,
    disposed: bool,
}

impl SupervisorInner {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
            debug!("Reconnect countdown cancelled");
        }
        self.generation += 1;
    }
}

/// Countdown-based reconnect state machine
#[derive(Clone)]
pub struct ReconnectSupervisor {
    inner: Arc<Mutex<SupervisorInner>>,
    sink: EventSink,
    trigger_tx: mpsc::UnboundedSender<()>,
}

impl ReconnectSupervisor {
    /// Returns the supervisor and the receiver of reconnect triggers.
    pub fn new(settings: &Settings, sink: EventSink) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            inner: Arc::new(Mutex::new(SupervisorInner {
                state: LifecycleState::Disconnected,
                auto_reconnect: settings.auto_reconnect,
                suppressed: false,
                trigger_pending: false,
                delay_secs: settings.reconnect_delay_secs,
                inline_banner: false,
                timer: None,
                generation: 0,
                disposed: false,
            })),
            sink,
            trigger_tx,
        };
        (supervisor, trigger_rx)
    }

    /// Also write the countdown into the terminal output stream.
    pub fn with_inline_banner(self) -> Self {
        self.inner.lock().inline_banner = true;
        self
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    pub fn auto_reconnect(&self) -> bool {
        self.inner.lock().auto_reconnect
    }

    pub fn is_suppressed(&self) -> bool {
        self.inner.lock().suppressed
    }

    /// Number of countdown timers alive (0 or 1)
    pub fn pending_timers(&self) -> usize {
        usize::from(self.inner.lock().timer.is_some())
    }

    /// Enter `Connecting`. Returns false once disposed.
    pub fn begin_connect(&self, message: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return false;
        }
        inner.cancel_timer();
        inner.trigger_pending = false;
        inner.state = LifecycleState::Connecting;
        self.sink.status(LifecycleState::Connecting, message);
        true
    }

    pub fn connected(&self, message: &str) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        inner.state = LifecycleState::Connected;
        self.sink.status(LifecycleState::Connected, message);
    }

    /// A connect attempt failed.
    ///
    /// Retryable failures go through the normal countdown; anything else
    /// leaves the session disconnected until the user acts.
    pub fn connect_failed(&self, err: &SshError) {
        if err.is_retryable() {
            self.connection_lost(&format!("Connection failed: {}", err), false);
            return;
        }
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        inner.cancel_timer();
        inner.suppressed = true;
        inner.state = LifecycleState::Disconnected;
        info!("Not reconnecting after fatal error: {}", err);
        self.sink.status(LifecycleState::Disconnected, err.to_string());
    }

    /// The connection (or its channel) went away.
    ///
    /// A countdown starts when auto-reconnect is on, or when `failover` asks
    /// for one regardless, unless the user suppressed reconnects.
    pub fn connection_lost(&self, reason: &str, failover: bool) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        if inner.suppressed && inner.state == LifecycleState::Disconnected {
            debug!("Connection loss after user disconnect: {}", reason);
            return;
        }
        inner.state = LifecycleState::Disconnected;
        self.sink.status(LifecycleState::Disconnected, reason);

        if !inner.suppressed && !inner.trigger_pending && (inner.auto_reconnect || failover) {
            self.start_countdown(&mut inner);
        }
    }

    /// Terminal end of the session; no countdown
    pub fn finished(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        inner.cancel_timer();
        inner.suppressed = true;
        inner.state = LifecycleState::Disconnected;
        self.sink.status(LifecycleState::Disconnected, reason);
    }

    /// Explicit user disconnect: no automatic reconnect until the user reconnects
    pub fn user_disconnect(&self) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        inner.cancel_timer();
        inner.suppressed = true;
        inner.trigger_pending = false;
        inner.state = LifecycleState::Disconnected;
        info!("Disconnected by user");
        self.sink.status(LifecycleState::Disconnected, "Disconnected by user");
    }

    /// Explicit user reconnect: skip any countdown and connect now.
    pub fn user_reconnect(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return false;
        }
        inner.cancel_timer();
        inner.suppressed = false;
        if !inner.trigger_pending {
            inner.trigger_pending = true;
            let _ = self.trigger_tx.send(());
        }
        true
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        let mut inner = self.inner.lock();
        if inner.disposed || inner.auto_reconnect == enabled {
            return;
        }
        inner.auto_reconnect = enabled;
        info!("Auto-reconnect {}", if enabled { "enabled" } else { "disabled" });

        if !enabled {
            let was_counting = inner.timer.is_some() || inner.state == LifecycleState::Reconnecting;
            inner.cancel_timer();
            if was_counting {
                inner.state = LifecycleState::Disconnected;
                self.sink
                    .status(LifecycleState::Disconnected, "Automatic reconnect disabled");
            }
        } else if inner.state == LifecycleState::Disconnected
            && !inner.suppressed
            && !inner.trigger_pending
        {
            self.start_countdown(&mut inner);
        }
    }

    /// Cancel any countdown and ignore everything afterwards.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        inner.disposed = true;
        inner.cancel_timer();
    }

    fn start_countdown(&self, inner: &mut SupervisorInner) {
        inner.cancel_timer();
        let generation = inner.generation;
        let delay = inner.delay_secs;
        let banner = inner.inline_banner;
        info!("Reconnecting in {}s", delay);

        let shared = self.inner.clone();
        let sink = self.sink.clone();
        let trigger_tx = self.trigger_tx.clone();

        inner.timer = Some(tokio::spawn(async move {
            for remaining in (1..=delay).rev() {
                {
                    let mut inner = shared.lock();
                    if inner.generation != generation || inner.disposed {
                        return;
                    }
                    inner.state = LifecycleState::Reconnecting;
                    sink.emit(SessionEvent::Status {
                        state: LifecycleState::Reconnecting,
                        message: format!("Reconnecting in {}s", remaining),
                        countdown: Some(remaining),
                    });
                    if banner {
                        sink.emit(SessionEvent::Output {
                            data: countdown_banner(remaining),
                        });
                    }
                }
                tokio::time::sleep(TICK).await;
            }

            let mut inner = shared.lock();
            if inner.generation != generation || inner.disposed {
                return;
            }
            inner.timer = None;
            inner.trigger_pending = true;
            let _ = trigger_tx.send(());
        }));
    }
}

/// Terminal line rewritten in place on each tick
fn countdown_banner(remaining: u64) -> Vec<u8> {
    format!(
        "\r\x1b[2K\x1b[33m[connection lost, reconnecting in {}s]\x1b[0m",
        remaining
    )
    .into_bytes()
}
