//! Persistent interactive shell attached to the session workspace.
//!
//! A single driver task owns the physical connection and walks the state
//! machine
//!
//! ```text
//! Idle -> Connecting -> Open -> Closed -> Reconnecting -> Connecting -> ...
//! ```
//!
//! until [`TerminalChannel::stop`] cancels it. Every transition is published
//! as a [`TerminalEvent`]; connection notices go to the [`RenderSurface`]
//! alongside shell output.

mod keys;
mod surface;

pub use keys::{
    is_detach_prefix, key_event_to_bytes, CLEAR_COMMAND, CLEAR_SCREEN, INTERRUPT,
};
pub use surface::{RenderSurface, Scrollback, StdoutSurface};

use crate::api::{CallerIdentity, ShellCommand, ShellConnector, ShellLink};
use crate::config::ReconnectPolicy;
use crate::errors::{describe, SessionError, SessionResult};
use crate::session::{Buffer, SessionId};
use crate::sync::FileSyncChannel;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DISCONNECTED_NOTICE: &str =
    "\r\n\x1b[1;31mDisconnected from virtual terminal\x1b[0m\r\n";
pub const RECONNECTING_NOTICE: &str = "Attempting to reconnect...\r\n";
pub const RECONNECTED_NOTICE: &str = "\x1b[1;32mReconnected to virtual terminal\x1b[0m\r\n";
pub const RECONNECT_FAILED_NOTICE: &str = "\x1b[1;31mFailed to reconnect\x1b[0m\r\n";
pub const CONNECTION_ERROR_NOTICE: &str =
    "\r\n\x1b[1;31mConnection error - check if backend is running\x1b[0m\r\n";

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

/// Snapshot of the channel. A fresh value replaces the previous one on
/// every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSession {
    pub connection_state: ConnectionState,
    pub pending_reconnect_deadline: Option<Instant>,
    /// Connect attempts since the channel was last open.
    pub attempt: u32,
}

impl Default for TerminalSession {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Idle,
            pending_reconnect_deadline: None,
            attempt: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

struct StateCell {
    current: RwLock<TerminalSession>,
    events: broadcast::Sender<TerminalEvent>,
}

impl StateCell {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            current: RwLock::new(TerminalSession::default()),
            events,
        }
    }

    fn get(&self) -> TerminalSession {
        *self.current.read()
    }

    fn set(&self, state: ConnectionState, attempt: u32, deadline: Option<Instant>) {
        let next = TerminalSession {
            connection_state: state,
            pending_reconnect_deadline: deadline,
            attempt,
        };
        let previous = std::mem::replace(&mut *self.current.write(), next);
        if previous.connection_state != state {
            debug!(from = ?previous.connection_state, to = ?state, attempt, "Terminal state changed");
            // No subscribers is fine
            let _ = self.events.send(TerminalEvent::StateChanged {
                from: previous.connection_state,
                to: state,
            });
        }
    }
}

pub struct TerminalChannel {
    driver: Driver,
    identity: CallerIdentity,
    input: Mutex<Option<mpsc::UnboundedSender<ShellCommand>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TerminalChannel {
    pub fn new(
        session: SessionId,
        connector: Arc<dyn ShellConnector>,
        sync: FileSyncChannel,
        buffer: Arc<Buffer>,
        surface: Arc<dyn RenderSurface>,
    ) -> Self {
        Self {
            driver: Driver {
                session,
                connector,
                sync,
                buffer,
                surface,
                policy: ReconnectPolicy::default(),
                state: Arc::new(StateCell::new()),
                cancel: CancellationToken::new(),
            },
            identity: CallerIdentity::default(),
            input: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn with_identity(mut self, identity: CallerIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.driver.policy = policy;
        self
    }

    /// Spawn the connection driver. Calling it again while running is a
    /// no-op; a stopped channel cannot be restarted.
    pub fn start(&self) -> SessionResult<()> {
        let mut task = self.task.lock();
        if task.is_some() {
            return Ok(());
        }
        if self.driver.cancel.is_cancelled() {
            return Err(SessionError::ChannelDropped(
                "terminal channel was stopped".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.input.lock() = Some(tx);
        let driver = self.driver.clone();
        *task = Some(tokio::spawn(driver.run(rx)));
        info!(session_id = %self.driver.session, "Terminal channel started");
        Ok(())
    }

    /// Cancel the driver, including a pending reconnect, close the
    /// connection if open and enter `Closed` for good.
    pub async fn stop(&self) {
        self.driver.cancel.cancel();
        self.input.lock().take();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(session_id = %self.driver.session, error = %e, "Terminal driver task failed");
            }
        }
        let attempt = self.driver.state.get().attempt;
        self.driver.state.set(ConnectionState::Closed, attempt, None);
    }

    /// Forward local input to the remote shell.
    ///
    /// Form feeds are not forwarded: each one clears the local surface and
    /// sends a single `clear` command instead. Everything else, including
    /// interrupts, passes through verbatim.
    pub fn send_input(&self, data: &str) -> SessionResult<()> {
        if self.connection_state() != ConnectionState::Open {
            debug!(session_id = %self.driver.session, bytes = data.len(), "Dropping terminal input, not connected");
            return Err(SessionError::ChannelDropped(
                "terminal is not connected".to_string(),
            ));
        }
        let sender = self.input.lock().clone().ok_or_else(|| {
            SessionError::ChannelDropped("terminal is not connected".to_string())
        })?;

        for (index, segment) in data.split(CLEAR_SCREEN).enumerate() {
            if index > 0 {
                self.driver.surface.clear();
                self.forward(&sender, CLEAR_COMMAND)?;
            }
            if !segment.is_empty() {
                self.forward(&sender, segment)?;
            }
        }
        Ok(())
    }

    fn forward(
        &self,
        sender: &mpsc::UnboundedSender<ShellCommand>,
        command: &str,
    ) -> SessionResult<()> {
        sender
            .send(ShellCommand {
                command: command.to_string(),
                identity: self.identity.clone(),
            })
            .map_err(|_| SessionError::ChannelDropped("terminal driver has exited".to_string()))
    }

    /// Wait until the channel is `Open`. The driver keeps retrying in the
    /// background after this gives up.
    pub async fn wait_until_open(&self, timeout: Duration) -> SessionResult<()> {
        let mut events = self.subscribe();
        if self.connection_state() == ConnectionState::Open {
            return Ok(());
        }
        let opened = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(TerminalEvent::StateChanged {
                        to: ConnectionState::Open,
                        ..
                    }) => return true,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.connection_state() == ConnectionState::Open {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        })
        .await
        .unwrap_or(false);

        if opened {
            Ok(())
        } else {
            Err(SessionError::ChannelUnreachable(format!(
                "no terminal connection after {}s",
                timeout.as_secs_f32()
            )))
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TerminalEvent> {
        self.driver.state.events.subscribe()
    }

    pub fn session(&self) -> TerminalSession {
        self.driver.state.get()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session().connection_state
    }
}

enum ConnectionEnd {
    Stopped,
    Dropped,
}

#[derive(Clone)]
struct Driver {
    session: SessionId,
    connector: Arc<dyn ShellConnector>,
    sync: FileSyncChannel,
    buffer: Arc<Buffer>,
    surface: Arc<dyn RenderSurface>,
    policy: ReconnectPolicy,
    state: Arc<StateCell>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(self, mut input: mpsc::UnboundedReceiver<ShellCommand>) {
        let mut attempt: u32 = 0;
        loop {
            self.state.set(ConnectionState::Connecting, attempt, None);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.session) => result,
            };

            match connected {
                Ok(link) => {
                    if attempt > 0 {
                        info!(session_id = %self.session, attempt, "Terminal reconnected");
                        self.surface.write(RECONNECTED_NOTICE);
                    } else {
                        info!(session_id = %self.session, "Terminal connected");
                    }
                    // Input typed for a previous connection is stale
                    while input.try_recv().is_ok() {}
                    attempt = 0;
                    self.state.set(ConnectionState::Open, attempt, None);

                    match self.serve(link, &mut input).await {
                        ConnectionEnd::Stopped => break,
                        ConnectionEnd::Dropped => {
                            warn!(session_id = %self.session, "Terminal connection dropped");
                            self.surface.write(DISCONNECTED_NOTICE);
                            self.surface.write(RECONNECTING_NOTICE);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        session_id = %self.session,
                        attempt,
                        error = %describe(&e),
                        "Terminal connection failed"
                    );
                    if attempt == 0 {
                        self.surface.write(CONNECTION_ERROR_NOTICE);
                        self.surface.write(RECONNECTING_NOTICE);
                    } else {
                        self.surface.write(RECONNECT_FAILED_NOTICE);
                    }
                }
            }

            self.state.set(ConnectionState::Closed, attempt, None);
            attempt = attempt.saturating_add(1);
            let delay = self.policy.delay(attempt);
            self.state.set(
                ConnectionState::Reconnecting,
                attempt,
                Some(Instant::now() + delay),
            );
            debug!(session_id = %self.session, attempt, delay_ms = delay.as_millis() as u64, "Scheduling terminal reconnect");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.set(ConnectionState::Closed, attempt, None);
        info!(session_id = %self.session, "Terminal channel stopped");
    }

    async fn serve(
        &self,
        link: ShellLink,
        input: &mut mpsc::UnboundedReceiver<ShellCommand>,
    ) -> ConnectionEnd {
        let ShellLink {
            mut sink,
            mut stream,
        } = link;

        let snapshot = self.buffer.snapshot();
        if !snapshot.is_blank() {
            // Failures are logged and remembered by the sync channel
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return ConnectionEnd::Stopped;
                }
                _ = self.sync.push(&self.session, &snapshot.filename, &snapshot.text) => {}
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return ConnectionEnd::Stopped;
                }
                command = input.recv() => {
                    let Some(command) = command else {
                        let _ = sink.close().await;
                        return ConnectionEnd::Stopped;
                    };
                    if let Err(e) = sink.send(command).await {
                        warn!(session_id = %self.session, error = %describe(&e), "Failed to send terminal input");
                        return ConnectionEnd::Dropped;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => self.surface.write(&text),
                    Some(Err(e)) => {
                        warn!(session_id = %self.session, error = %describe(&e), "Terminal read failed");
                        return ConnectionEnd::Dropped;
                    }
                    None => return ConnectionEnd::Dropped,
                },
            }
        }
    }
}
