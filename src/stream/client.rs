//! Websocket connection manager.
//!
//! A background worker owns the socket, the connection state and both
//! liveness trackers. It is driven by a single `tokio::select!` loop over
//! commands, inbound frames, the in-flight connect attempt and the heartbeat
//! and watchdog timers. Callers talk to it through [`ConnectionHandle`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::error::ConnectionError;
use crate::pairing::connection_url;
use crate::retry::{with_timeout, RetryPolicy};
use crate::stream::correlator::EnvelopeSink;
use crate::stream::dispatch::{Dispatcher, LivenessSignal};
use crate::stream::events::AgentNotice;
use crate::stream::liveness::{LivenessTracker, ReconnectGuard, SuspendDetector};
use crate::stream::presence::{run_presence_monitor, PresenceProbe};
use crate::stream::proto::{Envelope, MessageType};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, ConnectionError>> + Send>>;

/// Local development endpoint of the desktop agent.
pub const LOCAL_AGENT_ENDPOINT: &str = "ws://localhost:18080/ws";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const AGENT_PING_INTERVAL: Duration = Duration::from_secs(5);
    pub const SERVER_PING_INTERVAL: Duration = Duration::from_secs(2);
    pub const AGENT_ALLOWED_SILENCE: Duration = Duration::from_secs(11);
    pub const SERVER_ALLOWED_SILENCE: Duration = Duration::from_secs(5);
    pub const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);
    pub const PRESENCE_INTERVAL: Duration = Duration::from_secs(5);
    pub const SUSPEND_TICK: Duration = Duration::from_secs(5);
    pub const RECONNECT_WATCHDOG_TICK: Duration = Duration::from_secs(1);
    pub const STUCK_RECONNECT_CEILING: Duration = Duration::from_secs(8);
    pub const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ERRORS_BEFORE_ACQUIRED: u32 = 6;
    pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(35);
    pub const TOKEN_SKEW: Duration = Duration::from_secs(30);
}

/// Timing and threshold configuration for the connection manager.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    pub agent_ping_interval: Duration,
    pub server_ping_interval: Duration,
    /// Agent silence tolerated before it is reported disconnected.
    pub agent_allowed_silence: Duration,
    /// Relay silence tolerated before the socket is recycled.
    pub server_allowed_silence: Duration,
    pub liveness_check_interval: Duration,
    pub presence_interval: Duration,
    pub suspend_tick: Duration,
    pub reconnect_watchdog_tick: Duration,
    pub stuck_reconnect_ceiling: Duration,
    pub open_timeout: Duration,
    pub reconnect_policy: RetryPolicy,
    /// Consecutive failed attempts, while online, before the agent is
    /// reported as held by another client.
    pub errors_before_acquired: u32,
    pub response_timeout: Duration,
    pub token_skew: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            agent_ping_interval: StreamDefaults::AGENT_PING_INTERVAL,
            server_ping_interval: StreamDefaults::SERVER_PING_INTERVAL,
            agent_allowed_silence: StreamDefaults::AGENT_ALLOWED_SILENCE,
            server_allowed_silence: StreamDefaults::SERVER_ALLOWED_SILENCE,
            liveness_check_interval: StreamDefaults::LIVENESS_CHECK_INTERVAL,
            presence_interval: StreamDefaults::PRESENCE_INTERVAL,
            suspend_tick: StreamDefaults::SUSPEND_TICK,
            reconnect_watchdog_tick: StreamDefaults::RECONNECT_WATCHDOG_TICK,
            stuck_reconnect_ceiling: StreamDefaults::STUCK_RECONNECT_CEILING,
            open_timeout: StreamDefaults::OPEN_TIMEOUT,
            reconnect_policy: RetryPolicy::reconnect(),
            errors_before_acquired: StreamDefaults::ERRORS_BEFORE_ACQUIRED,
            response_timeout: StreamDefaults::RESPONSE_TIMEOUT,
            token_skew: StreamDefaults::TOKEN_SKEW,
        }
    }
}

/// Lifecycle of the single logical connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Reconnecting,
    ClosingControlled,
}

/// Link-level changes consumed by the facade's supervisor.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LinkEvent {
    /// The agent answered again after having been lost.
    AgentReconnected,
    /// The relay answered heartbeats again after having been lost.
    RelayRestored,
    /// Last `isProvisioned` reported by the agent, on change.
    ProvisionState(bool),
    NetworkChanged(bool),
}

#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Send {
        text: String,
        ack: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Reconnect,
    Presence(bool),
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

#[derive(Debug, Default)]
struct LinkFlags {
    agent_connected: AtomicBool,
    server_alive: AtomicBool,
}

impl LinkFlags {
    fn set_agent(&self, connected: bool) {
        self.agent_connected.store(connected, Ordering::SeqCst);
    }

    fn set_server(&self, alive: bool) {
        self.server_alive.store(alive, Ordering::SeqCst);
    }
}

/// Address and options for one connection manager.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub base_url: String,
    pub pairing_id: String,
    pub options: ConnectionOptions,
}

/// Everything produced by [`spawn_connection`].
#[derive(Debug)]
pub struct SpawnedConnection {
    pub handle: ConnectionHandle,
    pub links: mpsc::UnboundedReceiver<LinkEvent>,
    /// Presence poller; abort it to let the worker stop once every handle
    /// is dropped.
    pub presence: JoinHandle<()>,
}

/// Starts the connection worker and the presence poller.
///
/// Must be called from within a tokio runtime.
pub fn spawn_connection(
    config: ConnectionConfig,
    dispatcher: Arc<Dispatcher>,
    probe: Arc<dyn PresenceProbe>,
    clock: Arc<dyn Clock>,
) -> SpawnedConnection {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (links_tx, links_rx) = mpsc::unbounded_channel();
    let flags = Arc::new(LinkFlags::default());
    let presence_interval = config.options.presence_interval;

    let worker = ConnectionWorker {
        liveness: LivenessTracker::new(
            config.options.agent_allowed_silence,
            config.options.server_allowed_silence,
        ),
        suspend: SuspendDetector::new(config.options.suspend_tick),
        guard: ReconnectGuard::new(config.options.stuck_reconnect_ceiling),
        base_url: config.base_url,
        pairing_id: config.pairing_id,
        options: config.options,
        dispatcher,
        clock,
        commands: commands_rx,
        state: state_tx,
        flags: Arc::clone(&flags),
        links: links_tx,
        socket: None,
        attempt: None,
        failed_attempts: 0,
        acquired: false,
        online: true,
        ever_opened: false,
        agent_seen: false,
        relay_seen: false,
        provisioned: None,
        closing: false,
    };
    tokio::spawn(worker.run());

    let presence = tokio::spawn(run_presence_monitor(
        probe,
        presence_interval,
        commands_tx.clone(),
    ));

    SpawnedConnection {
        handle: ConnectionHandle {
            commands: commands_tx,
            state: state_rx,
            flags,
        },
        links: links_rx,
        presence,
    }
}

/// Cloneable handle to the connection worker.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    state: watch::Receiver<ConnectionState>,
    flags: Arc<LinkFlags>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Relay heartbeat liveness, independent of the socket being open.
    pub fn is_server_alive(&self) -> bool {
        self.flags.server_alive.load(Ordering::SeqCst)
    }

    pub fn is_agent_connected(&self) -> bool {
        self.flags.agent_connected.load(Ordering::SeqCst)
    }

    /// Receiver that observes every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Waits until the connection is `Open`. Returns `false` on timeout.
    pub async fn wait_for_open(&self, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        let opened = matches!(
            with_timeout(timeout, state.wait_for(|state| *state == ConnectionState::Open)).await,
            Ok(Ok(_))
        );
        opened
    }

    /// Forces a reconnect, subject to the single-attempt guard.
    pub fn reconnect(&self) -> Result<(), ConnectionError> {
        self.commands
            .send(WorkerCommand::Reconnect)
            .map_err(|_| ConnectionError::WorkerStopped)
    }

    /// Controlled close. Automatic reconnect stops for good.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(WorkerCommand::Shutdown { ack }).is_ok() {
            let _ = done.await;
        }
    }
}

#[async_trait]
impl EnvelopeSink for ConnectionHandle {
    fn is_open(&self) -> bool {
        ConnectionHandle::is_open(self)
    }

    async fn transmit(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let text = envelope.to_text()?;
        let (ack, done) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Send { text, ack })
            .map_err(|_| ConnectionError::WorkerStopped)?;
        done.await.map_err(|_| ConnectionError::WorkerStopped)?
    }
}

struct ConnectionWorker {
    base_url: String,
    pairing_id: String,
    options: ConnectionOptions,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    state: watch::Sender<ConnectionState>,
    flags: Arc<LinkFlags>,
    links: mpsc::UnboundedSender<LinkEvent>,
    socket: Option<WsStream>,
    attempt: Option<ConnectFuture>,
    liveness: LivenessTracker,
    suspend: SuspendDetector,
    guard: ReconnectGuard,
    failed_attempts: u32,
    acquired: bool,
    online: bool,
    ever_opened: bool,
    agent_seen: bool,
    relay_seen: bool,
    provisioned: Option<bool>,
    closing: bool,
}

impl ConnectionWorker {
    async fn run(mut self) {
        info!(event = "connection_worker_started", pairing_id = %self.pairing_id);
        self.suspend.observe(self.clock.now_ms());
        self.begin_reconnect("initial_connect");

        let mut agent_ping = ticker(self.options.agent_ping_interval);
        let mut server_ping = ticker(self.options.server_ping_interval);
        let mut liveness_check = ticker(self.options.liveness_check_interval);
        let mut suspend_watch = ticker(self.options.suspend_tick);
        let mut reconnect_watch = ticker(self.options.reconnect_watchdog_tick);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(WorkerCommand::Send { text, ack }) => {
                            let result = self.send_text(text).await;
                            let _ = ack.send(result);
                        }
                        Some(WorkerCommand::Reconnect) => self.begin_reconnect("requested"),
                        Some(WorkerCommand::Presence(online)) => self.on_presence(online),
                        Some(WorkerCommand::Shutdown { ack }) => {
                            self.close_controlled().await;
                            let _ = ack.send(());
                            return;
                        }
                        None => {
                            self.close_controlled().await;
                            return;
                        }
                    }
                }
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
                outcome = poll_attempt(&mut self.attempt) => {
                    if self.on_attempt(outcome).await {
                        agent_ping.reset();
                        server_ping.reset();
                        liveness_check.reset();
                    }
                }
                _ = agent_ping.tick() => self.send_heartbeat(MessageType::Ping).await,
                _ = server_ping.tick() => self.send_heartbeat(MessageType::ServerPing).await,
                _ = liveness_check.tick() => self.check_liveness(),
                _ = suspend_watch.tick() => self.check_suspend(),
                _ = reconnect_watch.tick() => self.check_stuck(),
            }
        }
    }

    fn begin_reconnect(&mut self, reason: &'static str) {
        if self.closing {
            return;
        }
        let now = Instant::now();
        if self.guard.in_flight() && !self.guard.is_stuck(now) {
            debug!(event = "reconnect_already_in_flight", reason);
            return;
        }

        self.teardown();
        self.set_state(if self.ever_opened {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });
        if !self.online {
            info!(event = "reconnect_suppressed_offline", reason);
            return;
        }
        if !self.guard.try_begin(now) {
            return;
        }

        let delay = if self.failed_attempts == 0 {
            Duration::ZERO
        } else {
            self.options
                .reconnect_policy
                .delay_for_attempt(self.failed_attempts as usize)
        };
        info!(
            event = "reconnect_started",
            reason,
            failures = self.failed_attempts,
            delay_ms = delay.as_millis() as u64
        );
        let url = connection_url(&self.base_url, &self.pairing_id);
        self.attempt = Some(connect_future(url, delay, self.options.open_timeout));
    }

    /// Drops the socket and any attempt, flushes pending calls, and reports
    /// both peers lost if they were alive.
    fn teardown(&mut self) {
        self.attempt = None;
        if self.socket.take().is_some() {
            info!(event = "connection_lost");
        }
        self.dispatcher.correlator().flush_all();

        let subscribers = self.dispatcher.subscribers();
        if self.liveness.agent.mark_down() {
            subscribers.notify_agent(AgentNotice::Disconnected);
        }
        if self.liveness.server.mark_down() {
            subscribers.notify_agent(AgentNotice::BrowserDisconnected);
        }
        self.flags.set_agent(false);
        self.flags.set_server(false);
    }

    /// Returns `true` when the attempt produced an open socket.
    async fn on_attempt(&mut self, outcome: Result<WsStream, ConnectionError>) -> bool {
        self.attempt = None;
        self.guard.finish();
        match outcome {
            Ok(socket) => {
                self.on_open(socket).await;
                true
            }
            Err(err) => {
                self.failed_attempts = self.failed_attempts.saturating_add(1);
                warn!(
                    event = "connect_attempt_failed",
                    failures = self.failed_attempts,
                    error = %err
                );
                if self.online
                    && !self.acquired
                    && self.failed_attempts >= self.options.errors_before_acquired
                {
                    self.acquired = true;
                    warn!(event = "desktop_agent_acquired", failures = self.failed_attempts);
                    self.dispatcher
                        .subscribers()
                        .notify_agent(AgentNotice::Acquired);
                }
                self.begin_reconnect("connect_failed");
                false
            }
        }
    }

    async fn on_open(&mut self, socket: WsStream) {
        self.socket = Some(socket);
        self.failed_attempts = 0;
        self.acquired = false;
        self.provisioned = None;
        self.ever_opened = true;
        self.liveness.reset_on_open(Instant::now());
        self.suspend.observe(self.clock.now_ms());
        self.set_state(ConnectionState::Open);
        info!(event = "connection_open");
        self.dispatcher
            .subscribers()
            .notify_agent(AgentNotice::Released);

        for kind in [
            MessageType::Ping,
            MessageType::ServerPing,
            MessageType::IsDesktopAgentConnected,
        ] {
            self.send_heartbeat(kind).await;
        }
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => self.on_text(&text),
            Some(Ok(Message::Ping(payload))) => {
                let failed = match self.socket.as_mut() {
                    Some(socket) => socket.send(Message::Pong(payload)).await.is_err(),
                    None => false,
                };
                if failed {
                    self.begin_reconnect("pong_send_failed");
                }
            }
            Some(Ok(Message::Close(frame))) => {
                info!(event = "socket_closed_by_peer", frame = ?frame);
                self.begin_reconnect("closed_by_peer");
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!(event = "socket_error", error = %err);
                self.begin_reconnect("socket_error");
            }
            None => self.begin_reconnect("stream_ended"),
        }
    }

    fn on_text(&mut self, text: &str) {
        let envelope = match Envelope::from_text(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "inbound_decode_failed", error = %err);
                return;
            }
        };
        if !envelope.kind.is_heartbeat() {
            debug!(
                event = "envelope_received",
                kind = envelope.kind.as_str(),
                msg_id = %envelope.msg_id
            );
        }
        if let Some(signal) = self.dispatcher.dispatch(envelope) {
            self.on_liveness(signal);
        }
    }

    fn on_liveness(&mut self, signal: LivenessSignal) {
        let now = Instant::now();
        match signal {
            LivenessSignal::AgentPong { is_provisioned } => {
                self.agent_alive(now);
                if let Some(provisioned) = is_provisioned {
                    if self.provisioned != Some(provisioned) {
                        self.provisioned = Some(provisioned);
                        self.emit(LinkEvent::ProvisionState(provisioned));
                    }
                }
            }
            LivenessSignal::AgentConnected => self.agent_alive(now),
            LivenessSignal::AgentDisconnected => {
                if self.liveness.agent.mark_down() {
                    self.flags.set_agent(false);
                    info!(event = "desktop_agent_disconnected", source = "relay");
                    self.dispatcher
                        .subscribers()
                        .notify_agent(AgentNotice::Disconnected);
                }
            }
            LivenessSignal::ServerPong => {
                if self.liveness.server.record_pong(now) {
                    self.flags.set_server(true);
                    info!(event = "relay_heartbeat_restored", reconnected = self.relay_seen);
                    self.dispatcher
                        .subscribers()
                        .notify_agent(AgentNotice::BrowserConnected);
                    if self.relay_seen {
                        self.emit(LinkEvent::RelayRestored);
                    }
                    self.relay_seen = true;
                }
            }
        }
    }

    fn agent_alive(&mut self, now: Instant) {
        if !self.liveness.agent.record_pong(now) {
            return;
        }
        self.flags.set_agent(true);
        info!(event = "desktop_agent_connected", reconnected = self.agent_seen);
        self.dispatcher
            .subscribers()
            .notify_agent(AgentNotice::Connected);
        if self.agent_seen {
            self.emit(LinkEvent::AgentReconnected);
        }
        self.agent_seen = true;
    }

    fn check_liveness(&mut self) {
        if self.socket.is_none() {
            return;
        }
        let now = Instant::now();
        if self.liveness.agent.check(now) {
            self.flags.set_agent(false);
            warn!(event = "desktop_agent_heartbeat_lost");
            self.dispatcher
                .subscribers()
                .notify_agent(AgentNotice::Disconnected);
        }
        if self.liveness.server.check(now) {
            self.flags.set_server(false);
            warn!(event = "relay_heartbeat_lost");
            self.dispatcher
                .subscribers()
                .notify_agent(AgentNotice::BrowserDisconnected);
            self.begin_reconnect("server_heartbeat_timeout");
        }
    }

    fn check_suspend(&mut self) {
        if let Some(gap_ms) = self.suspend.observe(self.clock.now_ms()) {
            warn!(event = "suspend_detected", gap_ms);
            self.begin_reconnect("suspend_detected");
        }
    }

    fn check_stuck(&mut self) {
        if self.guard.is_stuck(Instant::now()) {
            warn!(event = "reconnect_stuck");
            self.begin_reconnect("stuck_reconnect");
        }
    }

    fn on_presence(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;
        self.emit(LinkEvent::NetworkChanged(online));
        if online {
            info!(event = "network_online");
            self.failed_attempts = 0;
            self.guard.finish();
            self.begin_reconnect("network_restored");
        } else {
            info!(event = "network_offline");
            if self.attempt.take().is_some() {
                self.guard.finish();
            }
        }
    }

    async fn send_heartbeat(&mut self, kind: MessageType) {
        if self.socket.is_none() {
            return;
        }
        let text = match Envelope::new(kind, json!({})).to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(event = "heartbeat_encode_failed", error = %err);
                return;
            }
        };
        trace!(event = "heartbeat_sent", kind = kind.as_str());
        if let Err(err) = self.write(text).await {
            warn!(event = "heartbeat_send_failed", kind = kind.as_str(), error = %err);
            self.begin_reconnect("heartbeat_send_failed");
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ConnectionError> {
        match self.write(text).await {
            Ok(()) => Ok(()),
            Err(ConnectionError::NotOpen) => Err(ConnectionError::NotOpen),
            Err(err) => {
                warn!(event = "send_failed", error = %err);
                self.begin_reconnect("send_failed");
                Err(err)
            }
        }
    }

    async fn write(&mut self, text: String) -> Result<(), ConnectionError> {
        let socket = self.socket.as_mut().ok_or(ConnectionError::NotOpen)?;
        socket.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close_controlled(&mut self) {
        self.closing = true;
        self.set_state(ConnectionState::ClosingControlled);
        self.attempt = None;
        self.guard.finish();
        if let Some(mut socket) = self.socket.take() {
            if let Err(err) = socket.close(None).await {
                debug!(event = "close_frame_failed", error = %err);
            }
        }
        let flushed = self.dispatcher.correlator().flush_all();
        self.flags.set_agent(false);
        self.flags.set_server(false);
        self.set_state(ConnectionState::Disconnected);
        info!(event = "connection_closed", flushed);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(event = "connection_state_changed", from = ?previous, to = ?state);
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.links.send(event);
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn connect_future(url: String, delay: Duration, open_timeout: Duration) -> ConnectFuture {
    Box::pin(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match with_timeout(open_timeout, connect_async(url)).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(err)) => Err(ConnectionError::WebSocket(err)),
            Err(_) => Err(ConnectionError::OpenTimeout(open_timeout.as_millis() as u64)),
        }
    })
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket.as_mut() {
        Some(socket) => socket.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_attempt(attempt: &mut Option<ConnectFuture>) -> Result<WsStream, ConnectionError> {
    match attempt.as_mut() {
        Some(attempt) => attempt.await,
        None => std::future::pending().await,
    }
}
