//! Connection driver.
//!
//! One tokio task owns the socket, the lifecycle [`machine::Machine`], the
//! outbound queue, the subscription registry and the heartbeat. Callers talk
//! to it through a cloneable [`ConnectionHandle`]; every call except
//! `connect`/`disconnect` is fire-and-forget and never blocks, even while
//! the socket is down.

use std::sync::Arc;
use std::time::Duration;

use taskbot_proto::{Envelope, Inbound, Message, Topic};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::heartbeat::Heartbeat;
use crate::metrics;
use crate::subscription::SubscriptionRegistry;
use crate::transport::{Connector, Transport, TransportError, TransportEvent};

pub mod machine;
pub mod queue;

pub use machine::{ConnectionState, ConnectionStatus, ReconnectPolicy};
pub use queue::QueueStats;

use machine::{Machine, Step};
use queue::OutboundQueue;

/// Receives every decoded inbound envelope and every state change, on the
/// driver task, in arrival order.
pub trait InboundSink: Send + Sync {
    fn deliver(&self, envelope: &Envelope);

    fn status_changed(&self, _status: &ConnectionStatus) {}
}

/// Sink that ignores everything; for callers that only send.
pub struct NullSink;

impl InboundSink for NullSink {
    fn deliver(&self, _envelope: &Envelope) {}
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub policy: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl From<&SyncConfig> for DriverSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            policy: ReconnectPolicy {
                base_delay: config.base_delay,
                max_attempts: config.max_attempts,
            },
            heartbeat_interval: config.heartbeat_interval,
            pong_timeout: config.pong_timeout,
            connect_timeout: config.connect_timeout,
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Point-in-time view of the driver internals.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverStats {
    pub state: ConnectionState,
    pub queue: QueueStats,
    /// Round trip of the most recently answered ping.
    pub last_rtt: Option<Duration>,
    /// Active topics sorted by their display form.
    pub active_topics: Vec<Topic>,
}

enum Command {
    Connect {
        url: Url,
        token: Option<String>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send(Envelope),
    Subscribe(Topic),
    Unsubscribe(Topic),
    Stats(oneshot::Sender<DriverStats>),
    Shutdown,
}

#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    /// Starts the driver task. Must be called inside a tokio runtime.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        settings: DriverSettings,
        sink: Arc<dyn InboundSink>,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::initial());
        let driver = Driver {
            connector,
            heartbeat: Heartbeat::new(settings.heartbeat_interval, settings.pong_timeout),
            machine: Machine::new(settings.policy),
            settings,
            sink,
            commands: commands_rx,
            status_tx,
            queue: OutboundQueue::new(),
            registry: SubscriptionRegistry::new(),
            target: None,
            transport: None,
            connecting: None,
            retry_at: None,
            ticker: None,
            waiters: Vec::new(),
            auth_request: None,
        };
        let task = tokio::spawn(driver.run());
        (
            Self {
                commands: commands_tx,
                status: status_rx,
            },
            task,
        )
    }

    /// Resolves once the socket is open, or with the error that put the
    /// connection into `Error`. Already connected resolves immediately.
    pub async fn connect(&self, url: Url, token: Option<String>) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { url, token, reply })
            .map_err(|_| SyncError::DriverGone)?;
        rx.await.map_err(|_| SyncError::DriverGone)?
    }

    /// Closes the socket and cancels any pending reconnect. Idempotent.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Writes now when connected, otherwise queues until the next connect.
    pub fn send(&self, envelope: impl Into<Envelope>) {
        if self.commands.send(Command::Send(envelope.into())).is_err() {
            debug!(target = "taskbot.sync.connection", "send after driver shutdown ignored");
        }
    }

    pub fn subscribe(&self, topic: Topic) {
        let _ = self.commands.send(Command::Subscribe(topic));
    }

    pub fn unsubscribe(&self, topic: Topic) {
        let _ = self.commands.send(Command::Unsubscribe(topic));
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Waits until the connection reaches `state`.
    pub async fn wait_for(&self, state: ConnectionState) -> SyncResult<ConnectionStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|status| status.state == state)
            .await
            .map_err(|_| SyncError::DriverGone)?;
        Ok(status.clone())
    }

    pub async fn stats(&self) -> SyncResult<DriverStats> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(reply))
            .map_err(|_| SyncError::DriverGone)?;
        rx.await.map_err(|_| SyncError::DriverGone)
    }

    /// Asks the driver to close the socket and exit.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Target {
    url: Url,
    token: Option<String>,
}

type ConnectTask = JoinHandle<Result<Box<dyn Transport>, TransportError>>;

struct Driver {
    connector: Arc<dyn Connector>,
    settings: DriverSettings,
    sink: Arc<dyn InboundSink>,
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    machine: Machine,
    queue: OutboundQueue,
    registry: SubscriptionRegistry,
    heartbeat: Heartbeat,
    target: Option<Target>,
    transport: Option<Box<dyn Transport>>,
    connecting: Option<ConnectTask>,
    retry_at: Option<Instant>,
    ticker: Option<Interval>,
    waiters: Vec<oneshot::Sender<SyncResult<()>>>,
    /// Correlation id of the authenticate frame sent on the current socket.
    auth_request: Option<String>,
}

impl Driver {
    async fn run(mut self) {
        debug!(target = "taskbot.sync.connection", "driver started");
        loop {
            let pong_deadline = self.heartbeat.pong_deadline();
            let retry_at = self.retry_at;
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                result = wait_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.handle_connect_result(result);
                }
                event = next_event(&mut self.transport) => self.handle_transport_event(event).await,
                _ = next_tick(&mut self.ticker) => self.send_ping(),
                _ = sleep_until(pong_deadline) => self.heartbeat_expired().await,
                _ = sleep_until(retry_at) => {
                    self.retry_at = None;
                    let step = self.machine.backoff_elapsed();
                    self.apply_step(step);
                }
            }
        }
        self.disconnect().await;
        debug!(target = "taskbot.sync.connection", "driver stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { url, token, reply } => self.connect(url, token, reply),
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Send(envelope) => self.send(envelope),
            Command::Subscribe(topic) => self.subscribe(topic),
            Command::Unsubscribe(topic) => self.unsubscribe(topic),
            Command::Stats(reply) => {
                let mut active_topics: Vec<Topic> = self.registry.active().cloned().collect();
                active_topics.sort_by_key(ToString::to_string);
                let _ = reply.send(DriverStats {
                    state: self.machine.state(),
                    queue: self.queue.stats(),
                    last_rtt: self.heartbeat.last_rtt(),
                    active_topics,
                });
            }
            Command::Shutdown => {}
        }
    }

    fn connect(&mut self, url: Url, token: Option<String>, reply: oneshot::Sender<SyncResult<()>>) {
        if self.machine.state() == ConnectionState::Connected {
            let _ = reply.send(Ok(()));
            return;
        }
        info!(target = "taskbot.sync.connection", url = %url, "connect requested");
        self.target = Some(Target { url, token });
        self.waiters.push(reply);
        self.retry_at = None;
        let step = self.machine.connect_requested();
        self.apply_step(step);
    }

    fn apply_step(&mut self, step: Step) {
        match step {
            Step::Open => self.start_open(),
            Step::Backoff(delay) => {
                metrics::RECONNECT_ATTEMPTS.inc();
                info!(
                    target = "taskbot.sync.connection",
                    attempt = self.machine.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            Step::GiveUp => {
                let error = self
                    .machine
                    .status()
                    .last_error
                    .unwrap_or(SyncError::ReconnectExhausted(self.settings.policy.max_attempts));
                warn!(target = "taskbot.sync.connection", error = %error, "giving up on reconnect");
                self.resolve_waiters(Err(error));
            }
            Step::Idle => {}
        }
        self.publish_status();
    }

    fn start_open(&mut self) {
        let Some(target) = &self.target else {
            self.open_failed(TransportError::InvalidUrl("no connect target".into()));
            return;
        };
        let connector = Arc::clone(&self.connector);
        let url = target.url.clone();
        let timeout = self.settings.connect_timeout;
        debug!(target = "taskbot.sync.connection", url = %url, "opening socket");
        self.connecting = Some(tokio::spawn(async move {
            match tokio::time::timeout(timeout, connector.connect(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        }));
    }

    fn handle_connect_result(&mut self, result: Result<Box<dyn Transport>, TransportError>) {
        match result {
            Ok(transport) => self.opened(transport),
            Err(err) => self.open_failed(err),
        }
    }

    fn open_failed(&mut self, err: TransportError) {
        warn!(target = "taskbot.sync.connection", error = %err, "failed to open socket");
        let step = self.machine.open_failed(SyncError::Transport(err.clone()));
        if self.machine.state() == ConnectionState::Error {
            self.resolve_waiters(Err(SyncError::Transport(err)));
        }
        self.apply_step(step);
    }

    fn opened(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.machine.opened();

        self.auth_request = None;
        if let Some(token) = self.target.as_ref().and_then(|t| t.token.clone()) {
            let envelope = Envelope::new(Message::Authenticate { token }).correlated();
            self.auth_request = envelope.request_id.clone();
            let _ = self.write(envelope);
        }
        let flushed = self.flush_queue();
        let resubscribed = self.resubscribe();

        self.heartbeat.reset();
        self.ticker = heartbeat_ticker(self.heartbeat.interval());

        info!(
            target = "taskbot.sync.connection",
            flushed,
            resubscribed,
            "connected"
        );
        self.publish_status();
        self.resolve_waiters(Ok(()));
    }

    fn flush_queue(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(envelope) = self.queue.pop() {
            if let Err(envelope) = self.write(envelope) {
                self.queue.requeue_front(envelope);
                break;
            }
            flushed += 1;
        }
        flushed
    }

    fn resubscribe(&mut self) -> usize {
        let topics: Vec<Topic> = self.registry.active().cloned().collect();
        let mut sent = 0;
        for topic in topics {
            if self.write(Envelope::new(Message::Subscribe(topic))).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Writes straight to the socket. Hands the envelope back if there is no
    /// socket or the writer is gone, so the caller can keep it.
    fn write(&mut self, envelope: Envelope) -> Result<(), Envelope> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(envelope);
        };
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    target = "taskbot.sync.connection",
                    kind = envelope.kind(),
                    error = %err,
                    "dropping envelope that failed to encode"
                );
                return Ok(());
            }
        };
        match transport.send(frame) {
            Ok(()) => {
                metrics::FRAMES_SENT
                    .with_label_values(&[envelope.kind()])
                    .inc();
                trace!(target = "taskbot.sync.connection", kind = envelope.kind(), "frame sent");
                Ok(())
            }
            Err(err) => {
                debug!(target = "taskbot.sync.connection", error = %err, "socket write failed");
                Err(envelope)
            }
        }
    }

    fn send(&mut self, envelope: Envelope) {
        if self.machine.state() == ConnectionState::Connected {
            if let Err(envelope) = self.write(envelope) {
                self.queue.push(envelope);
            }
        } else {
            trace!(
                target = "taskbot.sync.connection",
                kind = envelope.kind(),
                state = %self.machine.state(),
                "queueing envelope until connected"
            );
            self.queue.push(envelope);
        }
    }

    // While disconnected the registry itself holds the intent; `opened`
    // replays every active topic, so nothing is queued here.
    fn subscribe(&mut self, topic: Topic) {
        if !self.registry.acquire(topic.clone()) {
            return;
        }
        debug!(target = "taskbot.sync.subscription", topic = %topic, "topic active");
        if self.machine.state() == ConnectionState::Connected {
            let _ = self.write(Envelope::new(Message::Subscribe(topic)));
        }
    }

    fn unsubscribe(&mut self, topic: Topic) {
        if !self.registry.release(&topic) {
            return;
        }
        debug!(target = "taskbot.sync.subscription", topic = %topic, "topic released");
        if self.machine.state() == ConnectionState::Connected {
            let _ = self.write(Envelope::new(Message::Unsubscribe(topic)));
        }
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => self.handle_frame(&text).await,
            TransportEvent::Closed { code, reason } => {
                warn!(
                    target = "taskbot.sync.connection",
                    code = ?code,
                    reason = %reason,
                    "socket closed unexpectedly"
                );
                self.lost(SyncError::Transport(TransportError::Lost(reason)));
            }
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(Inbound::Envelope(envelope)) => envelope,
            Ok(Inbound::Unknown { kind }) => {
                metrics::FRAMES_RECEIVED.with_label_values(&["unknown"]).inc();
                debug!(target = "taskbot.sync.connection", kind = %kind, "ignoring unknown envelope kind");
                return;
            }
            Err(err) => {
                metrics::FRAMES_MALFORMED.inc();
                warn!(target = "taskbot.sync.connection", error = %err, "dropping malformed frame");
                return;
            }
        };
        metrics::FRAMES_RECEIVED
            .with_label_values(&[envelope.kind()])
            .inc();

        match &envelope.message {
            Message::Pong => {
                if let Some(rtt) = self.heartbeat.pong_received(Instant::now()) {
                    trace!(
                        target = "taskbot.sync.heartbeat",
                        rtt_ms = rtt.as_millis() as u64,
                        "pong"
                    );
                }
            }
            Message::Ping => {
                let _ = self.write(Envelope::new(Message::Pong));
            }
            Message::Authenticated { user_id } => {
                let request_id = self.auth_reply(&envelope);
                info!(
                    target = "taskbot.sync.connection",
                    user_id = ?user_id,
                    request_id = ?request_id,
                    "authenticated"
                );
            }
            Message::AuthenticationFailed { reason } => {
                let request_id = self.auth_reply(&envelope);
                self.reject(reason.clone(), request_id).await;
            }
            _ => {}
        }
        self.sink.deliver(&envelope);
    }

    /// Matches an authentication reply against the pending authenticate
    /// frame. Replies that echo no id are still honoured.
    fn auth_reply(&mut self, envelope: &Envelope) -> Option<String> {
        let echoed = envelope.request_id.as_deref()?;
        if self.auth_request.as_deref() == Some(echoed) {
            return self.auth_request.take();
        }
        debug!(
            target = "taskbot.sync.connection",
            request_id = %echoed,
            pending = ?self.auth_request,
            "authentication reply for another request"
        );
        None
    }

    fn send_ping(&mut self) {
        if self.machine.state() != ConnectionState::Connected {
            return;
        }
        if self.write(Envelope::new(Message::Ping)).is_ok() {
            self.heartbeat.ping_sent(Instant::now());
        }
    }

    async fn heartbeat_expired(&mut self) {
        let timeout = self.heartbeat.pong_timeout().unwrap_or_default();
        warn!(
            target = "taskbot.sync.heartbeat",
            timeout_ms = timeout.as_millis() as u64,
            "pong overdue, dropping socket"
        );
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.lost(SyncError::HeartbeatTimeout(timeout));
    }

    fn lost(&mut self, error: SyncError) {
        self.transport = None;
        self.ticker = None;
        self.heartbeat.reset();
        let step = self.machine.unclean_close(error);
        self.apply_step(step);
    }

    async fn reject(&mut self, reason: String, request_id: Option<String>) {
        warn!(
            target = "taskbot.sync.connection",
            reason = %reason,
            request_id = ?request_id,
            "authentication rejected"
        );
        self.close_socket().await;
        let error = SyncError::AuthenticationRejected(reason);
        self.machine.fail(error.clone());
        self.publish_status();
        self.resolve_waiters(Err(error));
    }

    async fn disconnect(&mut self) {
        self.close_socket().await;
        if self.machine.disconnect() {
            info!(target = "taskbot.sync.connection", "disconnected");
        }
        self.publish_status();
        self.resolve_waiters(Err(SyncError::Cancelled));
    }

    async fn close_socket(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        self.retry_at = None;
        self.ticker = None;
        self.heartbeat.reset();
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    fn resolve_waiters(&mut self, result: SyncResult<()>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn publish_status(&mut self) {
        let status = self.machine.status();
        let changed = self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status.clone();
                true
            }
        });
        if changed {
            debug!(
                target = "taskbot.sync.connection",
                state = %status.state,
                attempt = status.attempt,
                "connection state changed"
            );
            self.sink.status_changed(&status);
        }
    }
}

fn heartbeat_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn wait_connect(
    task: &mut Option<ConnectTask>,
) -> Result<Box<dyn Transport>, TransportError> {
    match task {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(err) => Err(TransportError::Connect(format!("connect task failed: {err}"))),
        },
        None => std::future::pending().await,
    }
}

async fn next_event(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
    match transport {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
