//! Native feed engine: `tokio` task + `tokio-tungstenite`.
//!
//! The engine runs as one background task that owns every piece of
//! connection state:
//! - Entitlement check and endpoint lookup through a [`SessionProvider`]
//! - `graphql-transport-ws` handshake and a single live subscription
//! - Idle (heartbeat) and connect watchdogs
//! - Exponential backoff with jitter, gradual recovery, stable-reset
//! - Rate-limit cooldown and a hard-reset circuit breaker
//!
//! [`FeedClient`] talks to the task over an mpsc command channel, receives
//! [`FeedEvent`]s over a second channel and reads a [`FeedStatus`] snapshot
//! from a `watch` channel. Nothing inside the task returns errors; every
//! problem becomes an event and a transition.

use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::config::FeedConfig;
use crate::error::{FeedError, SessionError};
use crate::feed::backoff::{BackoffCalculator, BackoffState};
use crate::feed::codec::{self, Frame, MessageOut};
use crate::feed::rate_limit::RateLimitGuard;
use crate::feed::supervisor::HardResetSupervisor;
use crate::feed::timers::{Timer, Watchdogs};
use crate::feed::transport::{Connector, Transport};
use crate::feed::{ConnectionState, FeedEvent, FeedStatus};
use crate::session::SessionProvider;

const EVENT_CHANNEL_SIZE: usize = 256;
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Bound on the graceful `complete` + `connection_terminate` + close sequence.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Server-side `complete` reconnects after a random delay in this range (ms).
const COMPLETE_RECONNECT_MS: (u64, u64) = (1_000, 3_000);

/// Close codes that mean "too many requests".
const RATE_LIMIT_CLOSE_CODES: [u16; 2] = [4429, 1008];

/// `graphql-transport-ws` close codes for a rejected credential.
const AUTH_CLOSE_CODES: [u16; 2] = [4401, 4403];

// ─── Commands from public API to background task ─────────────────────────────

#[derive(Debug)]
enum Command {
    Connect,
    Close,
    SetActive(bool),
    Reauthenticate,
    Shutdown,
}

// ─── Failure classification ──────────────────────────────────────────────────

#[derive(Debug)]
enum Failure {
    /// Socket error, unexpected close, timeout. Retried with backoff.
    Transient(String),
    /// Error frame reported by the server. Retried with backoff.
    Protocol(String),
    /// "Too many requests". Retried only after the cooldown.
    RateLimited {
        retry_after: Option<Duration>,
        reason: String,
    },
    /// Credential rejected by the feed itself. Halts retries.
    AuthenticationDenied(String),
}

impl Failure {
    fn reason(&self) -> &str {
        match self {
            Failure::Transient(reason)
            | Failure::Protocol(reason)
            | Failure::RateLimited { reason, .. }
            | Failure::AuthenticationDenied(reason) => reason,
        }
    }
}

/// Why a connection attempt did not produce a transport.
#[derive(Debug)]
enum AttemptError {
    /// Credential or entitlement rejected. Sticky.
    Denied(String),
    Failed(Failure),
}

impl From<SessionError> for AttemptError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AuthenticationDenied(reason) => AttemptError::Denied(reason),
            SessionError::RateLimited { retry_after } => {
                AttemptError::Failed(Failure::RateLimited {
                    retry_after,
                    reason: format!("Session provider rate limited (retry after {:?})", retry_after),
                })
            }
            SessionError::Transient(reason) => AttemptError::Failed(Failure::Transient(reason)),
        }
    }
}

impl From<FeedError> for AttemptError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::RateLimited { retry_after } => AttemptError::Failed(Failure::RateLimited {
                retry_after,
                reason: format!("Upgrade rejected with 429 (retry after {:?})", retry_after),
            }),
            other => AttemptError::Failed(Failure::Transient(other.to_string())),
        }
    }
}

/// Result of the async part of a connection attempt.
struct Opened {
    transport: Transport,
    url: String,
    token: String,
}

enum Interrupt {
    Finished(Result<Opened, AttemptError>),
    TimedOut,
    Command(Option<Command>),
}

// ─── Public FeedClient ───────────────────────────────────────────────────────

/// Handle to a running feed engine.
///
/// Dropping the handle aborts the background task.
pub struct FeedClient {
    cmd_tx: mpsc::Sender<Command>,
    event_rx: tokio::sync::Mutex<mpsc::Receiver<FeedEvent>>,
    status_rx: watch::Receiver<FeedStatus>,
    rate_limit: RateLimitGuard,
    task_handle: Option<JoinHandle<()>>,
}

impl FeedClient {
    /// Spawn an engine with its own rate-limit cooldown.
    ///
    /// Must be called from within a tokio runtime. If `config.active` is set
    /// the first attempt starts immediately.
    pub fn spawn<P, C>(config: FeedConfig, provider: P, connector: C) -> Self
    where
        P: SessionProvider,
        C: Connector,
    {
        let guard = RateLimitGuard::new(config.rate_limit_cooldown);
        Self::spawn_with_guard(config, provider, connector, guard)
    }

    /// Spawn an engine that shares `guard` with other engines, so a cooldown
    /// seen by one suppresses attempts on all of them.
    pub fn spawn_with_guard<P, C>(
        config: FeedConfig,
        provider: P,
        connector: C,
        guard: RateLimitGuard,
    ) -> Self
    where
        P: SessionProvider,
        C: Connector,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (status_tx, status_rx) = watch::channel(FeedStatus {
            active: config.active,
            ..FeedStatus::default()
        });

        let engine = Engine {
            calc: BackoffCalculator::new(config.backoff_base, config.backoff_max),
            supervisor: HardResetSupervisor::new(config.max_consecutive_failures),
            active: config.active,
            config,
            provider,
            connector,
            event_tx,
            status_tx,
            guard: guard.clone(),
            state: ConnectionState::Idle,
            unauthenticated: false,
            entitled: false,
            backoff: BackoffState::default(),
            timers: Watchdogs::new(),
            transport: None,
            operation_id: 0,
            heartbeat_reconnect_pending: false,
            hard_resets: 0,
        };

        let handle = tokio::spawn(engine.run(cmd_rx));

        Self {
            cmd_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
            status_rx,
            rate_limit: guard,
            task_handle: Some(handle),
        }
    }

    /// Engine backed by the HTTP session provider and the tungstenite
    /// transport.
    #[cfg(feature = "http")]
    pub fn new(config: FeedConfig) -> Result<Self, crate::error::SdkError> {
        use crate::feed::transport::TungsteniteConnector;
        use crate::session::HttpSessionProvider;
        use crate::user_agent::UserAgent;

        let provider = HttpSessionProvider::new(&config.endpoint)?;
        let connector =
            TungsteniteConnector::new(UserAgent::new(config.endpoint.user_agent.as_deref()));
        Ok(Self::spawn(config, provider, connector))
    }

    fn send(&self, cmd: Command) -> Result<(), FeedError> {
        self.cmd_tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FeedError::CommandChannelFull,
            mpsc::error::TrySendError::Closed(_) => FeedError::EngineStopped,
        })
    }

    /// Mark the feed active and schedule a connection attempt.
    ///
    /// No-op while an attempt is in flight, a retry is pending or the
    /// subscription is live.
    pub fn connect(&self) -> Result<(), FeedError> {
        self.send(Command::Connect)
    }

    /// Mark the feed inactive, unsubscribe gracefully if subscribed, and
    /// cancel every timer. Idempotent.
    pub fn close(&self) -> Result<(), FeedError> {
        self.send(Command::Close)
    }

    /// `true` behaves like [`connect`](Self::connect), `false` like
    /// [`close`](Self::close).
    pub fn set_active(&self, active: bool) -> Result<(), FeedError> {
        self.send(Command::SetActive(active))
    }

    /// Clear a sticky authentication failure after the credential has been
    /// fixed, and retry if the feed is active.
    pub fn reauthenticate(&self) -> Result<(), FeedError> {
        self.send(Command::Reauthenticate)
    }

    /// Latest status snapshot.
    pub fn status(&self) -> FeedStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that is notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<FeedStatus> {
        self.status_rx.clone()
    }

    /// The cooldown guard this engine consults.
    pub fn rate_limit_guard(&self) -> &RateLimitGuard {
        &self.rate_limit
    }

    /// Get a stream of events from the engine.
    ///
    /// The returned stream borrows `self`, so it must be dropped
    /// before calling `shutdown()`.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = FeedEvent> + Send + '_>> {
        Box::pin(futures_util::stream::unfold(
            &self.event_rx,
            |rx| async move {
                let mut guard = rx.lock().await;
                guard.recv().await.map(|event| (event, rx))
            },
        ))
    }

    /// Only the measurement payloads, in arrival order.
    ///
    /// Same borrowing rules as [`events`](Self::events); other events are
    /// consumed and discarded while this stream is polled.
    pub fn data(&self) -> Pin<Box<dyn Stream<Item = Value> + Send + '_>> {
        Box::pin(async_stream::stream! {
            let mut rx = self.event_rx.lock().await;
            while let Some(event) = rx.recv().await {
                if let FeedEvent::Data(payload) = event {
                    yield payload;
                }
            }
        })
    }

    /// Next already-emitted event, without waiting.
    pub fn try_next_event(&self) -> Option<FeedEvent> {
        let mut rx = self.event_rx.try_lock().ok()?;
        rx.try_recv().ok()
    }

    /// Close the feed and wait for the background task to exit.
    pub async fn shutdown(mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        if let Some(handle) = self.task_handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

// ─── Background task state ───────────────────────────────────────────────────

struct Engine<P, C> {
    config: FeedConfig,
    provider: P,
    connector: C,
    event_tx: mpsc::Sender<FeedEvent>,
    status_tx: watch::Sender<FeedStatus>,
    state: ConnectionState,
    /// User intent to stay connected.
    active: bool,
    /// Sticky: set on authentication denial, cleared by reauthenticate or a
    /// hard reset.
    unauthenticated: bool,
    /// Cached positive entitlement check.
    entitled: bool,
    calc: BackoffCalculator,
    backoff: BackoffState,
    guard: RateLimitGuard,
    supervisor: HardResetSupervisor,
    timers: Watchdogs,
    transport: Option<Transport>,
    operation_id: u64,
    heartbeat_reconnect_pending: bool,
    hard_resets: u64,
}

impl<P: SessionProvider, C: Connector> Engine<P, C> {
    fn emit(&self, event: FeedEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            tracing::trace!("Event channel full, dropping {:?}", event);
        }
    }

    fn log(&self, message: String) {
        tracing::info!("{}", message);
        self.emit(FeedEvent::Log(message));
    }

    fn warn(&self, message: String) {
        tracing::warn!("{}", message);
        self.emit(FeedEvent::Warn(message));
    }

    fn error(&self, message: String) {
        tracing::error!("{}", message);
        self.emit(FeedEvent::Error(message));
    }

    fn publish(&self) {
        self.status_tx.send_replace(FeedStatus {
            state: self.state,
            active: self.active,
            unauthenticated: self.unauthenticated,
            attempts: self.backoff.attempts,
            consecutive_failures: self.supervisor.consecutive_failures(),
            operation_id: self.operation_id,
            cooldown_until: self.guard.cooldown_until(),
            armed_timers: [
                Timer::ConnectTimeout,
                Timer::Heartbeat,
                Timer::Reconnect,
                Timer::Stable,
            ]
            .into_iter()
            .filter(|timer| self.timers.is_armed(*timer))
            .collect(),
            hard_resets: self.hard_resets,
        });
    }

    /// The delay worker: one pending attempt at most, a new schedule
    /// replaces the old one.
    fn schedule(&mut self, delay: Duration) {
        self.timers.arm(Timer::Reconnect, delay);
        if delay.is_zero() {
            tracing::debug!("Connection attempt scheduled");
        } else {
            self.log(format!("Reconnecting in {:.1}s", delay.as_secs_f64()));
        }
    }

    async fn send(&mut self, msg: &MessageOut) -> Result<(), String> {
        let transport = self.transport.as_mut().ok_or("No transport")?;
        let json = msg.encode().map_err(|e| e.to_string())?;
        transport
            .sink
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| e.to_string())
    }

    /// Force-drop the transport and the per-connection watchdogs.
    fn teardown(&mut self) {
        if self.transport.take().is_some() {
            tracing::debug!("Transport dropped");
        }
        self.timers.cancel(Timer::ConnectTimeout);
        self.timers.cancel(Timer::Heartbeat);
        self.timers.cancel(Timer::Stable);
        self.state = ConnectionState::Idle;
    }

    // ─── Main loop ───────────────────────────────────────────────────────────

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        if self.active {
            self.schedule(Duration::ZERO);
        }
        self.publish();

        loop {
            let deadline = self.timers.next_deadline();

            let running = tokio::select! {
                // ── a) Command from public API ───────────────────────────
                cmd = cmd_rx.recv() => self.handle_command(cmd).await,

                // ── b) Incoming WS message ───────────────────────────────
                msg = next_message(&mut self.transport) => {
                    self.handle_message(msg).await;
                    true
                }

                // ── c) Earliest watchdog deadline ────────────────────────
                () = sleep_until_opt(deadline) => {
                    self.fire_expired(&mut cmd_rx).await
                }
            };

            self.publish();
            if !running {
                tracing::debug!("Feed engine stopped");
                return;
            }
        }
    }

    async fn handle_command(&mut self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Connect) | Some(Command::SetActive(true)) => {
                self.request_connect();
                true
            }
            Some(Command::Close) | Some(Command::SetActive(false)) => {
                self.close().await;
                true
            }
            Some(Command::Reauthenticate) => {
                self.reauthenticate();
                true
            }
            Some(Command::Shutdown) | None => {
                // FeedClient shut down or dropped
                self.close().await;
                false
            }
        }
    }

    fn request_connect(&mut self) {
        self.active = true;

        if self.unauthenticated {
            self.warn(
                "Credential was rejected; call reauthenticate() after replacing it".to_string(),
            );
            return;
        }
        if self.state.is_busy() || self.timers.is_armed(Timer::Reconnect) {
            tracing::debug!("Connect ignored: attempt already pending ({:?})", self.state);
            return;
        }
        self.schedule(Duration::ZERO);
    }

    fn reauthenticate(&mut self) {
        self.unauthenticated = false;
        self.entitled = false;
        self.log("Authentication state cleared".to_string());

        if self.active && !self.state.is_busy() && !self.timers.is_armed(Timer::Reconnect) {
            self.schedule(Duration::ZERO);
        }
    }

    // ─── Timers ──────────────────────────────────────────────────────────────

    async fn fire_expired(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> bool {
        for timer in self.timers.take_expired(Instant::now()) {
            tracing::trace!("{} timer fired", timer);
            match timer {
                Timer::Reconnect => {
                    if !self.attempt(cmd_rx).await {
                        return false;
                    }
                }
                Timer::ConnectTimeout => {
                    if self.state == ConnectionState::Authenticating {
                        self.emit(FeedEvent::ConnectionTimeout);
                        self.fail(Failure::Transient(format!(
                            "No connection_ack within {:?}",
                            self.config.connect_timeout
                        )))
                        .await;
                    }
                }
                Timer::Heartbeat => {
                    if self.state == ConnectionState::Subscribed {
                        self.emit(FeedEvent::HeartbeatTimeout);
                        self.heartbeat_reconnect_pending = true;
                        self.fail(Failure::Transient(format!(
                            "No data received for {:?}",
                            self.config.idle_timeout
                        )))
                        .await;
                    }
                }
                Timer::Stable => {
                    if self.state == ConnectionState::Subscribed {
                        tracing::debug!("Connection stable, resetting backoff");
                        self.backoff.reset();
                    }
                }
            }
        }
        true
    }

    // ─── Connection attempt ──────────────────────────────────────────────────

    async fn attempt(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> bool {
        if !self.active || self.unauthenticated || self.state.is_busy() {
            return true;
        }

        if !self.guard.can_attempt() {
            let remaining = self.guard.remaining_cooldown();
            self.log(format!(
                "Rate limit cooldown active, next attempt in {:.0}s",
                remaining.as_secs_f64()
            ));
            self.timers.arm(Timer::Reconnect, remaining);
            return true;
        }

        if std::mem::take(&mut self.heartbeat_reconnect_pending) {
            self.emit(FeedEvent::HeartbeatReconnect);
        }

        self.state = ConnectionState::Connecting;
        self.backoff.last_attempt_at = Some(Instant::now());
        let deadline = self
            .timers
            .arm(Timer::ConnectTimeout, self.config.connect_timeout);
        tracing::info!("Connecting to live feed (attempt {})", self.backoff.attempts + 1);
        self.emit(FeedEvent::Connecting);
        self.publish();

        // The provider and transport open may take a while; keep listening
        // for close/shutdown so an in-flight attempt can be abandoned.
        let mut reauth_requested = false;
        let outcome = {
            let opening = open_session(
                &self.provider,
                &self.connector,
                &self.config.home_id,
                self.entitled,
            );
            tokio::pin!(opening);

            loop {
                tokio::select! {
                    result = &mut opening => break Interrupt::Finished(result),
                    () = tokio::time::sleep_until(deadline) => break Interrupt::TimedOut,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Connect) | Some(Command::SetActive(true)) => {
                            tracing::debug!("Connect ignored: attempt in flight");
                        }
                        Some(Command::Reauthenticate) => reauth_requested = true,
                        other => break Interrupt::Command(other),
                    },
                }
            }
        };

        let mut running = true;
        match outcome {
            Interrupt::Finished(Ok(opened)) => self.on_transport_open(opened).await,
            Interrupt::Finished(Err(AttemptError::Denied(reason))) => {
                self.halt_unauthenticated(reason)
            }
            Interrupt::Finished(Err(AttemptError::Failed(failure))) => self.fail(failure).await,
            Interrupt::TimedOut => {
                self.timers.cancel(Timer::ConnectTimeout);
                self.emit(FeedEvent::ConnectionTimeout);
                self.fail(Failure::Transient(format!(
                    "Connection attempt exceeded {:?}",
                    self.config.connect_timeout
                )))
                .await;
            }
            Interrupt::Command(cmd) => {
                tracing::debug!("Connection attempt abandoned");
                self.timers.cancel(Timer::ConnectTimeout);
                self.state = ConnectionState::Idle;
                running = self.handle_command(cmd).await;
            }
        }

        if reauth_requested && running {
            self.reauthenticate();
        }
        running
    }

    async fn on_transport_open(&mut self, opened: Opened) {
        self.entitled = true;
        self.transport = Some(opened.transport);

        if let Err(e) = self.send(&MessageOut::init(&opened.token)).await {
            self.fail(Failure::Transient(format!("Failed to send connection_init: {}", e)))
                .await;
            return;
        }

        self.state = ConnectionState::Authenticating;
        tracing::info!("Connected to {}, awaiting connection_ack", opened.url);
        self.emit(FeedEvent::Connected);
    }

    fn halt_unauthenticated(&mut self, reason: String) {
        self.unauthenticated = true;
        self.timers.cancel_all();
        self.transport = None;
        self.state = ConnectionState::Idle;
        self.heartbeat_reconnect_pending = false;
        self.error(format!("Authentication denied, not retrying: {}", reason));
    }

    // ─── Incoming messages ───────────────────────────────────────────────────

    async fn handle_message(&mut self, msg: Option<Result<Message, WsError>>) {
        match msg {
            Some(Ok(Message::Text(text))) => {
                let text_str: &str = text.as_ref();
                self.handle_text(text_str).await;
            }
            Some(Ok(Message::Ping(data))) => {
                if let Some(transport) = self.transport.as_mut() {
                    if let Err(e) = transport.sink.send(Message::Pong(data)).await {
                        tracing::warn!("Failed to answer ping: {}", e);
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = extract_close(frame.as_ref());
                self.emit(FeedEvent::Disconnected {
                    code: Some(code),
                    reason: reason.clone(),
                });
                let failure = if AUTH_CLOSE_CODES.contains(&code) {
                    Failure::AuthenticationDenied(format!("Closed with {}: {}", code, reason))
                } else if RATE_LIMIT_CLOSE_CODES.contains(&code) {
                    Failure::RateLimited {
                        retry_after: None,
                        reason: format!("Closed with {}: {}", code, reason),
                    }
                } else {
                    Failure::Transient(format!("Connection closed ({}): {}", code, reason))
                };
                self.fail(failure).await;
            }
            Some(Ok(_)) => {} // Pong, Binary, Frame
            Some(Err(e)) => {
                let reason = e.to_string();
                self.emit(FeedEvent::Disconnected {
                    code: None,
                    reason: reason.clone(),
                });
                self.fail(Failure::Transient(format!("WebSocket error: {}", reason)))
                    .await;
            }
            None => {
                self.emit(FeedEvent::Disconnected {
                    code: None,
                    reason: "Stream ended".into(),
                });
                self.fail(Failure::Transient("Stream ended".into())).await;
            }
        }
    }

    async fn handle_text(&mut self, text: &str) {
        let frame = match codec::decode(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                self.warn(format!("Malformed frame ignored: {}", e));
                return;
            }
        };

        match frame {
            Frame::InitAck => self.on_ack().await,
            Frame::InitError(payload) => {
                let reason = format!("connection_error: {}", payload);
                let failure = if mentions_auth_failure(&payload) {
                    Failure::AuthenticationDenied(reason)
                } else if mentions_rate_limit(&payload) {
                    Failure::RateLimited {
                        retry_after: None,
                        reason,
                    }
                } else {
                    Failure::Protocol(reason)
                };
                self.fail(failure).await;
            }
            Frame::Next { id, data, errors } => self.on_next(&id, data, errors),
            Frame::Error { id, payload } => {
                if id.as_deref().is_some_and(|id| !self.is_current(id)) {
                    tracing::debug!("Ignoring error for stale operation {:?}", id);
                    return;
                }
                self.fail(Failure::Protocol(format!("Subscription error: {}", payload)))
                    .await;
            }
            Frame::Complete { id } => {
                if self.state == ConnectionState::Subscribed && self.is_current(&id) {
                    self.on_server_complete();
                } else {
                    tracing::debug!("Ignoring complete for stale operation {}", id);
                }
            }
            Frame::Ping => {
                if let Err(e) = self.send(&MessageOut::Pong).await {
                    tracing::warn!("Failed to send pong: {}", e);
                }
            }
            Frame::KeepAlive => {}
            Frame::Unrecognized(kind) => {
                self.warn(format!("Unrecognized frame type: {}", kind));
            }
        }
    }

    fn is_current(&self, id: &str) -> bool {
        self.operation_id > 0 && id == self.operation_id.to_string()
    }

    async fn on_ack(&mut self) {
        if self.state != ConnectionState::Authenticating {
            tracing::debug!("Unexpected connection_ack in state {:?}", self.state);
            return;
        }

        self.timers.cancel(Timer::ConnectTimeout);
        self.supervisor.record_success();
        self.operation_id += 1;

        let subscribe = MessageOut::subscribe(self.operation_id, &self.config.subscription);
        if let Err(e) = self.send(&subscribe).await {
            self.fail(Failure::Transient(format!("Failed to subscribe: {}", e)))
                .await;
            return;
        }

        self.state = ConnectionState::Subscribed;
        self.timers.arm(Timer::Heartbeat, self.config.idle_timeout);
        if self.backoff.attempts > 0 {
            self.timers.arm(Timer::Stable, self.config.stable_after);
        }
        tracing::info!("Subscribed to live feed (operation {})", self.operation_id);
        self.emit(FeedEvent::ConnectionAck);
    }

    fn on_next(&mut self, id: &str, data: Option<Value>, errors: Option<Value>) {
        if self.state != ConnectionState::Subscribed || !self.is_current(id) {
            tracing::debug!(
                "Discarding frame for stale operation {} (current {})",
                id,
                self.operation_id
            );
            return;
        }

        self.timers.arm(Timer::Heartbeat, self.config.idle_timeout);
        self.backoff.recover();

        if let Some(errors) = errors {
            self.warn(format!("Subscription returned errors: {}", errors));
        }
        if let Some(data) = data {
            self.emit(FeedEvent::Data(data));
        }
    }

    fn on_server_complete(&mut self) {
        self.teardown();
        self.emit(FeedEvent::Disconnected {
            code: None,
            reason: "Subscription completed by server".into(),
        });

        if self.active {
            let (low, high) = COMPLETE_RECONNECT_MS;
            let delay = Duration::from_millis(rand::thread_rng().gen_range(low..=high));
            self.schedule(delay);
        }
    }

    // ─── Failure path ────────────────────────────────────────────────────────

    async fn fail(&mut self, failure: Failure) {
        let failure = match failure {
            Failure::AuthenticationDenied(reason) => {
                self.halt_unauthenticated(reason);
                return;
            }
            other => other,
        };

        match &failure {
            Failure::Protocol(reason) => self.error(reason.clone()),
            other => self.warn(other.reason().to_string()),
        }

        let failures = self.supervisor.record_failure();
        tracing::debug!("Consecutive failures: {}", failures);
        self.teardown();

        let retry_after = match failure {
            Failure::RateLimited { retry_after, .. } => {
                let until = self.guard.note_rate_limited(retry_after);
                self.emit(FeedEvent::RateLimited {
                    until: wall_clock(until),
                });
                Some(self.guard.remaining_cooldown())
            }
            Failure::Transient(_) | Failure::Protocol(_) | Failure::AuthenticationDenied(_) => {
                None
            }
        };

        if !self.active {
            return;
        }

        if self.supervisor.should_hard_reset() {
            self.hard_reset();
            return;
        }

        match retry_after {
            Some(cooldown) => self.schedule(cooldown),
            None => {
                let delay = self.calc.next_delay(self.backoff.attempts);
                self.backoff.record_failure();
                self.schedule(delay);
            }
        }
    }

    fn hard_reset(&mut self) {
        let failures = self.supervisor.consecutive_failures();
        self.timers.cancel_all();
        self.transport = None;
        self.state = ConnectionState::Idle;
        self.unauthenticated = false;
        self.entitled = false;
        self.backoff.reset();
        self.supervisor.reset();
        self.hard_resets += 1;
        self.warn(format!("Hard reset after {} consecutive failures", failures));

        if self.active {
            self.schedule(self.config.hard_reset_delay);
        }
    }

    // ─── Close ───────────────────────────────────────────────────────────────

    async fn close(&mut self) {
        self.active = false;
        self.heartbeat_reconnect_pending = false;

        if self.state == ConnectionState::Closed {
            self.timers.cancel_all();
            return;
        }

        let connected = self.transport.is_some();

        if self.state == ConnectionState::Subscribed {
            self.state = ConnectionState::Closing;
            self.emit(FeedEvent::Disconnecting);
            self.publish();

            let stop = MessageOut::stop(self.operation_id);
            let graceful = tokio::time::timeout(CLOSE_GRACE, async {
                self.send(&stop).await?;
                self.send(&MessageOut::ConnectionTerminate).await
            })
            .await;
            if !matches!(graceful, Ok(Ok(()))) {
                tracing::debug!("Graceful unsubscribe did not complete");
            }
        }

        if let Some(mut transport) = self.transport.take() {
            let _ = tokio::time::timeout(CLOSE_GRACE, transport.sink.close()).await;
        }

        self.timers.cancel_all();
        self.state = ConnectionState::Closed;
        tracing::info!("Live feed closed");
        if connected {
            self.emit(FeedEvent::Disconnected {
                code: None,
                reason: "Closed by client".into(),
            });
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Entitlement check, endpoint lookup and transport open.
async fn open_session<P: SessionProvider, C: Connector>(
    provider: &P,
    connector: &C,
    home_id: &str,
    entitled: bool,
) -> Result<Opened, AttemptError> {
    if !entitled && !provider.is_streaming_enabled(home_id).await? {
        return Err(AttemptError::Failed(Failure::Transient(format!(
            "Real-time consumption is not enabled for home {}",
            home_id
        ))));
    }

    let endpoint = provider.resolve_stream_endpoint().await?;
    let transport = connector.open(&endpoint.url).await?;

    Ok(Opened {
        transport,
        url: endpoint.url,
        token: endpoint.token,
    })
}

async fn next_message(transport: &mut Option<Transport>) -> Option<Result<Message, WsError>> {
    match transport {
        Some(transport) => transport.stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Extract close code and reason from an optional CloseFrame.
fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (1006, "No close frame".into()),
    }
}

fn mentions_rate_limit(payload: &Value) -> bool {
    let text = payload.to_string().to_ascii_lowercase();
    text.contains("too many requests") || text.contains("429")
}

fn mentions_auth_failure(payload: &Value) -> bool {
    let text = payload.to_string().to_ascii_lowercase();
    ["unauthorized", "unauthenticated", "forbidden", "invalid token", "401", "403"]
        .iter()
        .any(|needle| text.contains(needle))
}

fn wall_clock(deadline: Instant) -> chrono::DateTime<chrono::Utc> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let remaining =
        chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
    chrono::Utc::now() + remaining
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_extract_close() {
        let frame = CloseFrame {
            code: CloseCode::Library(4429),
            reason: "slow down".into(),
        };
        assert_eq!(extract_close(Some(&frame)), (4429, "slow down".to_string()));
        assert_eq!(extract_close(None), (1006, "No close frame".to_string()));
    }

    #[test]
    fn test_rate_limit_detection_in_payload() {
        assert!(mentions_rate_limit(&json!({"message": "Too Many Requests"})));
        assert!(mentions_rate_limit(&json!([{"extensions": {"code": 429}}])));
        assert!(!mentions_rate_limit(&json!({"message": "invalid token"})));
    }

    #[test]
    fn test_auth_failure_detection_in_payload() {
        assert!(mentions_auth_failure(&json!({"message": "Unauthorized: invalid token"})));
        assert!(mentions_auth_failure(&json!([{"extensions": {"code": "FORBIDDEN"}}])));
        assert!(!mentions_auth_failure(&json!({"message": "Too Many Requests"})));
    }

    #[test]
    fn test_session_errors_classified() {
        assert!(matches!(
            AttemptError::from(SessionError::AuthenticationDenied("no".into())),
            AttemptError::Denied(_)
        ));
        assert!(matches!(
            AttemptError::from(SessionError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }),
            AttemptError::Failed(Failure::RateLimited {
                retry_after: Some(_),
                ..
            })
        ));
        assert!(matches!(
            AttemptError::from(FeedError::ConnectionFailed("refused".into())),
            AttemptError::Failed(Failure::Transient(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_of_past_deadline_is_now() {
        let before = chrono::Utc::now();
        let past = Instant::now();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(wall_clock(past) >= before);
    }
}
