//! Client-side connection controller.
//!
//! Owns the client's view of the gateway connection: dialing, heartbeat
//! supervision, and automatic reconnection with jittered exponential
//! backoff. Server frames are surfaced on an event channel; the caller
//! talks to the controller through a command channel and a watch on its
//! status.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{HeartbeatConfig, ReconnectConfig};
use crate::error::{ErrorCode, GatewayError};
use crate::protocol::{ClientFrame, ServerFrame};

/// Jitter applied to each backoff delay, as a fraction of the delay.
const JITTER_FACTOR: f64 = 0.3;

/// Externally observable controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retries exhausted. Leaves only via an explicit `Retry` command.
    Error,
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug)]
pub enum ClientCommand {
    /// Send a frame over the current connection. Dropped when offline.
    Send(ClientFrame),
    /// Stop for good. No reconnect attempt follows.
    Disconnect,
    /// Leave the `Error` state and start dialing again from attempt zero.
    Retry,
}

/// What the controller reports upward.
#[derive(Debug)]
pub enum ClientEvent {
    Frame(ServerFrame),
    StatusChanged(ClientStatus),
    /// A transport fault absorbed by the reconnect schedule. Reported for
    /// observability, never as chat content.
    Fault { code: ErrorCode, detail: String },
}

/// Exponential backoff with jitter. Delay grows `base * 2^attempt` up to
/// the cap; jitter spreads simultaneous reconnects apart.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base: config.base_delay(),
            cap: config.max_delay(),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .as_millis()
            .saturating_mul(1u128 << self.attempt.min(20)) as f64;
        let capped = exp.min(self.cap.as_millis() as f64);
        let jitter = capped * JITTER_FACTOR * (rand::thread_rng().gen::<f64>() * 2.0 - 1.0);
        let delayed = (capped + jitter).max(self.base.as_millis() as f64);
        self.attempt += 1;
        Duration::from_millis(delayed as u64)
    }

    /// A successful connection resets the schedule.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Why one connection attempt or session ended.
enum SessionEnd {
    /// The transport dropped or the heartbeat went unanswered; reconnect.
    Lost,
    /// The caller asked to stop; do not reconnect.
    Stopped,
}

/// Handle to a running controller task.
pub struct GatewayClient {
    commands: mpsc::Sender<ClientCommand>,
    status: watch::Receiver<ClientStatus>,
}

impl GatewayClient {
    /// Spawn the controller. It starts dialing immediately.
    pub fn spawn(
        url: String,
        reconnect: ReconnectConfig,
        heartbeat: HeartbeatConfig,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (status_tx, status_rx) = watch::channel(ClientStatus::Disconnected);

        let controller = Controller {
            url,
            reconnect,
            heartbeat,
            commands: command_rx,
            events: event_tx,
            status: status_tx,
        };
        tokio::spawn(controller.run());

        (
            Self {
                commands: command_tx,
                status: status_rx,
            },
            event_rx,
        )
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    /// Wait until the status matches `predicate`. Fails when the
    /// controller task has stopped.
    pub async fn wait_for(
        &mut self,
        predicate: impl Fn(ClientStatus) -> bool,
    ) -> Result<ClientStatus, GatewayError> {
        loop {
            let current = *self.status.borrow();
            if predicate(current) {
                return Ok(current);
            }
            self.status
                .changed()
                .await
                .map_err(|_| GatewayError::Internal("client controller stopped".to_string()))?;
        }
    }

    pub async fn send(&self, frame: ClientFrame) -> Result<(), GatewayError> {
        self.commands
            .send(ClientCommand::Send(frame))
            .await
            .map_err(|_| GatewayError::Internal("client controller stopped".to_string()))
    }

    pub async fn disconnect(&self) -> Result<(), GatewayError> {
        self.commands
            .send(ClientCommand::Disconnect)
            .await
            .map_err(|_| GatewayError::Internal("client controller stopped".to_string()))
    }

    pub async fn retry(&self) -> Result<(), GatewayError> {
        self.commands
            .send(ClientCommand::Retry)
            .await
            .map_err(|_| GatewayError::Internal("client controller stopped".to_string()))
    }
}

struct Controller {
    url: String,
    reconnect: ReconnectConfig,
    heartbeat: HeartbeatConfig,
    commands: mpsc::Receiver<ClientCommand>,
    events: mpsc::Sender<ClientEvent>,
    status: watch::Sender<ClientStatus>,
}

impl Controller {
    async fn set_status(&mut self, status: ClientStatus) {
        if *self.status.borrow() != status {
            let _ = self.status.send(status);
            let _ = self.events.send(ClientEvent::StatusChanged(status)).await;
        }
    }

    async fn report_fault(&mut self, detail: String) {
        let _ = self
            .events
            .send(ClientEvent::Fault {
                code: ErrorCode::TransportError,
                detail,
            })
            .await;
    }

    async fn run(mut self) {
        let mut backoff = Backoff::new(&self.reconnect);

        loop {
            // Every dial attempt passes through Connecting; Reconnecting
            // covers only the backoff wait between attempts.
            self.set_status(ClientStatus::Connecting).await;

            match connect_async(&self.url).await {
                Ok((stream, _)) => {
                    info!(url = %self.url, "client connected");
                    self.set_status(ClientStatus::Connected).await;
                    backoff.reset();

                    match self.run_session(stream).await {
                        SessionEnd::Stopped => {
                            self.set_status(ClientStatus::Disconnected).await;
                            return;
                        }
                        SessionEnd::Lost => {
                            warn!(url = %self.url, "connection lost");
                            self.report_fault("connection lost".to_string()).await;
                        }
                    }
                }
                Err(e) => {
                    debug!(url = %self.url, attempt = backoff.attempt(), "dial failed: {}", e);
                    self.report_fault(format!("dial failed: {}", e)).await;
                }
            }

            if backoff.attempt() >= self.reconnect.max_attempts {
                warn!(
                    url = %self.url,
                    attempts = backoff.attempt(),
                    "retries exhausted, giving up until asked"
                );
                self.set_status(ClientStatus::Error).await;
                if !self.wait_for_retry().await {
                    self.set_status(ClientStatus::Disconnected).await;
                    return;
                }
                backoff.reset();
                continue;
            }

            let delay = backoff.next_delay();
            self.set_status(ClientStatus::Reconnecting).await;
            debug!(delay_ms = delay.as_millis() as u64, "backing off before redial");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                stopped = self.drain_until_disconnect() => {
                    if stopped {
                        self.set_status(ClientStatus::Disconnected).await;
                        return;
                    }
                }
            }
        }
    }

    /// In the `Error` state only `Retry` resumes and only `Disconnect`
    /// (or a dropped handle) terminates. Returns true to resume.
    async fn wait_for_retry(&mut self) -> bool {
        while let Some(command) = self.commands.recv().await {
            match command {
                ClientCommand::Retry => return true,
                ClientCommand::Disconnect => return false,
                ClientCommand::Send(_) => {
                    debug!("dropping send while in error state");
                }
            }
        }
        false
    }

    /// Consume commands while waiting out a backoff delay. Resolves true
    /// when a `Disconnect` arrives or the handle is dropped.
    async fn drain_until_disconnect(&mut self) -> bool {
        loop {
            match self.commands.recv().await {
                Some(ClientCommand::Disconnect) | None => return true,
                Some(ClientCommand::Retry) => {}
                Some(ClientCommand::Send(_)) => {
                    debug!("dropping send while offline");
                }
            }
        }
    }

    /// Drive one live connection until it drops, the heartbeat goes
    /// unanswered, or the caller disconnects.
    async fn run_session(
        &mut self,
        stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> SessionEnd {
        let (mut sink, mut source) = stream.split();

        let mut heartbeat = interval(self.heartbeat.interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                message = source.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            last_activity = Instant::now();
                            match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(frame) => {
                                    if self.events.send(ClientEvent::Frame(frame)).await.is_err() {
                                        return SessionEnd::Stopped;
                                    }
                                }
                                Err(e) => {
                                    warn!("discarding unparseable server frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            last_activity = Instant::now();
                            if sink.send(Message::Pong(data)).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_activity = Instant::now();
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return SessionEnd::Lost;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("transport error: {}", e);
                            return SessionEnd::Lost;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if last_activity.elapsed() >= self.heartbeat.timeout() {
                        warn!("heartbeat unanswered, treating connection as dead");
                        return SessionEnd::Lost;
                    }
                    // Application-level ping; the answering pong frame
                    // counts as activity like any other text frame.
                    let ping = ClientFrame::Ping {
                        session_id: None,
                        message_id: None,
                    };
                    match serde_json::to_string(&ping) {
                        Ok(json) => {
                            if sink.send(Message::Text(json)).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                        Err(e) => warn!("failed to serialize ping: {}", e),
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(ClientCommand::Send(frame)) => {
                            match serde_json::to_string(&frame) {
                                Ok(json) => {
                                    if sink.send(Message::Text(json)).await.is_err() {
                                        return SessionEnd::Lost;
                                    }
                                }
                                Err(e) => warn!("failed to serialize frame: {}", e),
                            }
                        }
                        Some(ClientCommand::Disconnect) | None => {
                            let _ = sink.send(Message::Close(None)).await;
                            return SessionEnd::Stopped;
                        }
                        Some(ClientCommand::Retry) => {}
                    }
                }
            }
        }
    }
}
