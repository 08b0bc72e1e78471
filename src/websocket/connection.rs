//! Per-socket connection handler.
//!
//! One `Connection` wraps one physical transport instance and drives the
//! state machine `Connecting → Open → Closing → Closed` (monotonic, no
//! back-edges). Inbound frames flow parse → dedup → coordinator; outbound
//! frames go through the connection's send channel so the registry and
//! unsolicited producers can reach the same socket.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{call_with_timeout, ConversationCoordinator};
use crate::dedup::{content_fingerprint, DedupHandle, DedupOutcome};
use crate::error::{ErrorCode, GatewayError};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::registry::{ConnectionHandle, RegistryHandle};
use crate::GatewayStats;

/// Close-frame reason sent to a connection superseded by a newer one.
pub const SESSION_CONFLICT_REASON: &str = "session_conflict";

/// Words per streaming chunk when relaying a coordinator reply.
const STREAM_CHUNK_WORDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

pub struct Connection {
    id: Uuid,
    session_id: String,
    user_id: Option<String>,
    state: ConnectionState,
    tx: mpsc::UnboundedSender<Message>,
    registry: RegistryHandle,
    dedup: DedupHandle,
    coordinator: Arc<dyn ConversationCoordinator>,
    coordinator_timeout: Duration,
    cancel: CancellationToken,
    stats: Arc<GatewayStats>,
    last_ping_at: Option<Instant>,
    last_pong_at: Option<Instant>,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        user_id: Option<String>,
        tx: mpsc::UnboundedSender<Message>,
        registry: RegistryHandle,
        dedup: DedupHandle,
        coordinator: Arc<dyn ConversationCoordinator>,
        coordinator_timeout: Duration,
        cancel: CancellationToken,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            user_id,
            state: ConnectionState::Connecting,
            tx,
            registry,
            dedup,
            coordinator,
            coordinator_timeout,
            cancel,
            stats,
            last_ping_at: None,
            last_pong_at: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Most recent transport-level heartbeat activity seen from the peer.
    pub fn last_heartbeat(&self) -> Option<Instant> {
        match (self.last_ping_at, self.last_pong_at) {
            (Some(ping), Some(pong)) => Some(ping.max(pong)),
            (ping, pong) => ping.or(pong),
        }
    }

    /// State transitions are forward-only; a late transition request for an
    /// earlier state is ignored.
    fn advance(&mut self, next: ConnectionState) {
        if next > self.state {
            self.state = next;
        }
    }

    /// Register in the session registry and acknowledge the connection.
    /// A prior connection for the same session is told why it is being
    /// closed, then force-closed: last writer wins.
    pub async fn open(&mut self) -> Result<(), GatewayError> {
        let handle = ConnectionHandle::new(self.id, self.tx.clone(), self.cancel.clone());
        let prior = self
            .registry
            .bind(&self.session_id, self.user_id.as_deref(), handle)
            .await?;

        if let Some(prior) = prior {
            info!(
                session_id = %self.session_id,
                connection_id = %self.id,
                prior_connection = %prior.connection_id,
                "closing superseded connection"
            );
            prior.send_frame(&ServerFrame::error(
                &self.session_id,
                ErrorCode::SessionConflict,
                "Session was opened from another connection",
            ));
            prior.send_raw(Message::Close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: SESSION_CONFLICT_REASON.into(),
            })));
            prior.force_close();
        }

        self.send_frame(&ServerFrame::connection_ack(&self.session_id))?;
        self.advance(ConnectionState::Open);
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Handle one inbound transport message while open.
    ///
    /// `Ok(())` keeps the connection open; `Err` ends the read loop and
    /// sends the connection down its closure path. Malformed input is never
    /// fatal: it is answered with an `error` frame on the same socket.
    pub async fn handle_message(&mut self, msg: Message) -> Result<(), GatewayError> {
        match msg {
            Message::Text(text) => match ClientFrame::parse(&text) {
                Ok(ClientFrame::UserMessage {
                    message_id,
                    content,
                    user_id,
                    ..
                }) => self.handle_user_message(message_id, content, user_id).await,
                Ok(ClientFrame::Ping { .. }) => {
                    // No business logic on this path.
                    self.send_frame(&ServerFrame::pong(&self.session_id))
                }
                Err(e) => {
                    warn!(
                        connection_id = %self.id,
                        session_id = %self.session_id,
                        error = %e,
                        "rejecting malformed frame"
                    );
                    self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    self.send_frame(&ServerFrame::error(
                        &self.session_id,
                        ErrorCode::MalformedMessage,
                        e.to_string(),
                    ))
                }
            },
            Message::Binary(_) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                self.send_frame(&ServerFrame::error(
                    &self.session_id,
                    ErrorCode::MalformedMessage,
                    "Binary frames are not supported",
                ))
            }
            Message::Ping(data) => {
                self.last_ping_at = Some(Instant::now());
                self.tx
                    .send(Message::Pong(data))
                    .map_err(|e| GatewayError::Transport(e.to_string()))
            }
            Message::Pong(_) => {
                self.last_pong_at = Some(Instant::now());
                Ok(())
            }
            Message::Close(reason) => {
                debug!(connection_id = %self.id, ?reason, "client initiated close");
                Err(GatewayError::Transport(
                    "connection closed by client".to_string(),
                ))
            }
            Message::Frame(_) => Ok(()),
        }
    }

    async fn handle_user_message(
        &mut self,
        message_id: String,
        content: String,
        frame_user_id: Option<String>,
    ) -> Result<(), GatewayError> {
        self.stats.messages_total.fetch_add(1, Ordering::Relaxed);
        let user_id = self.user_id.clone().or(frame_user_id);
        let fingerprint = content_fingerprint(&self.session_id, user_id.as_deref(), &content);

        let outcome = self
            .dedup
            .check_and_record(&self.session_id, &message_id, &fingerprint)
            .await?;

        match outcome {
            DedupOutcome::Accept => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                self.registry.touch(&self.session_id).await?;
                self.answer(&message_id, user_id.as_deref(), &content).await
            }
            DedupOutcome::DuplicateId => {
                // Idempotent transport replay: acknowledge by silence.
                debug!(
                    session_id = %self.session_id,
                    message_id = %message_id,
                    "dropping replayed message id"
                );
                self.stats.duplicate_ids.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            DedupOutcome::DuplicateContent => {
                debug!(
                    session_id = %self.session_id,
                    message_id = %message_id,
                    "same content racing in through a second delivery"
                );
                self.stats
                    .duplicate_contents
                    .fetch_add(1, Ordering::Relaxed);
                self.send_frame(&ServerFrame::still_processing(&self.session_id, &message_id))
            }
        }
    }

    /// Forward one accepted message to the coordinator and stream the reply
    /// back. A coordinator fault is chat-visible but never closes the
    /// socket; the message id doubles as the correlation reference.
    async fn answer(
        &mut self,
        message_id: &str,
        user_id: Option<&str>,
        content: &str,
    ) -> Result<(), GatewayError> {
        self.send_frame(&ServerFrame::typing(&self.session_id, true))?;
        let started = Instant::now();

        let result = tokio::select! {
            result = call_with_timeout(
                self.coordinator.as_ref(),
                self.coordinator_timeout,
                &self.session_id,
                user_id,
                content,
            ) => result,
            _ = self.cancel.cancelled() => {
                // The socket is going away; drop the result on the floor.
                return Err(GatewayError::Transport("connection cancelled".to_string()));
            }
        };

        match result {
            Ok(reply) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.stream_reply(message_id, &reply.content, elapsed_ms)?;
                self.send_frame(&ServerFrame::typing(&self.session_id, false))
            }
            Err(e) => {
                let err = GatewayError::Downstream(e);
                warn!(
                    session_id = %self.session_id,
                    message_id = %message_id,
                    error = %err,
                    "coordinator call failed"
                );
                self.stats
                    .downstream_errors
                    .fetch_add(1, Ordering::Relaxed);
                self.send_frame(&ServerFrame::error(
                    &self.session_id,
                    ErrorCode::DownstreamError,
                    format!("Failed to process your message, please retry (ref: {message_id})"),
                ))?;
                self.send_frame(&ServerFrame::typing(&self.session_id, false))
            }
        }
    }

    /// Relay a reply as word chunks followed by the complete response.
    fn stream_reply(
        &self,
        message_id: &str,
        content: &str,
        response_time_ms: u64,
    ) -> Result<(), GatewayError> {
        let words: Vec<&str> = content.split_whitespace().collect();
        let chunks: Vec<String> = words
            .chunks(STREAM_CHUNK_WORDS)
            .map(|c| c.join(" "))
            .collect();
        let last = chunks.len().saturating_sub(1);

        for (index, chunk) in chunks.iter().enumerate() {
            self.send_frame(&ServerFrame::StreamingResponse {
                message_id: message_id.to_string(),
                content: chunk.clone(),
                session_id: self.session_id.clone(),
                chunk_index: index as u32,
                is_final: index == last,
            })?;
        }

        self.send_frame(&ServerFrame::BotResponse {
            message_id: message_id.to_string(),
            content: content.to_string(),
            session_id: self.session_id.clone(),
            response_time_ms,
        })
    }

    fn send_frame(&self, frame: &ServerFrame) -> Result<(), GatewayError> {
        let json = serde_json::to_string(frame)
            .map_err(|e| GatewayError::Internal(format!("failed to serialize frame: {e}")))?;
        self.tx
            .send(Message::Text(json))
            .map_err(|e| GatewayError::Transport(format!("failed to enqueue frame: {e}")))
    }

    /// Tear down: unbind from the registry (a no-op when this connection
    /// was already superseded) and cancel any in-flight work. Runs exactly
    /// once; later calls are absorbed by the state machine.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.advance(ConnectionState::Closing);
        self.cancel.cancel();

        match self.registry.unbind(&self.session_id, self.id).await {
            Ok(removed) => {
                if removed {
                    debug!(
                        session_id = %self.session_id,
                        connection_id = %self.id,
                        "connection unbound"
                    );
                }
            }
            Err(e) => {
                // Registry already shut down; nothing left to unbind from.
                debug!(connection_id = %self.id, error = %e, "unbind skipped");
            }
        }
        self.advance(ConnectionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupConfig;
    use crate::coordinator::{CoordinatorReply, EchoCoordinator};
    use crate::error::CoordinatorError;
    use async_trait::async_trait;

    fn test_dedup(cancel: &CancellationToken) -> DedupHandle {
        DedupHandle::spawn(
            DedupConfig {
                message_id_window_secs: 600,
                content_window_secs: 2,
                sweep_interval_secs: 60,
            },
            cancel.clone(),
        )
    }

    struct Harness {
        connection: Connection,
        rx: mpsc::UnboundedReceiver<Message>,
        registry: RegistryHandle,
        _cancel: CancellationToken,
    }

    fn harness_with(coordinator: Arc<dyn ConversationCoordinator>) -> Harness {
        let cancel = CancellationToken::new();
        let registry = RegistryHandle::spawn(cancel.clone());
        let dedup = test_dedup(&cancel);
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            "s1".to_string(),
            Some("u1".to_string()),
            tx,
            registry.clone(),
            dedup,
            coordinator,
            Duration::from_millis(200),
            cancel.child_token(),
            Arc::new(GatewayStats::new()),
        );
        Harness {
            connection,
            rx,
            registry,
            _cancel: cancel,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(EchoCoordinator))
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        let msg = rx.try_recv().expect("expected an outbound frame");
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    fn user_message(message_id: &str, content: &str) -> Message {
        Message::Text(
            serde_json::json!({
                "type": "user_message",
                "message_id": message_id,
                "content": content,
                "session_id": "s1",
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn open_sends_connection_ack() {
        let mut h = harness();
        h.connection.open().await.unwrap();
        assert_eq!(h.connection.state(), ConnectionState::Open);

        let ack = recv_frame(&mut h.rx);
        assert_eq!(ack["type"], "connection_ack");
        assert_eq!(ack["session_id"], "s1");
    }

    #[tokio::test]
    async fn accepted_message_streams_then_answers() {
        let mut h = harness();
        h.connection.open().await.unwrap();
        let _ack = recv_frame(&mut h.rx);

        h.connection
            .handle_message(user_message("m1", "hello there"))
            .await
            .unwrap();

        let typing_on = recv_frame(&mut h.rx);
        assert_eq!(typing_on["type"], "typing");
        assert_eq!(typing_on["is_typing"], true);

        let mut saw_final_chunk = false;
        let mut full = None;
        loop {
            let frame = recv_frame(&mut h.rx);
            match frame["type"].as_str().unwrap() {
                "streaming_response" => {
                    if frame["is_final"] == true {
                        saw_final_chunk = true;
                    }
                }
                "bot_response" => {
                    full = Some(frame["content"].as_str().unwrap().to_string());
                }
                "typing" => {
                    assert_eq!(frame["is_typing"], false);
                    break;
                }
                other => panic!("unexpected frame type {other}"),
            }
        }
        assert!(saw_final_chunk);
        assert_eq!(full.as_deref(), Some("Echo: hello there"));
    }

    #[tokio::test]
    async fn replayed_id_is_dropped_silently() {
        let mut h = harness();
        h.connection.open().await.unwrap();

        h.connection
            .handle_message(user_message("m1", "hello"))
            .await
            .unwrap();
        while h.rx.try_recv().is_ok() {}

        h.connection
            .handle_message(user_message("m1", "hello"))
            .await
            .unwrap();
        assert!(h.rx.try_recv().is_err(), "replay must produce no frames");
    }

    #[tokio::test]
    async fn duplicate_content_gets_still_processing_notice() {
        let mut h = harness();
        h.connection.open().await.unwrap();

        h.connection
            .handle_message(user_message("m1", "hello"))
            .await
            .unwrap();
        while h.rx.try_recv().is_ok() {}

        // Fresh id, identical content, inside the short window.
        h.connection
            .handle_message(user_message("m2", "hello"))
            .await
            .unwrap();

        let frame = recv_frame(&mut h.rx);
        assert_eq!(frame["type"], "bot_response");
        assert_eq!(frame["response_time_ms"], 0);
        assert_eq!(
            frame["content"],
            crate::protocol::STILL_PROCESSING_NOTICE
        );
        assert!(h.rx.try_recv().is_err(), "exactly one notice, no answer");
    }

    #[tokio::test]
    async fn malformed_frame_is_answered_not_fatal() {
        let mut h = harness();
        h.connection.open().await.unwrap();
        let _ack = recv_frame(&mut h.rx);

        h.connection
            .handle_message(Message::Text("{\"type\":\"nonsense\"}".to_string()))
            .await
            .unwrap();

        let frame = recv_frame(&mut h.rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["error_code"], "MALFORMED_MESSAGE");
        assert_eq!(h.connection.state(), ConnectionState::Open);

        // The connection still processes the next message.
        h.connection
            .handle_message(user_message("m1", "hello"))
            .await
            .unwrap();
        let typing = recv_frame(&mut h.rx);
        assert_eq!(typing["type"], "typing");
    }

    #[tokio::test]
    async fn app_ping_is_answered_with_pong() {
        let mut h = harness();
        h.connection.open().await.unwrap();
        let _ack = recv_frame(&mut h.rx);

        h.connection
            .handle_message(Message::Text(
                serde_json::json!({"type": "ping", "session_id": "s1"}).to_string(),
            ))
            .await
            .unwrap();

        let frame = recv_frame(&mut h.rx);
        assert_eq!(frame["type"], "pong");
    }

    #[tokio::test]
    async fn transport_ping_is_answered_inline() {
        let mut h = harness();
        h.connection.open().await.unwrap();
        let _ack = recv_frame(&mut h.rx);

        assert!(h.connection.last_heartbeat().is_none());
        h.connection
            .handle_message(Message::Ping(vec![1, 2, 3]))
            .await
            .unwrap();
        let msg = h.rx.try_recv().unwrap();
        assert_eq!(msg, Message::Pong(vec![1, 2, 3]));
        assert!(h.connection.last_heartbeat().is_some());
    }

    struct FailingCoordinator;

    #[async_trait]
    impl ConversationCoordinator for FailingCoordinator {
        async fn handle<'a>(
            &self,
            _session_id: &str,
            _user_id: Option<&'a str>,
            _content: &str,
        ) -> Result<CoordinatorReply, CoordinatorError> {
            Err(CoordinatorError::Failed("engine exploded".to_string()))
        }
    }

    #[tokio::test]
    async fn downstream_failure_is_chat_visible_and_not_fatal() {
        let mut h = harness_with(Arc::new(FailingCoordinator));
        h.connection.open().await.unwrap();
        let _ack = recv_frame(&mut h.rx);

        h.connection
            .handle_message(user_message("m1", "hello"))
            .await
            .unwrap();

        let typing_on = recv_frame(&mut h.rx);
        assert_eq!(typing_on["type"], "typing");

        let error = recv_frame(&mut h.rx);
        assert_eq!(error["type"], "error");
        assert_eq!(error["error_code"], "DOWNSTREAM_ERROR");
        assert!(error["content"].as_str().unwrap().contains("m1"));

        let typing_off = recv_frame(&mut h.rx);
        assert_eq!(typing_off["is_typing"], false);
        assert_eq!(h.connection.state(), ConnectionState::Open);
    }

    struct SlowCoordinator;

    #[async_trait]
    impl ConversationCoordinator for SlowCoordinator {
        async fn handle<'a>(
            &self,
            _session_id: &str,
            _user_id: Option<&'a str>,
            _content: &str,
        ) -> Result<CoordinatorReply, CoordinatorError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(CoordinatorReply::from_content("too late"))
        }
    }

    #[tokio::test]
    async fn coordinator_timeout_surfaces_as_downstream_error() {
        let mut h = harness_with(Arc::new(SlowCoordinator));
        h.connection.open().await.unwrap();
        let _ack = recv_frame(&mut h.rx);

        h.connection
            .handle_message(user_message("m1", "hello"))
            .await
            .unwrap();

        let _typing_on = recv_frame(&mut h.rx);
        let error = recv_frame(&mut h.rx);
        assert_eq!(error["error_code"], "DOWNSTREAM_ERROR");
        assert_eq!(h.connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn second_open_evicts_first_connection() {
        let cancel = CancellationToken::new();
        let registry = RegistryHandle::spawn(cancel.clone());
        let dedup = test_dedup(&cancel);
        let stats = Arc::new(GatewayStats::new());

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let first_cancel = cancel.child_token();
        let mut first = Connection::new(
            "s1".to_string(),
            None,
            tx1,
            registry.clone(),
            dedup.clone(),
            Arc::new(EchoCoordinator),
            Duration::from_secs(1),
            first_cancel.clone(),
            stats.clone(),
        );
        first.open().await.unwrap();
        let _ack = rx1.try_recv().unwrap();

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let mut second = Connection::new(
            "s1".to_string(),
            None,
            tx2,
            registry.clone(),
            dedup,
            Arc::new(EchoCoordinator),
            Duration::from_secs(1),
            cancel.child_token(),
            stats,
        );
        second.open().await.unwrap();

        // First connection got the conflict notice, a close frame, and its
        // cancel token fired.
        let conflict: serde_json::Value =
            serde_json::from_str(rx1.try_recv().unwrap().to_text().unwrap()).unwrap();
        assert_eq!(conflict["error_code"], "SESSION_CONFLICT");
        assert!(matches!(rx1.try_recv().unwrap(), Message::Close(_)));
        assert!(first_cancel.is_cancelled());

        // Its closure path must not unbind the winner.
        first.close().await;
        assert!(registry.lookup("s1").await.unwrap().is_some());

        let ack: serde_json::Value =
            serde_json::from_str(rx2.try_recv().unwrap().to_text().unwrap()).unwrap();
        assert_eq!(ack["type"], "connection_ack");
    }

    #[tokio::test]
    async fn close_unbinds_exactly_once() {
        let mut h = harness();
        h.connection.open().await.unwrap();
        assert!(h.registry.lookup("s1").await.unwrap().is_some());

        h.connection.close().await;
        assert_eq!(h.connection.state(), ConnectionState::Closed);
        assert!(h.registry.lookup("s1").await.unwrap().is_none());

        // Second close is absorbed.
        h.connection.close().await;
        assert_eq!(h.connection.state(), ConnectionState::Closed);
    }

    #[test]
    fn state_machine_is_monotonic() {
        let order = [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ];
        for (i, a) in order.iter().enumerate() {
            for b in &order[i + 1..] {
                assert!(a < b);
            }
        }
    }
}
