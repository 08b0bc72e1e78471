//! WebSocket listener and per-connection wiring.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

use crate::coordinator::ConversationCoordinator;
use crate::dedup::DedupHandle;
use crate::error::GatewayError;
use crate::registry::RegistryHandle;
use crate::websocket::Connection;
use crate::{AppState, GatewayStats};

/// Session and user identity carried on the upgrade request query string.
#[derive(Debug, Default, Clone)]
struct HandshakeParams {
    session_id: Option<String>,
    user_id: Option<String>,
}

impl HandshakeParams {
    fn from_request_uri(uri: &str) -> Self {
        // The upgrade request carries a path-relative URI; anchor it so the
        // url crate will parse the query string.
        let Ok(url) = Url::parse(&format!("ws://localhost{}", uri)) else {
            return Self::default();
        };
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "session_id" => params.session_id = Some(value.into_owned()),
                "user_id" => params.user_id = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }

    /// A missing or empty session id gets a server-generated one; the
    /// client learns the effective id from the `connection_ack` frame.
    fn effective_session_id(&self) -> String {
        match self.session_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        }
    }
}

pub struct WebSocketServer {
    registry: RegistryHandle,
    dedup: DedupHandle,
    coordinator: Arc<dyn ConversationCoordinator>,
    coordinator_timeout: std::time::Duration,
    stats: Arc<GatewayStats>,
    shutdown: CancellationToken,
}

impl WebSocketServer {
    pub fn new(state: &AppState, shutdown: CancellationToken) -> Self {
        Self {
            registry: state.registry.clone(),
            dedup: state.dedup.clone(),
            coordinator: state.coordinator.clone(),
            coordinator_timeout: state.settings.coordinator.timeout(),
            stats: state.stats.clone(),
            shutdown,
        }
    }

    /// Accept loop. Returns when the shutdown token fires or the listener
    /// fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), GatewayError> {
        info!(addr = %listener.local_addr()?, "WebSocket listener started");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                _ = self.shutdown.cancelled() => {
                    info!("WebSocket listener shutting down");
                    return Ok(());
                }
            }
        }
    }

    pub async fn handle_connection(self: Arc<Self>, raw_stream: TcpStream, addr: SocketAddr) {
        info!("New WebSocket connection from: {}", addr);

        let mut params = HandshakeParams::default();
        let ws_stream = match tokio_tungstenite::accept_hdr_async(
            raw_stream,
            |request: &Request, response: Response| {
                params = HandshakeParams::from_request_uri(&request.uri().to_string());
                Ok(response)
            },
        )
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                error!("Error during WebSocket handshake: {}", e);
                return;
            }
        };

        let session_id = params.effective_session_id();
        let (mut ws_sink, mut ws_stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut connection = Connection::new(
            session_id,
            params.user_id,
            tx,
            self.registry.clone(),
            self.dedup.clone(),
            self.coordinator.clone(),
            self.coordinator_timeout,
            self.shutdown.child_token(),
            self.stats.clone(),
        );
        let connection_id = connection.id();
        let cancel = connection.cancel_token();

        if let Err(e) = connection.open().await {
            error!(connection_id = %connection_id, "Failed to open connection: {}", e);
            return;
        }

        // Forward queued frames to the socket. Ends when the connection's
        // send channel closes.
        let send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_sink.send(message).await {
                    debug!("Error sending WebSocket message: {}", e);
                    break;
                }
            }
            if let Err(e) = ws_sink.close().await {
                debug!("Error closing WebSocket connection: {}", e);
            }
        });

        // Inbound loop runs on this task so the connection handler keeps
        // single ownership of its state.
        loop {
            tokio::select! {
                message = ws_stream.next() => {
                    match message {
                        Some(Ok(msg)) => {
                            if let Err(e) = connection.handle_message(msg).await {
                                debug!(connection_id = %connection_id, "Connection ending: {}", e);
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(connection_id = %connection_id, "Error receiving WebSocket message: {}", e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    debug!(connection_id = %connection_id, "Connection cancelled");
                    break;
                }
            }
        }

        connection.close().await;
        drop(connection);
        let _ = send_task.await;
        info!("Connection {} closed", connection_id);
    }
}
