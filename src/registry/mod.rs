//! Session registry: maps a session id to the single live connection.
//!
//! Owned by one actor task and reached over a command channel, the same
//! shape as the dedup store. Binding is last-writer-wins: the prior handle
//! is returned atomically so the caller can force-close the superseded
//! socket. Stale entries are only ever removed by `unbind` firing from a
//! connection's close path; there is no separate sweep.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::protocol::ServerFrame;

/// Outbound half of one live connection. The registry references this; the
/// connection task owns the socket itself.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub connection_id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        connection_id: Uuid,
        tx: mpsc::UnboundedSender<Message>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection_id,
            tx,
            cancel,
        }
    }

    /// Ask the owning connection task to shut down. Used when this
    /// connection has been superseded by a newer one for the same session.
    pub fn force_close(&self) {
        self.cancel.cancel();
    }

    /// Serialize and enqueue a frame. Returns `false` when the connection's
    /// send channel is gone (socket already closing).
    pub fn send_frame(&self, frame: &ServerFrame) -> bool {
        match serde_json::to_string(frame) {
            Ok(json) => self.tx.send(Message::Text(json)).is_ok(),
            Err(_) => false,
        }
    }

    pub fn send_raw(&self, msg: Message) -> bool {
        self.tx.send(msg).is_ok()
    }
}

/// Per-session metadata, kept alongside the live binding.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub message_count: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub total_binds: u64,
    pub total_evictions: u64,
    pub total_messages: u64,
}

struct Entry {
    handle: ConnectionHandle,
    info: SessionInfo,
}

enum Command {
    Bind {
        session_id: String,
        user_id: Option<String>,
        handle: ConnectionHandle,
        reply: oneshot::Sender<Option<ConnectionHandle>>,
    },
    Unbind {
        session_id: String,
        connection_id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    Lookup {
        session_id: String,
        reply: oneshot::Sender<Option<ConnectionHandle>>,
    },
    Touch {
        session_id: String,
    },
    Push {
        session_id: String,
        frame: ServerFrame,
        reply: oneshot::Sender<bool>,
    },
    GetSession {
        session_id: String,
        reply: oneshot::Sender<Option<SessionInfo>>,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
}

struct Registry {
    entries: std::collections::HashMap<String, Entry>,
    stats: RegistryStats,
}

impl Registry {
    fn new() -> Self {
        Self {
            entries: std::collections::HashMap::new(),
            stats: RegistryStats::default(),
        }
    }

    fn bind(
        &mut self,
        session_id: String,
        user_id: Option<String>,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let now = Utc::now();
        self.stats.total_binds += 1;

        match self.entries.get_mut(&session_id) {
            Some(entry) => {
                // The session survives the connection swap: created_at and
                // message_count carry over.
                let prior = std::mem::replace(&mut entry.handle, handle);
                entry.info.last_activity_at = now;
                if user_id.is_some() {
                    entry.info.user_id = user_id;
                }
                if prior.connection_id == entry.handle.connection_id {
                    return None;
                }
                self.stats.total_evictions += 1;
                Some(prior)
            }
            None => {
                self.entries.insert(
                    session_id.clone(),
                    Entry {
                        handle,
                        info: SessionInfo {
                            session_id,
                            user_id,
                            created_at: now,
                            last_activity_at: now,
                            message_count: 0,
                        },
                    },
                );
                None
            }
        }
    }

    /// Removes the mapping only while it still names `connection_id`, so an
    /// unbind from a superseded connection's close path is a no-op.
    fn unbind(&mut self, session_id: &str, connection_id: Uuid) -> bool {
        match self.entries.get(session_id) {
            Some(entry) if entry.handle.connection_id == connection_id => {
                self.entries.remove(session_id);
                true
            }
            _ => false,
        }
    }

    fn touch(&mut self, session_id: &str) {
        if let Some(entry) = self.entries.get_mut(session_id) {
            entry.info.last_activity_at = Utc::now();
            entry.info.message_count += 1;
            self.stats.total_messages += 1;
        }
    }

    fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.entries.len(),
            ..self.stats
        }
    }
}

/// Cheaply cloneable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    pub fn spawn(cancel: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<Command>(256);

        tokio::spawn(async move {
            let mut registry = Registry::new();

            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(cmd) => registry_dispatch(&mut registry, cmd),
                            None => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            info!("Session registry stopped");
        });

        Self { tx }
    }

    /// Bind a connection to a session. Returns the prior connection's
    /// handle when one was live, so the caller can force-close it.
    pub async fn bind(
        &self,
        session_id: &str,
        user_id: Option<&str>,
        handle: ConnectionHandle,
    ) -> Result<Option<ConnectionHandle>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Bind {
            session_id: session_id.to_string(),
            user_id: user_id.map(String::from),
            handle,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| GatewayError::Internal("registry dropped reply".to_string()))
    }

    /// Remove the binding if it still names `connection_id`.
    pub async fn unbind(
        &self,
        session_id: &str,
        connection_id: Uuid,
    ) -> Result<bool, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unbind {
            session_id: session_id.to_string(),
            connection_id,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| GatewayError::Internal("registry dropped reply".to_string()))
    }

    pub async fn lookup(&self, session_id: &str) -> Result<Option<ConnectionHandle>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Lookup {
            session_id: session_id.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| GatewayError::Internal("registry dropped reply".to_string()))
    }

    /// Record one accepted message on the session.
    pub async fn touch(&self, session_id: &str) -> Result<(), GatewayError> {
        self.send(Command::Touch {
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Deliver a frame to the session's currently bound connection.
    /// `Ok(false)` means no live socket, which is a normal state for
    /// unsolicited producers, not an error.
    pub async fn push_to_session(
        &self,
        session_id: &str,
        frame: ServerFrame,
    ) -> Result<bool, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Push {
            session_id: session_id.to_string(),
            frame,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| GatewayError::Internal("registry dropped reply".to_string()))
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionInfo>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetSession {
            session_id: session_id.to_string(),
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| GatewayError::Internal("registry dropped reply".to_string()))
    }

    pub async fn stats(&self) -> Result<RegistryStats, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await
            .map_err(|_| GatewayError::Internal("registry dropped reply".to_string()))
    }

    async fn send(&self, cmd: Command) -> Result<(), GatewayError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| GatewayError::Internal("session registry unavailable".to_string()))
    }
}

fn registry_dispatch(registry: &mut Registry, cmd: Command) {
    match cmd {
        Command::Bind {
            session_id,
            user_id,
            handle,
            reply,
        } => {
            let connection_id = handle.connection_id;
            let prior = registry.bind(session_id.clone(), user_id, handle);
            if let Some(ref prior) = prior {
                info!(
                    session_id = %session_id,
                    new_connection = %connection_id,
                    prior_connection = %prior.connection_id,
                    "session rebound, prior connection superseded"
                );
            } else {
                debug!(session_id = %session_id, connection_id = %connection_id, "session bound");
            }
            let _ = reply.send(prior);
        }
        Command::Unbind {
            session_id,
            connection_id,
            reply,
        } => {
            let removed = registry.unbind(&session_id, connection_id);
            if removed {
                debug!(session_id = %session_id, connection_id = %connection_id, "session unbound");
            }
            let _ = reply.send(removed);
        }
        Command::Lookup { session_id, reply } => {
            let handle = registry.entries.get(&session_id).map(|e| e.handle.clone());
            let _ = reply.send(handle);
        }
        Command::Touch { session_id } => {
            registry.touch(&session_id);
        }
        Command::Push {
            session_id,
            frame,
            reply,
        } => {
            let delivered = registry
                .entries
                .get(&session_id)
                .map(|e| e.handle.send_frame(&frame))
                .unwrap_or(false);
            let _ = reply.send(delivered);
        }
        Command::GetSession { session_id, reply } => {
            let info = registry.entries.get(&session_id).map(|e| e.info.clone());
            let _ = reply.send(info);
        }
        Command::Stats { reply } => {
            let _ = reply.send(registry.stats());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle::new(Uuid::new_v4(), tx, CancellationToken::new()),
            rx,
        )
    }

    fn spawn_registry() -> (RegistryHandle, CancellationToken) {
        let cancel = CancellationToken::new();
        (RegistryHandle::spawn(cancel.clone()), cancel)
    }

    #[tokio::test]
    async fn first_bind_returns_no_prior() {
        let (registry, _cancel) = spawn_registry();
        let (handle, _rx) = make_handle();

        let prior = registry.bind("s1", Some("u1"), handle).await.unwrap();
        assert!(prior.is_none());

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn rebind_returns_prior_handle() {
        let (registry, _cancel) = spawn_registry();
        let (first, _rx1) = make_handle();
        let first_id = first.connection_id;
        let (second, _rx2) = make_handle();

        registry.bind("s1", None, first).await.unwrap();
        let prior = registry.bind("s1", None, second).await.unwrap();

        assert_eq!(prior.unwrap().connection_id, first_id);
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_evictions, 1);
    }

    #[tokio::test]
    async fn rebind_preserves_session_metadata() {
        let (registry, _cancel) = spawn_registry();
        let (first, _rx1) = make_handle();
        registry.bind("s1", Some("u1"), first).await.unwrap();
        registry.touch("s1").await.unwrap();

        let before = registry.get_session("s1").await.unwrap().unwrap();
        let (second, _rx2) = make_handle();
        registry.bind("s1", None, second).await.unwrap();

        let after = registry.get_session("s1").await.unwrap().unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.message_count, 1);
        assert_eq!(after.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn unbind_of_superseded_connection_is_noop() {
        let (registry, _cancel) = spawn_registry();
        let (first, _rx1) = make_handle();
        let first_id = first.connection_id;
        let (second, _rx2) = make_handle();
        let second_id = second.connection_id;

        registry.bind("s1", None, first).await.unwrap();
        registry.bind("s1", None, second).await.unwrap();

        // The superseded connection's close path must not evict the winner.
        assert!(!registry.unbind("s1", first_id).await.unwrap());
        assert!(registry.lookup("s1").await.unwrap().is_some());

        assert!(registry.unbind("s1", second_id).await.unwrap());
        assert!(registry.lookup("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_binds_leave_exactly_one_connection() {
        let (registry, _cancel) = spawn_registry();
        let n = 16;

        let mut tasks = Vec::new();
        for _ in 0..n {
            let registry = registry.clone();
            let (handle, rx) = make_handle();
            let id = handle.connection_id;
            tasks.push(tokio::spawn(async move {
                let prior = registry.bind("s1", None, handle).await.unwrap();
                (id, prior, rx)
            }));
        }

        let mut evicted = 0;
        let mut ids = Vec::new();
        for task in tasks {
            let (id, prior, _rx) = task.await.unwrap();
            ids.push(id);
            if prior.is_some() {
                evicted += 1;
            }
        }

        // N binds, N-1 of them superseded someone.
        assert_eq!(evicted, n - 1);
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.total_evictions, (n - 1) as u64);

        // The surviving connection is one of ours.
        let bound = registry.lookup("s1").await.unwrap().unwrap();
        assert!(ids.contains(&bound.connection_id));
    }

    #[tokio::test]
    async fn push_delivers_to_bound_connection() {
        let (registry, _cancel) = spawn_registry();
        let (handle, mut rx) = make_handle();
        registry.bind("s1", None, handle).await.unwrap();

        let delivered = registry
            .push_to_session(
                "s1",
                ServerFrame::SportsUpdate {
                    session_id: "s1".to_string(),
                    update_type: "odds_change".to_string(),
                    data: serde_json::json!({"match_id": "42"}),
                },
            )
            .await
            .unwrap();
        assert!(delivered);

        let msg = rx.recv().await.unwrap();
        let json: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "sports_update");
        assert_eq!(json["data"]["match_id"], "42");
    }

    #[tokio::test]
    async fn push_to_unbound_session_is_false_not_error() {
        let (registry, _cancel) = spawn_registry();
        let delivered = registry
            .push_to_session("nobody-home", ServerFrame::pong("nobody-home"))
            .await
            .unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn touch_updates_activity_and_count() {
        let (registry, _cancel) = spawn_registry();
        let (handle, _rx) = make_handle();
        registry.bind("s1", None, handle).await.unwrap();

        registry.touch("s1").await.unwrap();
        registry.touch("s1").await.unwrap();

        let info = registry.get_session("s1").await.unwrap().unwrap();
        assert_eq!(info.message_count, 2);
        assert!(info.last_activity_at >= info.created_at);

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.total_messages, 2);
    }
}
