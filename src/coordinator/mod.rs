//! Boundary to the Conversation Coordinator collaborator.
//!
//! The gateway never interprets message content; once a message survives
//! dedup it is handed across this trait exactly once. The collaborator owns
//! its own conversation memory and context.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoordinatorError;

/// A reply from the conversation engine.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorReply {
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CoordinatorReply {
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Turns one validated, deduplicated message into a response. Invoked once
/// per accepted message; expected to be stateless with respect to this
/// layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationCoordinator: Send + Sync {
    async fn handle<'a>(
        &self,
        session_id: &str,
        user_id: Option<&'a str>,
        content: &str,
    ) -> Result<CoordinatorReply, CoordinatorError>;
}

/// Invoke the coordinator under a deadline. A timeout is a downstream
/// fault, not a connection fault: the caller reports it over the same
/// connection and keeps the socket open.
pub async fn call_with_timeout(
    coordinator: &dyn ConversationCoordinator,
    timeout: Duration,
    session_id: &str,
    user_id: Option<&str>,
    content: &str,
) -> Result<CoordinatorReply, CoordinatorError> {
    match tokio::time::timeout(timeout, coordinator.handle(session_id, user_id, content)).await {
        Ok(result) => result,
        Err(_) => Err(CoordinatorError::Timeout),
    }
}

/// Placeholder coordinator for the standalone binary: echoes the message
/// back. The real conversation engine is wired in by the embedding service.
pub struct EchoCoordinator;

#[async_trait]
impl ConversationCoordinator for EchoCoordinator {
    async fn handle<'a>(
        &self,
        _session_id: &str,
        _user_id: Option<&'a str>,
        content: &str,
    ) -> Result<CoordinatorReply, CoordinatorError> {
        Ok(CoordinatorReply::from_content(format!("Echo: {}", content)))
    }
}
