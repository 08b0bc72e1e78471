use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Downstream error: {0}")]
    Downstream(#[from] CoordinatorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

// Add conversion from std::io::Error
impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::Transport(err.to_string())
    }
}

/// Faults in what the peer sent. These are reported back over the same
/// connection and never close it.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    MalformedFrame(String),

    #[error("Message content is empty")]
    EmptyContent,

    #[error("Message content exceeds {limit} characters (got {len})")]
    ContentTooLong { len: usize, limit: usize },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Failures from the Conversation Coordinator collaborator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Coordinator call timed out")]
    Timeout,

    #[error("Coordinator call failed: {0}")]
    Failed(String),
}

/// Wire-visible error codes carried in `error` frames.
///
/// `TRANSPORT_ERROR` is only ever produced by the client-side reconnection
/// controller; the server never surfaces transport faults as chat content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedMessage,
    SessionConflict,
    Duplicate,
    TransportError,
    DownstreamError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::MalformedMessage => "MALFORMED_MESSAGE",
            ErrorCode::SessionConflict => "SESSION_CONFLICT",
            ErrorCode::Duplicate => "DUPLICATE",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::DownstreamError => "DOWNSTREAM_ERROR",
        };
        f.write_str(s)
    }
}
