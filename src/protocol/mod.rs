//! WebSocket frame types for the ChatBet gateway.
//!
//! Every frame is a closed tagged variant: unknown `type` strings fail to
//! parse and are reported as `MALFORMED_MESSAGE`, never silently ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ProtocolError};

/// Upper bound for `user_message` content length, in characters.
pub const MAX_CONTENT_LEN: usize = 4000;

/// Features advertised in `connection_ack`.
pub const SUPPORTED_FEATURES: &[&str] = &[
    "streaming_responses",
    "typing_indicators",
    "sports_updates",
    "ping_pong",
];

/// Notice sent in place of a second answer when a content-level duplicate
/// arrives inside the short dedup window.
pub const STILL_PROCESSING_NOTICE: &str =
    "I'm still working on that message, one moment.";

/// Frames the client sends to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    UserMessage {
        message_id: String,
        content: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    Ping {
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
    },
}

impl ClientFrame {
    /// Parse a raw text frame. Unknown frame kinds and shape mismatches
    /// both surface as `MalformedFrame`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: ClientFrame = serde_json::from_str(text)
            .map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if let ClientFrame::UserMessage {
            message_id, content, ..
        } = self
        {
            if message_id.trim().is_empty() {
                return Err(ProtocolError::MissingField("message_id"));
            }
            if content.trim().is_empty() {
                return Err(ProtocolError::EmptyContent);
            }
            let len = content.chars().count();
            if len > MAX_CONTENT_LEN {
                return Err(ProtocolError::ContentTooLong {
                    len,
                    limit: MAX_CONTENT_LEN,
                });
            }
        }
        Ok(())
    }
}

/// Frames the server sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionAck {
        session_id: String,
        server_time: DateTime<Utc>,
        supported_features: Vec<String>,
    },
    BotResponse {
        message_id: String,
        content: String,
        session_id: String,
        response_time_ms: u64,
    },
    StreamingResponse {
        message_id: String,
        content: String,
        session_id: String,
        chunk_index: u32,
        is_final: bool,
    },
    Typing {
        session_id: String,
        is_typing: bool,
    },
    Error {
        content: String,
        error_code: ErrorCode,
        session_id: String,
    },
    Pong {
        session_id: String,
    },
    SportsUpdate {
        session_id: String,
        update_type: String,
        data: serde_json::Value,
    },
}

impl ServerFrame {
    pub fn connection_ack(session_id: &str) -> Self {
        ServerFrame::ConnectionAck {
            session_id: session_id.to_string(),
            server_time: Utc::now(),
            supported_features: SUPPORTED_FEATURES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn error(session_id: &str, error_code: ErrorCode, content: impl Into<String>) -> Self {
        ServerFrame::Error {
            content: content.into(),
            error_code,
            session_id: session_id.to_string(),
        }
    }

    pub fn typing(session_id: &str, is_typing: bool) -> Self {
        ServerFrame::Typing {
            session_id: session_id.to_string(),
            is_typing,
        }
    }

    pub fn pong(session_id: &str) -> Self {
        ServerFrame::Pong {
            session_id: session_id.to_string(),
        }
    }

    /// The "still working on that" notice for content-level duplicates.
    /// Not an error frame: duplicate outcomes are normal, not faults.
    pub fn still_processing(session_id: &str, message_id: &str) -> Self {
        ServerFrame::BotResponse {
            message_id: message_id.to_string(),
            content: STILL_PROCESSING_NOTICE.to_string(),
            session_id: session_id.to_string(),
            response_time_ms: 0,
        }
    }
}
